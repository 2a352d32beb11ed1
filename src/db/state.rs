//! Opaque key/value persistence for pools, pins and run reports
//!
//! Values are JSON documents. Each key is read and written whole; there are
//! no partial updates.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use sqlx::SqlitePool;
use tracing::warn;

/// Durable storage scoped by an arbitrary string key
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Value under `key`; an unreadable document reads as absent
    async fn get(&self, key: &str) -> Result<Option<JsonValue>>;

    /// Replace the value stored under `key`
    async fn set(&self, key: &str, value: JsonValue) -> Result<()>;

    /// Remove `key`; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// SQLite-backed store (table `catchup_state`)
#[derive(Clone)]
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT value FROM catchup_state WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("Failed to read state key '{}'", key))?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                // Overwritten by the next save
                warn!(key = %key, error = %e, "State key holds invalid JSON, treating as absent");
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: JsonValue) -> Result<()> {
        let json_value = serde_json::to_string(&value)?;

        sqlx::query(
            r#"
            INSERT INTO catchup_state (key, value, updated_at)
            VALUES (?1, ?2, datetime('now'))
            ON CONFLICT (key) DO UPDATE SET
                value = ?2,
                updated_at = datetime('now')
            "#,
        )
        .bind(key)
        .bind(&json_value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write state key '{}'", key))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM catchup_state WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// In-process store, used by tests and hosts without a database
#[derive(Default)]
pub struct MemoryKvStore {
    values: RwLock<HashMap<String, JsonValue>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: JsonValue) -> Result<()> {
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.values.write().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    #[tokio::test]
    async fn test_sqlite_store_round_trip() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let store = db.state();

        assert_eq!(store.get("missing").await.unwrap(), None);

        store.set("pool", json!({"a": 1})).await.unwrap();
        store.set("pool", json!({"a": 2})).await.unwrap();
        assert_eq!(store.get("pool").await.unwrap(), Some(json!({"a": 2})));

        assert!(store.delete("pool").await.unwrap());
        assert!(!store.delete("pool").await.unwrap());
        assert_eq!(store.get("pool").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("state.db").display());

        let db = Database::connect(&url).await.unwrap();
        db.state().set("k", json!(["x"])).await.unwrap();
        db.pool().close().await;

        let reopened = Database::connect(&url).await.unwrap();
        assert_eq!(reopened.state().get("k").await.unwrap(), Some(json!(["x"])));
    }

    #[tokio::test]
    async fn test_corrupt_value_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("state.db").display());
        let db = Database::connect(&url).await.unwrap();

        sqlx::query("INSERT INTO catchup_state (key, value, updated_at) VALUES (?1, ?2, datetime('now'))")
            .bind("catchup.pool.home")
            .bind("{not json")
            .execute(db.pool())
            .await
            .unwrap();

        let store = db.state();
        assert_eq!(store.get("catchup.pool.home").await.unwrap(), None);

        store.set("catchup.pool.home", json!({"entries": {}})).await.unwrap();
        assert_eq!(
            store.get("catchup.pool.home").await.unwrap(),
            Some(json!({"entries": {}}))
        );
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryKvStore::new();
        store.set("k", json!(1)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
        assert!(store.delete("k").await.unwrap());
        assert!(store.is_empty());
    }
}
