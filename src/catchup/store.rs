//! Durable pool, pin and report state on top of a key/value store

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::pins::{PinRegistry, scope_name};
use super::pool::CandidatePool;
use super::report::RunReport;
use crate::db::KeyValueStore;

const POOL_KEY_PREFIX: &str = "catchup.pool.";
const PINS_KEY: &str = "catchup.pins";
const SERVERS_KEY: &str = "catchup.servers";
const REPORT_KEY: &str = "catchup.last_report";

/// Typed access to the catch-up state stored under fixed keys
#[derive(Clone)]
pub struct CatchupStore {
    kv: Arc<dyn KeyValueStore>,
}

impl CatchupStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn pool_key(server: &str) -> String {
        format!("{}{}", POOL_KEY_PREFIX, scope_name(server))
    }

    /// Pool for `server`, empty when nothing was saved yet
    pub async fn load_pool(&self, server: &str) -> Result<CandidatePool> {
        let scope = scope_name(server);
        let Some(snapshot) = self.kv.get(&Self::pool_key(&scope)).await? else {
            debug!(job = "catchup", server = %scope, "No saved pool, starting empty");
            return Ok(CandidatePool::new(scope));
        };

        let (pool, dropped) = CandidatePool::from_snapshot(&scope, &snapshot);
        if dropped > 0 {
            warn!(job = "catchup", server = %scope, dropped, "Dropped malformed pool entries on load");
        }
        Ok(pool)
    }

    /// Replace the saved snapshot and remember the scope
    pub async fn save_pool(&self, pool: &CandidatePool) -> Result<()> {
        self.kv
            .set(&Self::pool_key(pool.server()), pool.to_snapshot())
            .await
            .with_context(|| format!("Failed to save pool for server '{}'", pool.server()))?;
        self.register_server(pool.server()).await
    }

    pub async fn delete_pool(&self, server: &str) -> Result<bool> {
        self.kv.delete(&Self::pool_key(server)).await
    }

    /// Every scope that has ever saved a pool
    pub async fn known_servers(&self) -> Result<BTreeSet<String>> {
        let Some(value) = self.kv.get(SERVERS_KEY).await? else {
            return Ok(BTreeSet::new());
        };
        match serde_json::from_value::<BTreeSet<String>>(value) {
            Ok(servers) => Ok(servers),
            Err(e) => {
                warn!(job = "catchup", error = %e, "Known server index is malformed, ignoring it");
                Ok(BTreeSet::new())
            }
        }
    }

    async fn register_server(&self, server: &str) -> Result<()> {
        let mut servers = self.known_servers().await?;
        if servers.insert(scope_name(server)) {
            self.kv
                .set(SERVERS_KEY, serde_json::to_value(&servers)?)
                .await
                .context("Failed to update known server index")?;
        }
        Ok(())
    }

    /// Saved pins; a malformed document is treated as empty
    pub async fn load_pins(&self) -> Result<PinRegistry> {
        let Some(value) = self.kv.get(PINS_KEY).await? else {
            return Ok(PinRegistry::default());
        };
        match serde_json::from_value(value) {
            Ok(pins) => Ok(pins),
            Err(e) => {
                warn!(job = "catchup", error = %e, "Pin registry is malformed, starting empty");
                Ok(PinRegistry::default())
            }
        }
    }

    pub async fn save_pins(&self, pins: &PinRegistry) -> Result<()> {
        self.kv
            .set(PINS_KEY, serde_json::to_value(pins)?)
            .await
            .context("Failed to save pin registry")
    }

    pub async fn save_report(&self, report: &RunReport) -> Result<()> {
        self.kv
            .set(REPORT_KEY, serde_json::to_value(report)?)
            .await
            .context("Failed to save run report")
    }

    pub async fn load_report(&self) -> Result<Option<RunReport>> {
        let value: Option<JsonValue> = self.kv.get(REPORT_KEY).await?;
        Ok(value.and_then(|v| serde_json::from_value(v).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catchup::model::{CandidateEntry, CandidateKey};
    use crate::catchup::pins::ServerSelector;
    use crate::db::MemoryKvStore;
    use serde_json::json;

    fn store() -> (Arc<MemoryKvStore>, CatchupStore) {
        let kv = Arc::new(MemoryKvStore::new());
        (kv.clone(), CatchupStore::new(kv))
    }

    #[tokio::test]
    async fn test_missing_pool_loads_empty() {
        let (_, store) = store();
        let pool = store.load_pool("Home").await.unwrap();
        assert!(pool.is_empty());
        assert_eq!(pool.server(), "home");
    }

    #[tokio::test]
    async fn test_pool_save_registers_scope() {
        let (_, store) = store();
        let mut pool = CandidatePool::new("home");
        pool.insert(CandidateEntry::new(&CandidateKey::new("a", 1)));
        store.save_pool(&pool).await.unwrap();

        let loaded = store.load_pool("HOME").await.unwrap();
        assert_eq!(loaded, pool);
        assert_eq!(
            store.known_servers().await.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["home".to_string()]
        );

        assert!(store.delete_pool("home").await.unwrap());
        assert!(store.load_pool("home").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_pins_start_empty() {
        let (kv, store) = store();
        kv.set(PINS_KEY, json!("garbage")).await.unwrap();
        assert!(store.load_pins().await.unwrap().is_empty());

        let mut pins = PinRegistry::default();
        pins.add(&ServerSelector::Any, CandidateKey::new("a", 1));
        store.save_pins(&pins).await.unwrap();
        assert_eq!(store.load_pins().await.unwrap(), pins);
    }
}
