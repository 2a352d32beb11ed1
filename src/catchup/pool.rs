//! Candidate pool
//!
//! In-memory form of one server scope's tracked series-seasons. A run loads
//! the full snapshot, mutates it here, and saves it back whole.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use super::model::{CandidateEntry, CandidateKey, Observation};
use super::pins::PinRegistry;
use super::tier::Tier;

/// User label given to stub entries created from a pin rule
pub const PINNED_STUB_USER: &str = "Pinned";

/// What an upsert did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    pub created: usize,
    pub updated: usize,
}

/// One row of the pool overview
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverviewRow {
    pub series_id: String,
    pub season: i32,
    pub series_name: String,
    pub user: Option<String>,
    pub tier: Tier,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub next_track_at: Option<DateTime<Utc>>,
    pub last_track_result: Option<String>,
}

/// Pool entries grouped for display
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolOverview {
    pub pinned: Vec<OverviewRow>,
    pub tiers: BTreeMap<Tier, Vec<OverviewRow>>,
}

/// Tracked series-seasons for one server scope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidatePool {
    server: String,
    entries: BTreeMap<CandidateKey, CandidateEntry>,
}

impl CandidatePool {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Rebuild from a persisted snapshot, skipping malformed entries
    ///
    /// Returns the pool and the number of entries dropped.
    pub fn from_snapshot(server: &str, snapshot: &JsonValue) -> (Self, usize) {
        let mut pool = Self::new(server);
        let Some(object) = snapshot.as_object() else {
            warn!(job = "catchup", server = %server, "Pool snapshot is not an object, starting empty");
            return (pool, 0);
        };

        let mut dropped = 0;
        for (raw_key, raw_entry) in object {
            match serde_json::from_value::<CandidateEntry>(raw_entry.clone()) {
                Ok(entry) if entry.has_valid_identity() => {
                    pool.entries.insert(entry.key(), entry);
                }
                Ok(_) => {
                    dropped += 1;
                    debug!(job = "catchup", key = %raw_key, "Dropping pool entry without identity");
                }
                Err(e) => {
                    dropped += 1;
                    debug!(job = "catchup", key = %raw_key, error = %e, "Dropping malformed pool entry");
                }
            }
        }
        (pool, dropped)
    }

    /// Snapshot keyed by `series_id:season`
    pub fn to_snapshot(&self) -> JsonValue {
        let mut object = Map::new();
        for (key, entry) in &self.entries {
            match serde_json::to_value(entry) {
                Ok(value) => {
                    object.insert(key.storage_key(), value);
                }
                Err(e) => warn!(job = "catchup", key = %key, error = %e, "Failed to serialize pool entry"),
            }
        }
        JsonValue::Object(object)
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &CandidateKey) -> Option<&CandidateEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &CandidateKey) -> Option<&mut CandidateEntry> {
        self.entries.get_mut(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CandidateEntry> {
        self.entries.values()
    }

    pub fn keys(&self) -> Vec<CandidateKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn insert(&mut self, entry: CandidateEntry) {
        self.entries.insert(entry.key(), entry);
    }

    pub fn remove(&mut self, key: &CandidateKey) -> Option<CandidateEntry> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Fold observations from one source into the pool
    ///
    /// `last_seen_at` always advances to `now`; display metadata only fills
    /// gaps; user attribution and playback progress are overwritten only by a
    /// source of equal or higher authority (equal authority needs a playback
    /// time that is not older).
    pub fn upsert(&mut self, observations: &[Observation], now: DateTime<Utc>) -> UpsertStats {
        let mut stats = UpsertStats::default();
        for observation in observations {
            let key = observation.key();
            let Some(entry) = self.entries.get_mut(&key) else {
                let mut entry = CandidateEntry::new(&key);
                entry.series_name = observation.series_name.clone();
                entry.year = observation.year;
                entry.user = observation.user.clone();
                entry.attributed_to = Some(observation.source);
                entry.last_played = observation.last_played;
                entry.playback_ticks = Some(observation.playback_ticks);
                entry.last_seen_at = Some(now);
                self.entries.insert(key, entry);
                stats.created += 1;
                continue;
            };

            entry.last_seen_at = Some(now);
            if entry.series_name.is_none() {
                entry.series_name = observation.series_name.clone();
            }
            if entry.year.is_none() {
                entry.year = observation.year;
            }

            let incoming = observation.source.authority();
            let current = entry.attributed_to.map(|s| s.authority()).unwrap_or(0);
            let fresher = match (observation.last_played, entry.last_played) {
                (Some(new), Some(old)) => new >= old,
                (None, Some(_)) => false,
                _ => true,
            };
            if incoming > current || (incoming == current && fresher) {
                if observation.user.is_some() {
                    entry.user = observation.user.clone();
                }
                if observation.last_played.is_some() {
                    entry.last_played = observation.last_played;
                }
                entry.playback_ticks = Some(observation.playback_ticks);
                entry.attributed_to = Some(observation.source);
            }
            stats.updated += 1;
        }
        stats
    }

    /// Sync `pinned` flags from the registry and create stubs for pinned keys not tracked yet
    pub fn apply_pins(&mut self, pins: &PinRegistry, now: DateTime<Utc>) -> usize {
        let pinned = pins.pinned_keys(&self.server);
        for entry in self.entries.values_mut() {
            entry.pinned = pinned.contains(&entry.key());
        }

        let mut created = 0;
        for key in pinned {
            if self.entries.contains_key(&key) {
                continue;
            }
            let mut entry = CandidateEntry::new(&key);
            entry.user = Some(PINNED_STUB_USER.to_string());
            entry.last_seen_at = Some(now);
            entry.pinned = true;
            self.entries.insert(key, entry);
            created += 1;
        }
        created
    }

    /// Evict entries not seen within `retention_days`; pinned entries always stay
    ///
    /// A retention of 0 disables eviction. Returns the removed keys.
    pub fn prune(
        &mut self,
        retention_days: u32,
        pins: &PinRegistry,
        now: DateTime<Utc>,
    ) -> Vec<CandidateKey> {
        let server = self.server.clone();
        for (key, entry) in self.entries.iter_mut() {
            entry.pinned = pins.is_pinned(&server, key);
        }
        if retention_days == 0 {
            return Vec::new();
        }

        let retention = Duration::days(i64::from(retention_days));
        let expired: Vec<CandidateKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.pinned)
            .filter(|(_, entry)| match entry.last_seen_at {
                Some(seen) => now - seen > retention,
                None => true,
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    /// Group entries by tier for display
    pub fn overview(&self, now: DateTime<Utc>) -> PoolOverview {
        let mut overview = PoolOverview::default();
        for entry in self.entries.values() {
            let tier = Tier::classify(entry.last_seen_at, now);
            let row = OverviewRow {
                series_id: entry.series_id.clone(),
                season: entry.season,
                series_name: entry.display_name().to_string(),
                user: entry.user.clone(),
                tier,
                last_seen_at: entry.last_seen_at,
                next_track_at: entry.next_track_at,
                last_track_result: entry.last_track_result.clone(),
            };
            if entry.pinned {
                overview.pinned.push(row);
            } else {
                overview.tiers.entry(tier).or_default().push(row);
            }
        }
        overview
    }
}
