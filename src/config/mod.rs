//! Catch-up configuration management

use std::env;

use chrono_tz::Tz;
use tracing::warn;

use crate::catchup::airtime::AirtimeGate;
use crate::catchup::filters::{LibraryExclusionRule, UserFilter};
use crate::catchup::pins::KeyRule;
use crate::catchup::tier::{MAX_INTERVAL_HOURS, MAX_INTERVAL_MINUTES, TierIntervals};
use crate::services::DiscoveryFilters;

/// Zone used when the configured one cannot be resolved
pub const DEFAULT_TIME_ZONE: Tz = chrono_tz::Asia::Shanghai;

/// Catch-up configuration loaded from `CATCHUP_*` environment variables
#[derive(Debug, Clone)]
pub struct CatchupConfig {
    /// Master switch; a disabled system schedules nothing and runs nothing
    pub enabled: bool,

    /// Media server scopes to process, in order
    pub servers: Vec<String>,

    /// SQLite url or path for the state database
    pub database_url: String,

    pub hot_interval_minutes: i64,
    pub warm_interval_minutes: i64,
    pub cold_interval_hours: i64,
    pub cold_enabled: bool,

    pub backfill_interval_hours: i64,

    /// Entries unseen for longer than this are pruned; 0 keeps everything
    pub retention_days: u32,

    pub airtime_enabled: bool,
    pub time_zone: Tz,
    pub buffer_minutes: i64,

    /// Comma-separated user names; empty allows everyone
    pub allow_users: String,
    /// Comma-separated user names to ignore
    pub deny_users: String,
    /// One `server:library` rule per line
    pub library_exclusions: String,

    /// Run one catch-up pass right after the scheduler starts
    pub run_once: bool,
    /// Discovery recency window; 0 disables it
    pub resume_days: u32,
    /// Per-feed event limit
    pub resume_limit: usize,
    /// Count backfill gaps without calling search/download
    pub backfill_stats_only: bool,

    /// `server:series_id:season` rules applied at startup
    pub pin_rules: String,
    pub unpin_rules: String,
    pub remove_rules: String,
    /// Drop every saved pool at startup
    pub clear_pool: bool,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl CatchupConfig {
    /// Load configuration from the process environment (and `.env` if present)
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).unwrap_or_default();
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| {
                    let v = v.trim().to_lowercase();
                    v == "true" || v == "1" || v == "yes" || v == "on"
                })
                .unwrap_or(default)
        };
        let number = |key: &str, default: i64| {
            lookup(key)
                .and_then(|v| match v.trim().parse::<i64>() {
                    Ok(n) => Some(n),
                    Err(_) => {
                        warn!(key = %key, value = %v, "Invalid number in configuration, using default");
                        None
                    }
                })
                .unwrap_or(default)
        };
        let bounded = |key: &str, default: i64, min: i64, max: i64| {
            let n = number(key, default);
            if n > max {
                warn!(key = %key, value = n, max, "Configured value too large, capping");
            }
            n.clamp(min, max)
        };

        let database_url = lookup("DATABASE_PATH")
            .or_else(|| lookup("DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/catchup.db".to_string());

        let servers = text("CATCHUP_SERVERS")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Self {
            enabled: flag("CATCHUP_ENABLED", false),
            servers,
            database_url,

            hot_interval_minutes: bounded("CATCHUP_HOT_INTERVAL_MINUTES", 10, 1, MAX_INTERVAL_MINUTES),
            warm_interval_minutes: bounded("CATCHUP_WARM_INTERVAL_MINUTES", 60, 1, MAX_INTERVAL_MINUTES),
            cold_interval_hours: bounded("CATCHUP_COLD_INTERVAL_HOURS", 6, 1, MAX_INTERVAL_HOURS),
            cold_enabled: flag("CATCHUP_COLD_ENABLED", true),

            backfill_interval_hours: bounded("CATCHUP_BACKFILL_INTERVAL_HOURS", 6, 1, MAX_INTERVAL_HOURS),

            retention_days: number("CATCHUP_RETENTION_DAYS", 30).clamp(0, i64::from(u32::MAX)) as u32,

            airtime_enabled: flag("CATCHUP_AIRTIME_ENABLED", true),
            time_zone: parse_time_zone(lookup("CATCHUP_TIME_ZONE").as_deref()),
            buffer_minutes: bounded("CATCHUP_BUFFER_MINUTES", 30, 0, MAX_INTERVAL_MINUTES),

            allow_users: text("CATCHUP_ALLOW_USERS"),
            deny_users: text("CATCHUP_DENY_USERS"),
            library_exclusions: text("CATCHUP_LIBRARY_EXCLUSIONS"),

            run_once: flag("CATCHUP_RUN_ONCE", false),
            resume_days: number("CATCHUP_RESUME_DAYS", 30).clamp(0, i64::from(u32::MAX)) as u32,
            resume_limit: number("CATCHUP_RESUME_LIMIT", 50).max(1) as usize,
            backfill_stats_only: flag("CATCHUP_BACKFILL_STATS_ONLY", false),

            pin_rules: text("CATCHUP_PIN_RULES"),
            unpin_rules: text("CATCHUP_UNPIN_RULES"),
            remove_rules: text("CATCHUP_REMOVE_RULES"),
            clear_pool: flag("CATCHUP_CLEAR_POOL", false),
        }
    }

    pub fn tier_intervals(&self) -> TierIntervals {
        TierIntervals::new(
            self.hot_interval_minutes,
            self.warm_interval_minutes,
            self.cold_interval_hours,
        )
    }

    pub fn airtime_gate(&self) -> AirtimeGate {
        AirtimeGate::new(
            self.airtime_enabled,
            self.time_zone,
            self.buffer_minutes,
            self.tier_intervals(),
        )
    }

    pub fn user_filter(&self) -> UserFilter {
        UserFilter::from_lists(&self.allow_users, &self.deny_users)
    }

    pub fn library_rules(&self) -> Vec<LibraryExclusionRule> {
        LibraryExclusionRule::parse_lines(&self.library_exclusions)
    }

    pub fn discovery_filters(&self) -> DiscoveryFilters {
        DiscoveryFilters {
            limit: self.resume_limit,
            recency_days: self.resume_days,
        }
    }

    pub fn pin_rules(&self) -> Vec<KeyRule> {
        KeyRule::parse_lines(&self.pin_rules)
    }

    pub fn unpin_rules(&self) -> Vec<KeyRule> {
        KeyRule::parse_lines(&self.unpin_rules)
    }

    pub fn remove_rules(&self) -> Vec<KeyRule> {
        KeyRule::parse_lines(&self.remove_rules)
    }
}

/// Resolve an IANA zone name, falling back to [`DEFAULT_TIME_ZONE`]
pub fn parse_time_zone(raw: Option<&str>) -> Tz {
    let Some(name) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_TIME_ZONE;
    };
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(time_zone = %name, fallback = %DEFAULT_TIME_ZONE, "Unknown time zone, using fallback");
            DEFAULT_TIME_ZONE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> CatchupConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CatchupConfig::from_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = CatchupConfig::default();
        assert!(!config.enabled);
        assert!(config.servers.is_empty());
        assert_eq!(config.hot_interval_minutes, 10);
        assert_eq!(config.warm_interval_minutes, 60);
        assert_eq!(config.cold_interval_hours, 6);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.resume_limit, 50);
        assert_eq!(config.time_zone, DEFAULT_TIME_ZONE);
        assert!(config.airtime_enabled);
    }

    #[test]
    fn test_overrides_and_lists() {
        let config = config(&[
            ("CATCHUP_ENABLED", "true"),
            ("CATCHUP_SERVERS", "home, ,Cabin"),
            ("CATCHUP_TIME_ZONE", "Europe/Berlin"),
            ("CATCHUP_HOT_INTERVAL_MINUTES", "5"),
            ("CATCHUP_PIN_RULES", "home:123:1\nbroken\n*:456:2"),
        ]);
        assert!(config.enabled);
        assert_eq!(config.servers, vec!["home".to_string(), "Cabin".to_string()]);
        assert_eq!(config.time_zone, chrono_tz::Europe::Berlin);
        assert_eq!(config.hot_interval_minutes, 5);
        assert_eq!(config.pin_rules().len(), 2);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = config(&[
            ("CATCHUP_TIME_ZONE", "Mars/Olympus"),
            ("CATCHUP_RETENTION_DAYS", "many"),
            ("CATCHUP_HOT_INTERVAL_MINUTES", "0"),
        ]);
        assert_eq!(config.time_zone, DEFAULT_TIME_ZONE);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.hot_interval_minutes, 1);
    }

    #[test]
    fn test_oversized_intervals_are_capped() {
        let config = config(&[
            ("CATCHUP_HOT_INTERVAL_MINUTES", "999999999999999999"),
            ("CATCHUP_COLD_INTERVAL_HOURS", "999999999999999999"),
            ("CATCHUP_BUFFER_MINUTES", "999999999999999999"),
        ]);
        assert_eq!(config.hot_interval_minutes, MAX_INTERVAL_MINUTES);
        assert_eq!(config.cold_interval_hours, MAX_INTERVAL_HOURS);
        assert_eq!(config.buffer_minutes, MAX_INTERVAL_MINUTES);

        let intervals = config.tier_intervals();
        assert_eq!(intervals.hot, chrono::Duration::minutes(MAX_INTERVAL_MINUTES));
        let _gate = config.airtime_gate();
    }
}
