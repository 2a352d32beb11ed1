//! Pin registry
//!
//! Pinned series-seasons skip tier filtering and are never evicted. Rules are
//! either scoped to one server or to every server (`*`); wildcard pins are
//! evaluated at lookup time, so scopes discovered later are covered too.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::model::CandidateKey;

const WILDCARD: &str = "*";

/// Error for one malformed rule line
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleParseError {
    #[error("rule line is empty")]
    Empty,
    #[error("rule '{0}' is not of the form 'server:series_id:season'")]
    MissingSeparator(String),
    #[error("rule '{0}' has an empty server")]
    EmptyServer(String),
    #[error("rule '{0}' has an empty series id")]
    EmptySeriesId(String),
    #[error("rule '{0}' has an invalid season")]
    InvalidSeason(String),
}

/// Server part of a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerSelector {
    Any,
    Named(String),
}

impl ServerSelector {
    pub fn named(server: &str) -> Self {
        ServerSelector::Named(scope_name(server))
    }

    pub fn matches(&self, server: &str) -> bool {
        match self {
            ServerSelector::Any => true,
            ServerSelector::Named(name) => *name == scope_name(server),
        }
    }

    fn overlaps(&self, other: &ServerSelector) -> bool {
        match (self, other) {
            (ServerSelector::Any, _) | (_, ServerSelector::Any) => true,
            (ServerSelector::Named(a), ServerSelector::Named(b)) => a == b,
        }
    }
}

impl fmt::Display for ServerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerSelector::Any => f.write_str(WILDCARD),
            ServerSelector::Named(name) => f.write_str(name),
        }
    }
}

/// `server:series_id:season` rule, used for pins and for explicit removals
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRule {
    pub server: ServerSelector,
    pub key: CandidateKey,
}

impl KeyRule {
    pub fn new(server: ServerSelector, series_id: impl Into<String>, season: i32) -> Self {
        Self {
            server,
            key: CandidateKey::new(series_id, season),
        }
    }

    pub fn parse(line: &str) -> Result<Self, RuleParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(RuleParseError::Empty);
        }
        let (server, rest) = line
            .split_once(':')
            .ok_or_else(|| RuleParseError::MissingSeparator(line.to_string()))?;
        let (series_id, season) = rest
            .rsplit_once(':')
            .ok_or_else(|| RuleParseError::MissingSeparator(line.to_string()))?;

        let server = server.trim();
        if server.is_empty() {
            return Err(RuleParseError::EmptyServer(line.to_string()));
        }
        let series_id = series_id.trim();
        if series_id.is_empty() {
            return Err(RuleParseError::EmptySeriesId(line.to_string()));
        }
        let season: i32 = season
            .trim()
            .parse()
            .ok()
            .filter(|s| *s >= 1)
            .ok_or_else(|| RuleParseError::InvalidSeason(line.to_string()))?;

        let selector = if server == WILDCARD {
            ServerSelector::Any
        } else {
            ServerSelector::named(server)
        };
        Ok(Self::new(selector, series_id, season))
    }

    /// Parse one rule per line, skipping (and logging) malformed lines
    pub fn parse_lines(raw: &str) -> Vec<Self> {
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| match Self::parse(line) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(job = "catchup", error = %e, "Ignoring malformed rule line");
                    None
                }
            })
            .collect()
    }

    pub fn matches(&self, server: &str, key: &CandidateKey) -> bool {
        self.server.matches(server) && self.key == *key
    }
}

impl fmt::Display for KeyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.server, self.key.series_id, self.key.season)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ServerPins {
    #[serde(default)]
    pinned: BTreeSet<CandidateKey>,
    /// Keys removed on this server while a wildcard pin still covers them
    #[serde(default)]
    excluded: BTreeSet<CandidateKey>,
}

/// Counts of effective changes from one management batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PinChanges {
    pub added: usize,
    pub removed: usize,
    pub overridden: usize,
}

/// Durable pin membership, per server plus wildcard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRegistry {
    #[serde(default)]
    wildcard: BTreeSet<CandidateKey>,
    #[serde(default)]
    servers: BTreeMap<String, ServerPins>,
}

impl PinRegistry {
    pub fn add(&mut self, server: &ServerSelector, key: CandidateKey) -> bool {
        match server {
            ServerSelector::Any => {
                for pins in self.servers.values_mut() {
                    pins.excluded.remove(&key);
                }
                self.wildcard.insert(key)
            }
            ServerSelector::Named(name) => {
                let pins = self.servers.entry(name.clone()).or_default();
                let lifted = pins.excluded.remove(&key);
                pins.pinned.insert(key) || lifted
            }
        }
    }

    pub fn remove(&mut self, server: &ServerSelector, key: &CandidateKey) -> bool {
        match server {
            ServerSelector::Any => {
                let mut changed = self.wildcard.remove(key);
                for pins in self.servers.values_mut() {
                    changed |= pins.pinned.remove(key);
                    pins.excluded.remove(key);
                }
                changed
            }
            ServerSelector::Named(name) => {
                let covered_by_wildcard = self.wildcard.contains(key);
                let pins = self.servers.entry(name.clone()).or_default();
                let mut changed = pins.pinned.remove(key);
                if covered_by_wildcard {
                    changed |= pins.excluded.insert(key.clone());
                }
                changed
            }
        }
    }

    pub fn is_pinned(&self, server: &str, key: &CandidateKey) -> bool {
        let pins = self.servers.get(&scope_name(server));
        let excluded = pins.is_some_and(|p| p.excluded.contains(key));
        let named = pins.is_some_and(|p| p.pinned.contains(key));
        (named || self.wildcard.contains(key)) && !excluded
    }

    /// Every key pinned for `server`, wildcard rules included
    pub fn pinned_keys(&self, server: &str) -> BTreeSet<CandidateKey> {
        let mut keys = self.wildcard.clone();
        if let Some(pins) = self.servers.get(&scope_name(server)) {
            keys.extend(pins.pinned.iter().cloned());
            keys.retain(|k| !pins.excluded.contains(k));
        }
        keys
    }

    pub fn clear_all(&mut self) {
        self.wildcard.clear();
        self.servers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.wildcard.is_empty() && self.servers.values().all(|p| p.pinned.is_empty())
    }

    /// Apply one management batch; removals win over adds for the same key
    pub fn apply(&mut self, adds: &[KeyRule], removes: &[KeyRule]) -> PinChanges {
        let mut changes = PinChanges::default();
        for rule in adds {
            let overridden = removes
                .iter()
                .any(|r| r.key == rule.key && r.server.overlaps(&rule.server));
            if overridden {
                changes.overridden += 1;
                continue;
            }
            if self.add(&rule.server, rule.key.clone()) {
                changes.added += 1;
            }
        }
        for rule in removes {
            if self.remove(&rule.server, &rule.key) {
                changes.removed += 1;
            }
        }
        changes
    }
}

/// Server scopes are matched case-insensitively
pub fn scope_name(server: &str) -> String {
    server.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_rules() {
        assert_eq!(
            KeyRule::parse("Home:tmdb:1399:2"),
            Ok(KeyRule::new(ServerSelector::named("home"), "tmdb:1399", 2))
        );
        assert_eq!(
            KeyRule::parse(" * : 42 : 1 "),
            Ok(KeyRule::new(ServerSelector::Any, "42", 1))
        );
        assert_matches!(KeyRule::parse("home:42"), Err(RuleParseError::MissingSeparator(_)));
        assert_matches!(KeyRule::parse("home:42:zero"), Err(RuleParseError::InvalidSeason(_)));
        assert_matches!(KeyRule::parse(":42:1"), Err(RuleParseError::EmptyServer(_)));
        assert_matches!(KeyRule::parse("home::1"), Err(RuleParseError::EmptySeriesId(_)));
        assert_matches!(KeyRule::parse("   "), Err(RuleParseError::Empty));
    }

    #[test]
    fn test_parse_lines_skips_bad_lines() {
        let rules = KeyRule::parse_lines("home:1:1\nnot a rule\n\n*:2:3");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].to_string(), "*:2:3");
    }

    #[test]
    fn test_named_pin_is_scoped() {
        let mut pins = PinRegistry::default();
        let key = CandidateKey::new("42", 1);
        pins.add(&ServerSelector::named("Home"), key.clone());
        assert!(pins.is_pinned("home", &key));
        assert!(pins.is_pinned(" HOME ", &key));
        assert!(!pins.is_pinned("office", &key));
    }

    #[test]
    fn test_wildcard_pin_covers_later_scopes() {
        let mut pins = PinRegistry::default();
        let key = CandidateKey::new("42", 1);
        pins.add(&ServerSelector::Any, key.clone());
        assert!(pins.is_pinned("never-seen-before", &key));
        assert!(pins.pinned_keys("another").contains(&key));
    }

    #[test]
    fn test_named_remove_masks_wildcard_pin() {
        let mut pins = PinRegistry::default();
        let key = CandidateKey::new("42", 1);
        pins.add(&ServerSelector::Any, key.clone());
        assert!(pins.remove(&ServerSelector::named("home"), &key));
        assert!(!pins.is_pinned("home", &key));
        assert!(pins.is_pinned("office", &key));

        pins.add(&ServerSelector::named("home"), key.clone());
        assert!(pins.is_pinned("home", &key));
    }

    #[test]
    fn test_wildcard_remove_clears_every_scope() {
        let mut pins = PinRegistry::default();
        let key = CandidateKey::new("42", 1);
        pins.add(&ServerSelector::named("home"), key.clone());
        pins.add(&ServerSelector::named("office"), key.clone());
        assert!(pins.remove(&ServerSelector::Any, &key));
        assert!(!pins.is_pinned("home", &key));
        assert!(!pins.is_pinned("office", &key));
        assert!(pins.is_empty());
    }

    #[test]
    fn test_removal_wins_within_batch() {
        let mut pins = PinRegistry::default();
        let adds = vec![
            KeyRule::new(ServerSelector::named("home"), "1", 1),
            KeyRule::new(ServerSelector::named("home"), "2", 1),
        ];
        let removes = vec![KeyRule::new(ServerSelector::Any, "1", 1)];
        let changes = pins.apply(&adds, &removes);
        assert_eq!(changes.added, 1);
        assert_eq!(changes.overridden, 1);
        assert!(!pins.is_pinned("home", &CandidateKey::new("1", 1)));
        assert!(pins.is_pinned("home", &CandidateKey::new("2", 1)));
    }

    #[test]
    fn test_clear_all() {
        let mut pins = PinRegistry::default();
        pins.add(&ServerSelector::Any, CandidateKey::new("1", 1));
        pins.add(&ServerSelector::named("home"), CandidateKey::new("2", 1));
        pins.clear_all();
        assert!(pins.is_empty());
        assert!(pins.pinned_keys("home").is_empty());
    }
}
