//! Core records for catch-up tracking
//!
//! `CandidateEntry` is the only persisted record. `Observation` and
//! `RawEpisodeEvent` are transient and exist only inside one run.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// User label all system-driven observations collapse to
pub const RECENTLY_ADDED_USER: &str = "Recently Added";

/// Labels the media server and the recently-added feed use for the same actor
const SYSTEM_USER_ALIASES: &[&str] = &[
    "recently added",
    "recently_added",
    "recent_added",
    "recentlyadded",
    "system",
    "__system__",
    "最近添加",
];

/// Identity of a tracked series-season within one server scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateKey {
    pub series_id: String,
    pub season: i32,
}

impl CandidateKey {
    pub fn new(series_id: impl Into<String>, season: i32) -> Self {
        Self {
            series_id: series_id.into(),
            season,
        }
    }

    /// Key used for the persisted mapping (`series_id:season`)
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.series_id, self.season)
    }

    /// Parse a `series_id:season` key; series ids may themselves contain `:`
    pub fn parse_storage_key(raw: &str) -> Option<Self> {
        let (series_id, season) = raw.rsplit_once(':')?;
        let series_id = series_id.trim();
        let season: i32 = season.trim().parse().ok()?;
        if series_id.is_empty() || season < 1 {
            return None;
        }
        Some(Self::new(series_id, season))
    }
}

impl fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} S{:02}", self.series_id, self.season)
    }
}

/// Discovery stream an observation came from
///
/// Ordered by authority over user attribution and playback progress:
/// resume outranks history, which outranks recently added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    Resume,
    History,
    RecentAdded,
}

impl DiscoverySource {
    /// All sources, most authoritative first
    pub const BY_AUTHORITY: [DiscoverySource; 3] = [
        DiscoverySource::Resume,
        DiscoverySource::History,
        DiscoverySource::RecentAdded,
    ];

    pub fn authority(self) -> u8 {
        match self {
            DiscoverySource::Resume => 3,
            DiscoverySource::History => 2,
            DiscoverySource::RecentAdded => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DiscoverySource::Resume => "resume",
            DiscoverySource::History => "history",
            DiscoverySource::RecentAdded => "recent_added",
        }
    }
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `name` is one of the labels for the system actor
pub fn is_system_user(name: &str) -> bool {
    SYSTEM_USER_ALIASES.contains(&name.trim().to_lowercase().as_str())
}

/// Normalize a user label so system actors and their aliases share one label
pub fn normalize_user(raw: Option<&str>, source: DiscoverySource) -> Option<String> {
    let trimmed = raw.map(str::trim).filter(|s| !s.is_empty());
    match trimmed {
        Some(name) if is_system_user(name) => {
            Some(RECENTLY_ADDED_USER.to_string())
        }
        Some(name) => Some(name.to_string()),
        None if source == DiscoverySource::RecentAdded => Some(RECENTLY_ADDED_USER.to_string()),
        None => None,
    }
}

/// One per-episode event as reported by a discovery source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEpisodeEvent {
    pub item_id: Option<String>,
    pub series_id: Option<String>,
    pub series_name: Option<String>,
    pub episode_name: Option<String>,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub year: Option<i32>,
    pub user: Option<String>,
    /// Raw timestamp as sent by the media server
    pub last_played: Option<String>,
    pub playback_ticks: Option<i64>,
    /// Filesystem path of the item, used for library exclusion
    pub path: Option<String>,
}

impl RawEpisodeEvent {
    /// Short description for log lines
    pub fn describe(&self) -> String {
        format!(
            "title={} episode={} S{}E{} item_id={}",
            self.series_name.as_deref().unwrap_or("unknown"),
            self.episode_name.as_deref().unwrap_or("-"),
            self.season.map(|s| s.to_string()).unwrap_or_else(|| "?".into()),
            self.episode.map(|e| e.to_string()).unwrap_or_else(|| "?".into()),
            self.item_id.as_deref().unwrap_or("-"),
        )
    }
}

/// Deduplicated per-(series, season) reduction of one source's events
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub series_id: String,
    pub season: i32,
    pub episode: Option<i32>,
    pub series_name: Option<String>,
    pub year: Option<i32>,
    pub last_played: Option<DateTime<Utc>>,
    pub playback_ticks: i64,
    pub user: Option<String>,
    pub source: DiscoverySource,
}

impl Observation {
    pub fn key(&self) -> CandidateKey {
        CandidateKey::new(self.series_id.clone(), self.season)
    }
}

/// Persisted tracking state for one series-season in one server scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntry {
    pub series_id: String,
    pub season: i32,
    #[serde(default)]
    pub series_name: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub media_type_label: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    /// Source that last set `user` and the progress fields
    #[serde(default)]
    pub attributed_to: Option<DiscoverySource>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_played: Option<DateTime<Utc>>,
    #[serde(default)]
    pub playback_ticks: Option<i64>,
    #[serde(default)]
    pub last_track_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_track_next_episode: Option<String>,
    #[serde(default)]
    pub last_track_result: Option<String>,
    /// Earliest local minute of day a download succeeded on air day (0-1439)
    #[serde(default)]
    pub learned_hit_minutes: Option<u16>,
    #[serde(default)]
    pub next_track_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: bool,
}

impl CandidateEntry {
    /// Fresh entry with only identity set
    pub fn new(key: &CandidateKey) -> Self {
        Self {
            series_id: key.series_id.clone(),
            season: key.season,
            series_name: None,
            year: None,
            media_type_label: None,
            user: None,
            attributed_to: None,
            last_seen_at: None,
            last_played: None,
            playback_ticks: None,
            last_track_at: None,
            last_track_next_episode: None,
            last_track_result: None,
            learned_hit_minutes: None,
            next_track_at: None,
            pinned: false,
        }
    }

    pub fn key(&self) -> CandidateKey {
        CandidateKey::new(self.series_id.clone(), self.season)
    }

    /// Identity fields must be usable for the entry to survive a load
    pub fn has_valid_identity(&self) -> bool {
        !self.series_id.trim().is_empty() && self.season >= 1
    }

    pub fn display_name(&self) -> &str {
        self.series_name.as_deref().unwrap_or(&self.series_id)
    }
}

/// Broad media kind returned by the recognizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Tv,
    Movie,
}

impl MediaKind {
    pub fn label(self) -> &'static str {
        match self {
            MediaKind::Tv => "TV",
            MediaKind::Movie => "Movie",
        }
    }
}

/// Next episode the metadata provider expects to air
///
/// The air date is date-only; providers do not give a time of day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextEpisodeHint {
    pub season: i32,
    pub episode: i32,
    pub air_date: Option<NaiveDate>,
}

impl NextEpisodeHint {
    /// Identity of this hint, compared across attempts to detect a serviced window
    pub fn fingerprint(&self) -> String {
        match self.air_date {
            Some(date) => format!("S{}E{}@{}", self.season, self.episode, date),
            None => format!("S{}E{}", self.season, self.episode),
        }
    }
}
