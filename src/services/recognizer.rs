//! Media recognition trait and series status reconciliation

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catchup::model::{MediaKind, NextEpisodeHint};

const ENDED_STATUSES: [&str; 5] = ["ended", "canceled", "cancelled", "完结", "已完结"];
const ACTIVE_STATUSES: [&str; 5] = ["continuing", "returning series", "upcoming", "更新中", "连载中"];

/// What the core knows about a tracked series when asking for recognition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRef {
    pub server: String,
    pub series_id: String,
    pub season: i32,
    pub series_name: Option<String>,
    pub year: Option<i32>,
}

/// Canonical identity returned by the recognizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaIdentity {
    pub kind: MediaKind,
    pub title: String,
    pub year: Option<i32>,
    /// Metadata provider id (TMDB or similar)
    pub provider_id: Option<String>,
    /// Status reported by the metadata provider
    pub status: Option<String>,
    /// Status reported by the media server; wins over `status` when recognised
    pub server_status: Option<String>,
    pub next_episode: Option<NextEpisodeHint>,
}

impl MediaIdentity {
    pub fn title_year(&self) -> String {
        match self.year {
            Some(year) => format!("{} ({})", self.title, year),
            None => self.title.clone(),
        }
    }

    /// Whether the series has finished airing
    ///
    /// A media-server status in either known set decides; otherwise the
    /// provider status is checked against the ended set.
    pub fn is_ended(&self) -> bool {
        if let Some(server) = self.server_status.as_deref().map(normalize_status) {
            if ENDED_STATUSES.contains(&server.as_str()) {
                return true;
            }
            if ACTIVE_STATUSES.contains(&server.as_str()) {
                return false;
            }
        }
        self.status
            .as_deref()
            .map(normalize_status)
            .is_some_and(|status| ENDED_STATUSES.contains(&status.as_str()))
    }
}

fn normalize_status(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Resolves a tracked series into canonical metadata
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// `Ok(None)` when the series cannot be recognised
    async fn resolve(&self, series: &SeriesRef) -> Result<Option<MediaIdentity>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(status: Option<&str>, server_status: Option<&str>) -> MediaIdentity {
        MediaIdentity {
            kind: MediaKind::Tv,
            title: "Show".into(),
            year: Some(2021),
            provider_id: None,
            status: status.map(String::from),
            server_status: server_status.map(String::from),
            next_episode: None,
        }
    }

    #[test]
    fn test_provider_status_decides_without_server_status() {
        assert!(identity(Some("Ended"), None).is_ended());
        assert!(identity(Some(" Canceled "), None).is_ended());
        assert!(!identity(Some("Returning Series"), None).is_ended());
        assert!(!identity(None, None).is_ended());
    }

    #[test]
    fn test_active_server_status_overrides_provider() {
        assert!(!identity(Some("Ended"), Some("Continuing")).is_ended());
        assert!(!identity(Some("ended"), Some("连载中")).is_ended());
        assert!(identity(Some("Returning Series"), Some("已完结")).is_ended());
    }

    #[test]
    fn test_unknown_server_status_falls_through() {
        assert!(identity(Some("ended"), Some("Paused")).is_ended());
    }

    #[test]
    fn test_title_year() {
        assert_eq!(identity(None, None).title_year(), "Show (2021)");
    }
}
