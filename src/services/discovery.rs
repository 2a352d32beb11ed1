//! Discovery feed trait
//!
//! A feed lists per-episode events from one media-server view (resume,
//! history, recently added). Implementations talk to the media server; the
//! catch-up core only consumes the events.

use anyhow::Result;
use async_trait::async_trait;

use crate::catchup::filters::LibraryFolder;
use crate::catchup::model::{DiscoverySource, RawEpisodeEvent};

/// Query parameters passed to every feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilters {
    /// Maximum events per user the feed should return
    pub limit: usize,
    /// Feeds may skip events last played longer ago than this; 0 means unbounded
    pub recency_days: u32,
}

impl Default for DiscoveryFilters {
    fn default() -> Self {
        Self {
            limit: 50,
            recency_days: 30,
        }
    }
}

/// One discovery source on a media server
#[async_trait]
pub trait DiscoveryFeed: Send + Sync {
    /// Which view this feed reports
    fn source(&self) -> DiscoverySource;

    /// Fetch raw events for `server`
    async fn fetch(&self, server: &str, filters: &DiscoveryFilters) -> Result<Vec<RawEpisodeEvent>>;

    /// Library folders on `server`, used to resolve exclusion rules
    async fn libraries(&self, _server: &str) -> Result<Vec<LibraryFolder>> {
        Ok(Vec::new())
    }
}
