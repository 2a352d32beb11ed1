//! Search/download pipeline trait

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::gaps::MissingEpisodes;
use super::recognizer::MediaIdentity;

/// Result of one search/download attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Downloaded,
    NoMatch,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Downloaded => "downloaded",
            AttemptOutcome::NoMatch => "no_match",
        }
    }

    pub fn is_downloaded(self) -> bool {
        self == AttemptOutcome::Downloaded
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hands a series-season to the external search and download pipeline
#[async_trait]
pub trait SearchDownload: Send + Sync {
    /// `missing` is `None` when looking for the next episode rather than known gaps
    async fn attempt(
        &self,
        identity: &MediaIdentity,
        season: i32,
        missing: Option<&MissingEpisodes>,
    ) -> Result<AttemptOutcome>;
}
