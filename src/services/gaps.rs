//! Missing-episode calculation trait

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::recognizer::MediaIdentity;

/// Episode lists longer than this are summarised as a range
const SUMMARY_LIST_LIMIT: usize = 20;

/// Missing episodes within one season
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonGap {
    /// Missing episode numbers; empty means the whole season is missing
    pub episodes: Vec<i32>,
    pub total_episodes: Option<u32>,
}

/// Missing episodes keyed by season
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingEpisodes {
    pub seasons: BTreeMap<i32, SeasonGap>,
}

impl MissingEpisodes {
    pub fn is_empty(&self) -> bool {
        self.seasons.is_empty()
    }

    /// Short form for log lines, e.g. `S1:missing[3,4]/total 10; S2:missing[all]`
    pub fn summary(&self) -> String {
        if self.seasons.is_empty() {
            return "none".to_string();
        }
        self.seasons
            .iter()
            .map(|(season, gap)| {
                let mut episodes = gap.episodes.clone();
                episodes.sort_unstable();
                episodes.dedup();
                let listed = match (episodes.first(), episodes.last()) {
                    (None, _) | (_, None) => "all".to_string(),
                    (Some(first), Some(last)) if episodes.len() > SUMMARY_LIST_LIMIT => {
                        format!("{}-{}({} episodes)", first, last, episodes.len())
                    }
                    _ => episodes
                        .iter()
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                };
                match gap.total_episodes {
                    Some(total) => format!("S{}:missing[{}]/total {}", season, listed, total),
                    None => format!("S{}:missing[{}]", season, listed),
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Computes which episodes of a season are absent from the library
#[async_trait]
pub trait GapCalculator: Send + Sync {
    async fn compute_gaps(&self, identity: &MediaIdentity, season: i32) -> Result<MissingEpisodes>;
}
