//! Per-run counters, logged at the end of a run and persisted as the last report

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::tier::Tier;

/// What a run is trying to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Next or just-aired episode, tier gated
    Catchup,
    /// Episodes already missing, every tracked entry
    Backfill,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Catchup => "catchup",
            RunMode::Backfill => "backfill",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub tier: Option<Tier>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub servers: usize,
    pub discovered_events: usize,
    pub merged_series: usize,
    pub processed_series: usize,
    pub catchup_attempts: usize,
    pub catchup_downloads: usize,
    pub backfill_attempts: usize,
    pub backfill_downloads: usize,
    pub skipped_stats_only: usize,
    pub skipped_user_filter: usize,
    pub skipped_library_excluded: usize,
    pub skipped_non_tv: usize,
    pub skipped_unrecognized: usize,
    pub skipped_collaborator_error: usize,
    pub skipped_gated: usize,
    pub retired: usize,
    pub pruned: usize,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunReport {
    pub fn new(mode: RunMode, tier: Option<Tier>, started_at: DateTime<Utc>) -> Self {
        Self {
            mode,
            tier,
            started_at,
            finished_at: None,
            duration_seconds: 0.0,
            servers: 0,
            discovered_events: 0,
            merged_series: 0,
            processed_series: 0,
            catchup_attempts: 0,
            catchup_downloads: 0,
            backfill_attempts: 0,
            backfill_downloads: 0,
            skipped_stats_only: 0,
            skipped_user_filter: 0,
            skipped_library_excluded: 0,
            skipped_non_tv: 0,
            skipped_unrecognized: 0,
            skipped_collaborator_error: 0,
            skipped_gated: 0,
            retired: 0,
            pruned: 0,
            error: None,
        }
    }

    /// Stamp the finish time and log the summary line
    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
        let millis = (finished_at - self.started_at).num_milliseconds().max(0);
        self.duration_seconds = (millis as f64 / 10.0).round() / 100.0;

        info!(
            job = "catchup",
            mode = %self.mode,
            tier = self.tier.map(Tier::as_str).unwrap_or("none"),
            duration_seconds = self.duration_seconds,
            servers = self.servers,
            events = self.discovered_events,
            merged_series = self.merged_series,
            processed_series = self.processed_series,
            catchup = %format!("{}/{}", self.catchup_attempts, self.catchup_downloads),
            backfill = %format!("{}/{}", self.backfill_attempts, self.backfill_downloads),
            stats_only = self.skipped_stats_only,
            user_filtered = self.skipped_user_filter,
            library_excluded = self.skipped_library_excluded,
            non_tv = self.skipped_non_tv,
            unrecognized = self.skipped_unrecognized,
            collaborator_errors = self.skipped_collaborator_error,
            gated = self.skipped_gated,
            retired = self.retired,
            pruned = self.pruned,
            "Catch-up run finished"
        );
    }
}
