//! Observation merger
//!
//! Folds one discovery source's per-episode events into at most one
//! observation per (series, season). Stateless: identical input and `now`
//! always produce identical output.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::model::{CandidateKey, DiscoverySource, Observation, RawEpisodeEvent, normalize_user};

/// Why events were dropped (or kept despite missing data) during a merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeSkips {
    pub missing_series_or_season: u32,
    pub invalid_last_played: u32,
    pub out_of_window: u32,
    pub missing_last_played_kept: u32,
    pub duplicate_older: u32,
}

impl MergeSkips {
    pub fn absorb(&mut self, other: &MergeSkips) {
        self.missing_series_or_season += other.missing_series_or_season;
        self.invalid_last_played += other.invalid_last_played;
        self.out_of_window += other.out_of_window;
        self.missing_last_played_kept += other.missing_last_played_kept;
        self.duplicate_older += other.duplicate_older;
    }
}

/// Output of one merge pass
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub observations: Vec<Observation>,
    pub skips: MergeSkips,
}

/// Reduces raw events to per-key observations
#[derive(Debug, Clone, Copy)]
pub struct ObservationMerger {
    /// Drop observations last played longer ago than this; 0 disables the window
    recency_days: u32,
}

impl ObservationMerger {
    pub fn new(recency_days: u32) -> Self {
        Self { recency_days }
    }

    /// Parse and reduce raw events from `source`
    pub fn merge(
        &self,
        events: &[RawEpisodeEvent],
        source: DiscoverySource,
        now: DateTime<Utc>,
    ) -> MergeReport {
        let mut skips = MergeSkips::default();
        let mut parsed = Vec::with_capacity(events.len());

        for event in events {
            let series_id = event
                .series_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty());
            let season = event.season.filter(|s| *s >= 1);
            let (Some(series_id), Some(season)) = (series_id, season) else {
                skips.missing_series_or_season += 1;
                debug!(
                    job = "catchup",
                    source = %source,
                    event = %event.describe(),
                    "Dropping event without series or season"
                );
                continue;
            };

            let raw_played = event.last_played.as_deref().map(str::trim).filter(|s| !s.is_empty());
            let last_played = raw_played.and_then(parse_last_played);
            match (raw_played, last_played) {
                (Some(raw), None) => {
                    skips.invalid_last_played += 1;
                    debug!(
                        job = "catchup",
                        event = %event.describe(),
                        raw = %raw,
                        "Keeping event with unparseable last played time"
                    );
                }
                (None, _) => skips.missing_last_played_kept += 1,
                _ => {}
            }

            parsed.push(Observation {
                series_id: series_id.to_string(),
                season,
                episode: event.episode,
                series_name: event.series_name.clone(),
                year: event.year,
                last_played,
                playback_ticks: event.playback_ticks.unwrap_or(0),
                user: normalize_user(event.user.as_deref(), source),
                source,
            });
        }

        let observations = self.reduce(parsed, now, &mut skips);

        info!(
            job = "catchup",
            source = %source,
            events = events.len(),
            series = observations.len(),
            missing_series_or_season = skips.missing_series_or_season,
            invalid_last_played = skips.invalid_last_played,
            out_of_window = skips.out_of_window,
            missing_last_played_kept = skips.missing_last_played_kept,
            duplicate_older = skips.duplicate_older,
            "Merged discovery events"
        );

        MergeReport { observations, skips }
    }

    /// Reduce observations to one per key, preserving first-seen key order
    ///
    /// Applying this to its own output returns the output unchanged.
    pub fn reduce(
        &self,
        observations: impl IntoIterator<Item = Observation>,
        now: DateTime<Utc>,
        skips: &mut MergeSkips,
    ) -> Vec<Observation> {
        let mut index: HashMap<CandidateKey, usize> = HashMap::new();
        let mut merged: Vec<Observation> = Vec::new();

        for observation in observations {
            if self.outside_window(&observation, now) {
                skips.out_of_window += 1;
                continue;
            }
            match index.get(&observation.key()) {
                Some(&slot) => {
                    if supersedes(&observation, &merged[slot]) {
                        merged[slot] = observation;
                    } else {
                        skips.duplicate_older += 1;
                    }
                }
                None => {
                    index.insert(observation.key(), merged.len());
                    merged.push(observation);
                }
            }
        }
        merged
    }

    fn outside_window(&self, observation: &Observation, now: DateTime<Utc>) -> bool {
        if self.recency_days == 0 {
            return false;
        }
        match observation.last_played {
            Some(played) => (now - played).num_days() > i64::from(self.recency_days),
            None => false,
        }
    }
}

/// Later playback wins; unknown counts as the earliest instant; ties go to more progress
fn supersedes(candidate: &Observation, current: &Observation) -> bool {
    let candidate_played = candidate.last_played.unwrap_or(DateTime::<Utc>::MIN_UTC);
    let current_played = current.last_played.unwrap_or(DateTime::<Utc>::MIN_UTC);
    if candidate_played != current_played {
        return candidate_played > current_played;
    }
    candidate.playback_ticks > current.playback_ticks
}

/// Parse a media-server timestamp; naive timestamps are taken as UTC
pub fn parse_last_played(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
