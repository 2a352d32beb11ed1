//! Scheduler loop
//!
//! One run walks every configured media server: load its pool, fold in fresh
//! discovery events, pick the candidates for this mode/tier, recognise each
//! one, gate it, hand actionable ones to search/download, record the outcome,
//! prune and save. Every run and admin operation holds the single-flight
//! guard, so pool snapshots are never written concurrently.

use std::collections::BTreeSet;
use std::sync::Arc;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::airtime::AirtimeGate;
use super::filters::ExcludedLibraries;
use super::guard::SingleFlight;
use super::merger::ObservationMerger;
use super::model::{CandidateKey, MediaKind, NextEpisodeHint};
use super::pins::{KeyRule, PinChanges, PinRegistry, scope_name};
use super::pool::CandidatePool;
use super::report::{RunMode, RunReport};
use super::store::CatchupStore;
use super::tier::Tier;
use crate::config::CatchupConfig;
use crate::services::{
    DiscoveryFeed, GapCalculator, MediaIdentity, MissingEpisodes, Recognizer, SearchDownload,
    SeriesRef,
};

/// Fingerprint recorded for attempts made without a next-episode hint
pub const NO_HINT_FINGERPRINT: &str = "no_hint";

/// Wall clock for one run, anchored at the reading the run started with
#[derive(Debug, Clone, Copy)]
struct RunClock {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl RunClock {
    fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            started: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.started_at + Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| Duration::zero())
    }
}

/// External collaborators a run delegates to
#[derive(Clone)]
pub struct Collaborators {
    pub feeds: Vec<Arc<dyn DiscoveryFeed>>,
    pub recognizer: Arc<dyn Recognizer>,
    pub gaps: Arc<dyn GapCalculator>,
    pub search: Arc<dyn SearchDownload>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunReport),
    /// Another run held the guard; nothing was touched
    Busy,
    /// The system is switched off
    Disabled,
    /// State could not be loaded or saved
    Aborted { reason: String },
}

impl RunOutcome {
    pub fn is_busy(&self) -> bool {
        matches!(self, RunOutcome::Busy)
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Drives catch-up and backfill runs plus pool administration
pub struct Scheduler {
    config: CatchupConfig,
    store: CatchupStore,
    services: Collaborators,
    guard: SingleFlight,
    gate: AirtimeGate,
    merger: ObservationMerger,
}

impl Scheduler {
    pub fn new(config: CatchupConfig, store: CatchupStore, services: Collaborators) -> Self {
        let gate = config.airtime_gate();
        let merger = ObservationMerger::new(config.resume_days);
        Self {
            config,
            store,
            services,
            guard: SingleFlight::new(),
            gate,
            merger,
        }
    }

    /// Share an existing guard (several schedulers, or a test holding it)
    pub fn with_guard(mut self, guard: SingleFlight) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &CatchupConfig {
        &self.config
    }

    pub fn store(&self) -> &CatchupStore {
        &self.store
    }

    pub fn guard(&self) -> &SingleFlight {
        &self.guard
    }

    /// Catch-up pass; `None` processes every tier
    pub async fn run_catchup(&self, tier: Option<Tier>) -> RunOutcome {
        self.run(RunMode::Catchup, tier).await
    }

    pub async fn run_backfill(&self) -> RunOutcome {
        self.run(RunMode::Backfill, None).await
    }

    pub async fn run(&self, mode: RunMode, tier: Option<Tier>) -> RunOutcome {
        self.run_at(mode, tier, Utc::now()).await
    }

    /// Run with an explicit clock reading
    pub async fn run_at(&self, mode: RunMode, tier: Option<Tier>, now: DateTime<Utc>) -> RunOutcome {
        if !self.config.enabled {
            debug!(job = "catchup", mode = %mode, "Catch-up disabled, skipping trigger");
            return RunOutcome::Disabled;
        }

        let tier = match mode {
            RunMode::Catchup => tier,
            RunMode::Backfill => None,
        };
        let tier_label = tier.map(Tier::as_str).unwrap_or("none");

        let Some(_permit) = self.guard.try_enter() else {
            info!(job = "catchup", mode = %mode, tier = tier_label, "Catch-up run already in progress, skipping trigger");
            return RunOutcome::Busy;
        };

        info!(job = "catchup", mode = %mode, tier = tier_label, "Catch-up run started");
        let clock = RunClock::start(now);
        let mut report = RunReport::new(mode, tier, now);
        let result = self.execute(mode, tier, clock, &mut report).await;
        report.finish(clock.now());

        match result {
            Ok(()) => {
                if let Err(e) = self.store.save_report(&report).await {
                    warn!(job = "catchup", error = %e, "Failed to save run report");
                }
                RunOutcome::Completed(report)
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(job = "catchup", mode = %mode, error = %reason, "Catch-up run aborted");
                report.error = Some(reason.clone());
                if let Err(e) = self.store.save_report(&report).await {
                    warn!(job = "catchup", error = %e, "Failed to save run report");
                }
                RunOutcome::Aborted { reason }
            }
        }
    }

    async fn execute(
        &self,
        mode: RunMode,
        tier: Option<Tier>,
        clock: RunClock,
        report: &mut RunReport,
    ) -> Result<()> {
        if self.config.servers.is_empty() {
            info!(job = "catchup", "No media servers configured, nothing to do");
            return Ok(());
        }

        let pins = self.store.load_pins().await?;
        for server in &self.config.servers {
            report.servers += 1;
            info!(job = "catchup", server = %server, mode = %mode, "Processing media server");
            self.process_server(server, mode, tier, clock, &pins, report).await?;
        }
        Ok(())
    }

    async fn process_server(
        &self,
        server: &str,
        mode: RunMode,
        tier: Option<Tier>,
        clock: RunClock,
        pins: &PinRegistry,
        report: &mut RunReport,
    ) -> Result<()> {
        let now = clock.started_at;
        let mut pool = self.store.load_pool(server).await?;

        self.discover(server, &mut pool, now, report).await;
        let stubs = pool.apply_pins(pins, now);
        if stubs > 0 {
            debug!(job = "catchup", server = %server, stubs, "Created entries for pinned keys");
        }

        let selected = self.select(&pool, mode, tier, now);
        info!(
            job = "catchup",
            server = %server,
            pool = pool.len(),
            selected = selected.len(),
            "Selected candidates"
        );
        for key in &selected {
            self.process_candidate(server, &mut pool, key, mode, clock, report)
                .await;
        }

        let pruned = pool.prune(self.config.retention_days, pins, now);
        for key in &pruned {
            debug!(job = "catchup", server = %server, key = %key, "Pruned stale entry");
        }
        report.pruned += pruned.len();

        self.store.save_pool(&pool).await
    }

    /// Fetch, filter and merge every feed into the pool
    ///
    /// A failing feed is logged and skipped; the others still run.
    async fn discover(
        &self,
        server: &str,
        pool: &mut CandidatePool,
        now: DateTime<Utc>,
        report: &mut RunReport,
    ) {
        let excluded = self.resolve_exclusions(server).await;
        let users = self.config.user_filter();
        let filters = self.config.discovery_filters();

        for feed in &self.services.feeds {
            let source = feed.source();
            let events = match feed.fetch(server, &filters).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(job = "catchup", server = %server, source = %source, error = %e, "Discovery fetch failed");
                    continue;
                }
            };
            report.discovered_events += events.len();

            let mut kept = Vec::with_capacity(events.len());
            for event in events {
                if !users.permits(event.user.as_deref()) {
                    report.skipped_user_filter += 1;
                    debug!(job = "catchup", event = %event.describe(), "Skipping event from filtered user");
                    continue;
                }
                if excluded.excludes(&event) {
                    report.skipped_library_excluded += 1;
                    debug!(job = "catchup", event = %event.describe(), "Skipping event from excluded library");
                    continue;
                }
                kept.push(event);
            }
            kept.truncate(filters.limit);

            let merged = self.merger.merge(&kept, source, now);
            report.merged_series += merged.observations.len();
            let stats = pool.upsert(&merged.observations, now);
            debug!(
                job = "catchup",
                server = %server,
                source = %source,
                created = stats.created,
                updated = stats.updated,
                "Pool updated from discovery"
            );
        }
    }

    async fn resolve_exclusions(&self, server: &str) -> ExcludedLibraries {
        let rules = self.config.library_rules();
        if !rules.iter().any(|rule| rule.applies_to(server)) {
            return ExcludedLibraries::default();
        }

        let mut folders = Vec::new();
        for feed in &self.services.feeds {
            match feed.libraries(server).await {
                Ok(found) if !found.is_empty() => {
                    folders = found;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(job = "catchup", server = %server, error = %e, "Failed to list libraries");
                }
            }
        }

        let excluded = ExcludedLibraries::resolve(&rules, server, &folders);
        if excluded.is_empty() {
            warn!(job = "catchup", server = %server, "Library exclusion rules matched no library");
        } else {
            info!(job = "catchup", server = %server, libraries = ?excluded.names, "Excluding libraries");
        }
        excluded
    }

    fn select(
        &self,
        pool: &CandidatePool,
        mode: RunMode,
        tier: Option<Tier>,
        now: DateTime<Utc>,
    ) -> Vec<CandidateKey> {
        pool.entries()
            .filter(|entry| {
                if mode == RunMode::Backfill || entry.pinned {
                    return true;
                }
                let classified = Tier::classify(entry.last_seen_at, now);
                match tier {
                    Some(wanted) => classified == wanted,
                    None => self.config.cold_enabled || classified != Tier::Cold,
                }
            })
            .map(|entry| entry.key())
            .collect()
    }

    async fn process_candidate(
        &self,
        server: &str,
        pool: &mut CandidatePool,
        key: &CandidateKey,
        mode: RunMode,
        clock: RunClock,
        report: &mut RunReport,
    ) {
        let Some(entry) = pool.get(key) else {
            return;
        };
        let series = SeriesRef {
            server: server.to_string(),
            series_id: entry.series_id.clone(),
            season: entry.season,
            series_name: entry.series_name.clone(),
            year: entry.year,
        };
        let pinned = entry.pinned;
        let tier = Tier::classify(entry.last_seen_at, clock.started_at);

        let identity = match self.services.recognizer.resolve(&series).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                report.skipped_unrecognized += 1;
                info!(job = "catchup", server = %server, key = %key, "Recognition failed, skipping");
                return;
            }
            Err(e) => {
                report.skipped_collaborator_error += 1;
                warn!(job = "catchup", server = %server, key = %key, error = %e, "Recognizer error, skipping");
                return;
            }
        };

        if let Some(entry) = pool.get_mut(key) {
            entry.media_type_label = Some(identity.kind.label().to_string());
            if entry.series_name.is_none() {
                entry.series_name = Some(identity.title.clone());
            }
            if entry.year.is_none() {
                entry.year = identity.year;
            }
        }

        if identity.kind != MediaKind::Tv {
            report.skipped_non_tv += 1;
            info!(job = "catchup", series = %identity.title_year(), "Skipping non-TV item");
            return;
        }
        report.processed_series += 1;

        let gaps = match self.services.gaps.compute_gaps(&identity, key.season).await {
            Ok(gaps) => gaps,
            Err(e) => {
                report.skipped_collaborator_error += 1;
                warn!(job = "catchup", series = %identity.title_year(), error = %e, "Missing-episode calculation failed");
                return;
            }
        };

        let ended = identity.is_ended();
        if ended && gaps.is_empty() && !pinned {
            pool.remove(key);
            report.retired += 1;
            info!(
                job = "catchup",
                server = %server,
                series = %identity.title_year(),
                season = key.season,
                "Series ended with nothing missing, retiring entry"
            );
            return;
        }

        match mode {
            RunMode::Backfill => self.backfill(pool, key, &identity, &gaps, report).await,
            RunMode::Catchup => {
                if ended {
                    debug!(
                        job = "catchup",
                        series = %identity.title_year(),
                        missing = %gaps.summary(),
                        "Series has ended, leaving gaps to backfill"
                    );
                    return;
                }
                self.catch_up(pool, key, &identity, &gaps, tier, clock, report)
                    .await
            }
        }
    }

    async fn backfill(
        &self,
        pool: &mut CandidatePool,
        key: &CandidateKey,
        identity: &MediaIdentity,
        gaps: &MissingEpisodes,
        report: &mut RunReport,
    ) {
        if gaps.is_empty() {
            debug!(job = "catchup", series = %identity.title_year(), season = key.season, "Nothing missing");
            return;
        }

        info!(
            job = "catchup",
            series = %identity.title_year(),
            season = key.season,
            missing = %gaps.summary(),
            "Backfilling missing episodes"
        );
        report.backfill_attempts += 1;

        let result = if self.config.backfill_stats_only {
            report.skipped_stats_only += 1;
            info!(job = "catchup", series = %identity.title_year(), "Stats-only mode, not downloading");
            "backfill_stats_only".to_string()
        } else {
            match self.services.search.attempt(identity, key.season, Some(gaps)).await {
                Ok(outcome) => {
                    if outcome.is_downloaded() {
                        report.backfill_downloads += 1;
                    }
                    format!("backfill_{}", outcome)
                }
                Err(e) => {
                    report.skipped_collaborator_error += 1;
                    warn!(job = "catchup", series = %identity.title_year(), error = %e, "Backfill search failed");
                    return;
                }
            }
        };

        if let Some(entry) = pool.get_mut(key) {
            entry.last_track_result = Some(result);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn catch_up(
        &self,
        pool: &mut CandidatePool,
        key: &CandidateKey,
        identity: &MediaIdentity,
        gaps: &MissingEpisodes,
        tier: Tier,
        clock: RunClock,
        report: &mut RunReport,
    ) {
        let now = clock.started_at;
        let Some(entry) = pool.get_mut(key) else {
            return;
        };
        let hint = identity.next_episode.as_ref();

        let decision = self.gate.should_run(now, entry, hint, tier);
        if !decision.allow {
            entry.next_track_at = decision.next_due;
            report.skipped_gated += 1;
            debug!(
                job = "catchup",
                series = %identity.title_year(),
                season = key.season,
                tier = %tier,
                reason = decision.reason.as_str(),
                next_due = ?decision.next_due,
                "Not due yet"
            );
            return;
        }

        report.catchup_attempts += 1;
        let fingerprint = hint
            .map(NextEpisodeHint::fingerprint)
            .unwrap_or_else(|| NO_HINT_FINGERPRINT.to_string());
        info!(
            job = "catchup",
            series = %identity.title_year(),
            season = key.season,
            tier = %tier,
            reason = decision.reason.as_str(),
            next_episode = %fingerprint,
            "Attempting catch-up"
        );

        let missing = (!gaps.is_empty()).then_some(gaps);
        let outcome = match self.services.search.attempt(identity, key.season, missing).await {
            Ok(outcome) => outcome,
            Err(e) => {
                report.skipped_collaborator_error += 1;
                warn!(job = "catchup", series = %identity.title_year(), error = %e, "Catch-up search failed");
                return;
            }
        };

        entry.last_track_at = Some(now);
        entry.last_track_next_episode = Some(fingerprint);
        entry.last_track_result = Some(outcome.as_str().to_string());

        if outcome.is_downloaded() {
            report.catchup_downloads += 1;
            // Hit time is when the search returned
            if self.gate.calibrate(entry, clock.now(), hint) {
                info!(
                    job = "catchup",
                    series = %identity.title_year(),
                    learned_hit_minutes = entry.learned_hit_minutes,
                    "Calibrated airtime"
                );
            }
        }
        entry.next_track_at = self.gate.should_run(now, entry, hint, tier).next_due;
    }

    /// Every scope with saved state or in the configuration
    async fn scopes(&self) -> Result<BTreeSet<String>> {
        let mut scopes = self.store.known_servers().await?;
        scopes.extend(self.config.servers.iter().map(|s| scope_name(s)));
        Ok(scopes)
    }

    async fn sync_pins(&self, pins: &PinRegistry) -> Result<()> {
        let now = Utc::now();
        for server in self.scopes().await? {
            let mut pool = self.store.load_pool(&server).await?;
            pool.apply_pins(pins, now);
            self.store.save_pool(&pool).await?;
        }
        Ok(())
    }

    /// Apply one batch of pin edits; removals win over adds for the same key
    pub async fn manage_pins(&self, adds: &[KeyRule], removes: &[KeyRule]) -> Result<PinChanges> {
        let _permit = self.guard.enter().await?;

        let mut pins = self.store.load_pins().await?;
        let changes = pins.apply(adds, removes);
        self.store.save_pins(&pins).await?;
        self.sync_pins(&pins).await?;

        info!(
            job = "catchup",
            added = changes.added,
            removed = changes.removed,
            overridden = changes.overridden,
            "Pin rules applied"
        );
        Ok(changes)
    }

    /// Drop every pin
    pub async fn clear_pins(&self) -> Result<()> {
        let _permit = self.guard.enter().await?;

        let mut pins = self.store.load_pins().await?;
        pins.clear_all();
        self.store.save_pins(&pins).await?;
        self.sync_pins(&pins).await?;

        info!(job = "catchup", "Cleared all pins");
        Ok(())
    }

    /// Delete the saved pool for `server`, or for every scope; returns entries removed
    pub async fn clear_pool(&self, server: Option<&str>) -> Result<usize> {
        let _permit = self.guard.enter().await?;

        let targets = match server {
            Some(server) => BTreeSet::from([scope_name(server)]),
            None => self.scopes().await?,
        };

        let mut removed = 0;
        for scope in targets {
            removed += self.store.load_pool(&scope).await?.len();
            self.store.delete_pool(&scope).await?;
        }

        info!(job = "catchup", server = server.unwrap_or("*"), removed, "Cleared candidate pool");
        Ok(removed)
    }

    /// Remove matching entries from every pool and drop their pins
    pub async fn remove_entries(&self, rules: &[KeyRule]) -> Result<usize> {
        if rules.is_empty() {
            return Ok(0);
        }
        let _permit = self.guard.enter().await?;

        let mut pins = self.store.load_pins().await?;
        let mut pins_changed = false;
        for rule in rules {
            pins_changed |= pins.remove(&rule.server, &rule.key);
        }
        if pins_changed {
            self.store.save_pins(&pins).await?;
        }

        let mut removed = 0;
        for scope in self.scopes().await? {
            let mut pool = self.store.load_pool(&scope).await?;
            let doomed: Vec<CandidateKey> = pool
                .keys()
                .into_iter()
                .filter(|key| rules.iter().any(|rule| rule.matches(&scope, key)))
                .collect();
            if doomed.is_empty() {
                continue;
            }
            for key in &doomed {
                pool.remove(key);
                info!(job = "catchup", server = %scope, key = %key, "Removed entry by rule");
            }
            removed += doomed.len();
            self.store.save_pool(&pool).await?;
        }
        Ok(removed)
    }

    /// Apply the clear/pin/remove actions from the configuration
    pub async fn apply_startup_actions(&self) -> Result<()> {
        if self.config.clear_pool {
            self.clear_pool(None).await?;
        }

        let adds = self.config.pin_rules();
        let removes = self.config.unpin_rules();
        if !adds.is_empty() || !removes.is_empty() {
            self.manage_pins(&adds, &removes).await?;
        }

        let remove_rules = self.config.remove_rules();
        if !remove_rules.is_empty() {
            let removed = self.remove_entries(&remove_rules).await?;
            info!(job = "catchup", removed, "Applied removal rules");
        }
        Ok(())
    }
}
