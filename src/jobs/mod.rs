//! Background job scheduling for catch-up and backfill runs

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::catchup::tier::MAX_INTERVAL_MINUTES;
use crate::catchup::{RunMode, RunOutcome, Scheduler, Tier};
use crate::config::CatchupConfig;

/// One repeating timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedJob {
    pub name: &'static str,
    pub mode: RunMode,
    pub tier: Option<Tier>,
    pub every: Duration,
}

/// Timers for the configuration: one per enabled tier plus backfill
pub fn job_plan(config: &CatchupConfig) -> Vec<PlannedJob> {
    if !config.enabled {
        return Vec::new();
    }

    let minutes = |m: i64| Duration::from_secs(m.clamp(1, MAX_INTERVAL_MINUTES) as u64 * 60);
    let mut plan = vec![
        PlannedJob {
            name: "catchup_hot",
            mode: RunMode::Catchup,
            tier: Some(Tier::Hot),
            every: minutes(config.hot_interval_minutes),
        },
        PlannedJob {
            name: "catchup_warm",
            mode: RunMode::Catchup,
            tier: Some(Tier::Warm),
            every: minutes(config.warm_interval_minutes),
        },
    ];
    if config.cold_enabled {
        plan.push(PlannedJob {
            name: "catchup_cold",
            mode: RunMode::Catchup,
            tier: Some(Tier::Cold),
            every: minutes(config.cold_interval_hours.saturating_mul(60)),
        });
    }
    plan.push(PlannedJob {
        name: "backfill",
        mode: RunMode::Backfill,
        tier: None,
        every: minutes(config.backfill_interval_hours.saturating_mul(60)),
    });
    plan
}

fn log_outcome(job: &str, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed(report) => info!(
            job = %job,
            attempts = report.catchup_attempts + report.backfill_attempts,
            downloads = report.catchup_downloads + report.backfill_downloads,
            "Scheduled run completed"
        ),
        RunOutcome::Busy => info!(job = %job, "Previous run still active, trigger skipped"),
        RunOutcome::Disabled => {}
        RunOutcome::Aborted { reason } => error!(job = %job, reason = %reason, "Scheduled run aborted"),
    }
}

/// Apply startup actions, register the timers and start them
pub async fn start_scheduler(scheduler: Arc<Scheduler>) -> anyhow::Result<JobScheduler> {
    let jobs = JobScheduler::new().await?;
    let config = scheduler.config().clone();

    if !config.enabled {
        if config.run_once {
            warn!(job = "catchup", "Run-once requested but catch-up is disabled, skipping");
        }
        info!(job = "catchup", "Catch-up disabled, no jobs scheduled");
        return Ok(jobs);
    }

    if let Err(e) = scheduler.apply_startup_actions().await {
        error!(job = "catchup", error = %e, "Failed to apply pool management actions");
    }

    for planned in job_plan(&config) {
        let runner = scheduler.clone();
        let PlannedJob { name, mode, tier, every } = planned;
        let job = Job::new_repeated_async(every, move |_uuid, _l| {
            let runner = runner.clone();
            Box::pin(async move {
                let outcome = runner.run(mode, tier).await;
                log_outcome(name, &outcome);
            })
        })?;
        jobs.add(job).await?;
        info!(job = name, every_secs = every.as_secs(), "Registered catch-up job");
    }

    jobs.start().await?;
    info!(job = "catchup", "Job scheduler started");

    if config.run_once {
        info!(job = "catchup", "Run-once requested, starting a catch-up pass now");
        let runner = scheduler.clone();
        tokio::spawn(async move {
            let outcome = runner.run_catchup(None).await;
            log_outcome("run_once", &outcome);
        });
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn enabled(cold: bool) -> CatchupConfig {
        CatchupConfig {
            enabled: true,
            cold_enabled: cold,
            ..CatchupConfig::default()
        }
    }

    #[test]
    fn test_disabled_plans_nothing() {
        assert!(job_plan(&CatchupConfig::default()).is_empty());
    }

    #[test]
    fn test_plan_has_one_job_per_tier_and_backfill() {
        let plan = job_plan(&enabled(true));
        let names: Vec<_> = plan.iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["catchup_hot", "catchup_warm", "catchup_cold", "backfill"]);
        assert_eq!(plan[0].every, Duration::from_secs(10 * 60));
        assert_eq!(plan[2].every, Duration::from_secs(6 * 3600));
        assert_eq!(plan[3].tier, None);
    }

    #[test]
    fn test_oversized_intervals_are_capped() {
        let config = CatchupConfig {
            hot_interval_minutes: i64::MAX,
            cold_interval_hours: i64::MAX,
            backfill_interval_hours: i64::MAX / 2,
            ..enabled(true)
        };
        let cap = Duration::from_secs(MAX_INTERVAL_MINUTES as u64 * 60);
        assert!(job_plan(&config).iter().all(|j| j.every <= cap));
    }

    #[test]
    fn test_cold_tier_can_be_disabled() {
        let plan = job_plan(&enabled(false));
        assert!(plan.iter().all(|j| j.tier != Some(Tier::Cold)));
        assert_eq!(plan.len(), 3);
    }
}
