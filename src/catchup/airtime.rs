//! Airtime gate
//!
//! Decides whether a candidate is worth a search attempt right now. With an
//! air date available the gate estimates the real broadcast instant as local
//! midnight of that date plus the learned time-of-day offset plus a buffer.
//! Without one it falls back to a fixed per-tier interval since the last
//! attempt.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use super::model::{CandidateEntry, NextEpisodeHint};
use super::tier::{MAX_INTERVAL_MINUTES, Tier, TierIntervals};

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Why the gate allowed or denied an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    /// Never attempted before
    FirstAttempt,
    /// Fixed tier interval elapsed since the last attempt
    IntervalElapsed,
    /// Fixed tier interval not yet elapsed
    IntervalPending,
    /// Estimated airtime has not been reached
    BeforeAirtime,
    /// Estimated airtime reached and the window is still open
    AirtimeReached,
    /// This air window was already attempted after it opened
    WindowServiced,
}

impl GateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GateReason::FirstAttempt => "first_attempt",
            GateReason::IntervalElapsed => "interval_elapsed",
            GateReason::IntervalPending => "interval_pending",
            GateReason::BeforeAirtime => "before_airtime",
            GateReason::AirtimeReached => "airtime_reached",
            GateReason::WindowServiced => "window_serviced",
        }
    }
}

/// Gate verdict for one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub allow: bool,
    pub reason: GateReason,
    /// Readiness instant; `None` when no further attempt is expected for this window
    pub next_due: Option<DateTime<Utc>>,
}

impl GateDecision {
    fn allow(reason: GateReason, next_due: DateTime<Utc>) -> Self {
        Self {
            allow: true,
            reason,
            next_due: Some(next_due),
        }
    }

    fn deny(reason: GateReason, next_due: Option<DateTime<Utc>>) -> Self {
        Self {
            allow: false,
            reason,
            next_due,
        }
    }
}

/// Readiness gate configured with a time zone, buffer and tier intervals
#[derive(Debug, Clone)]
pub struct AirtimeGate {
    enabled: bool,
    tz: Tz,
    buffer: Duration,
    intervals: TierIntervals,
}

impl AirtimeGate {
    pub fn new(enabled: bool, tz: Tz, buffer_minutes: i64, intervals: TierIntervals) -> Self {
        Self {
            enabled,
            tz,
            buffer: Duration::minutes(buffer_minutes.clamp(0, MAX_INTERVAL_MINUTES)),
            intervals,
        }
    }

    pub fn time_zone(&self) -> Tz {
        self.tz
    }

    /// Decide readiness; pure with respect to its inputs
    pub fn should_run(
        &self,
        now: DateTime<Utc>,
        entry: &CandidateEntry,
        hint: Option<&NextEpisodeHint>,
        tier: Tier,
    ) -> GateDecision {
        let interval = self.intervals.for_tier(tier);
        if !self.enabled {
            return fixed_interval(now, entry.last_track_at, interval);
        }

        let Some((hint, air_date)) = hint.and_then(|h| h.air_date.map(|d| (h, d))) else {
            return fixed_interval(now, entry.last_track_at, interval);
        };

        let due = self.due_instant(air_date, entry.learned_hit_minutes);
        if now < due {
            return GateDecision::deny(GateReason::BeforeAirtime, Some(due));
        }

        let on_air_day = air_date
            .succ_opt()
            .is_none_or(|next_day| now < self.local_midnight(next_day));
        if entry.learned_hit_minutes.is_none() && on_air_day {
            // No time-of-day knowledge yet: the whole air day is eligible, paced by the tier interval
            let decision = fixed_interval(now, entry.last_track_at, interval);
            return GateDecision {
                next_due: decision.next_due.map(|next| next.max(due)),
                ..decision
            };
        }

        let serviced = entry.last_track_next_episode.as_deref() == Some(hint.fingerprint().as_str())
            && entry.last_track_at.is_some_and(|at| at >= due);
        if serviced {
            return GateDecision::deny(GateReason::WindowServiced, None);
        }
        GateDecision::allow(GateReason::AirtimeReached, due)
    }

    /// Local midnight of `air_date` plus the learned offset plus the buffer, in UTC
    pub fn due_instant(&self, air_date: NaiveDate, learned_hit_minutes: Option<u16>) -> DateTime<Utc> {
        let offset = i64::from(learned_hit_minutes.unwrap_or(0).min(MINUTES_PER_DAY - 1));
        self.local_midnight(air_date) + Duration::minutes(offset) + self.buffer
    }

    fn local_midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = date.and_time(NaiveTime::MIN);
        match self.tz.from_local_datetime(&midnight).earliest() {
            Some(local) => local.with_timezone(&Utc),
            // Midnight skipped by a DST transition: the day starts an hour later
            None => self
                .tz
                .from_local_datetime(&(midnight + Duration::hours(1)))
                .earliest()
                .map(|local| local.with_timezone(&Utc))
                .unwrap_or_else(|| midnight.and_utc()),
        }
    }

    /// Record a confirmed download as calibration
    ///
    /// Only successes on the hint's local air day count, and the stored
    /// minute only ever moves earlier. Returns whether the entry changed.
    pub fn calibrate(
        &self,
        entry: &mut CandidateEntry,
        hit_at: DateTime<Utc>,
        hint: Option<&NextEpisodeHint>,
    ) -> bool {
        let Some(air_date) = hint.and_then(|h| h.air_date) else {
            return false;
        };
        let local = hit_at.with_timezone(&self.tz);
        if local.date_naive() != air_date {
            return false;
        }
        let minute = (local.hour() * 60 + local.minute()) as u16;
        match entry.learned_hit_minutes {
            Some(existing) if existing <= minute => false,
            _ => {
                entry.learned_hit_minutes = Some(minute);
                true
            }
        }
    }
}

fn fixed_interval(
    now: DateTime<Utc>,
    last_track_at: Option<DateTime<Utc>>,
    interval: Duration,
) -> GateDecision {
    let Some(last) = last_track_at else {
        return GateDecision::allow(GateReason::FirstAttempt, now);
    };
    let due = last + interval;
    if now >= due {
        GateDecision::allow(GateReason::IntervalElapsed, due)
    } else {
        GateDecision::deny(GateReason::IntervalPending, Some(due))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catchup::model::CandidateKey;
    use chrono_tz::Tz;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn entry() -> CandidateEntry {
        CandidateEntry::new(&CandidateKey::new("s1", 1))
    }

    fn hint(date: &str) -> NextEpisodeHint {
        NextEpisodeHint {
            season: 1,
            episode: 5,
            air_date: Some(date.parse().unwrap()),
        }
    }

    fn gate(enabled: bool, tz: Tz, buffer: i64) -> AirtimeGate {
        AirtimeGate::new(enabled, tz, buffer, TierIntervals::new(10, 60, 6))
    }

    #[test]
    fn test_calibrated_due_instant_in_utc() {
        let gate = gate(true, Tz::UTC, 30);
        let mut candidate = entry();
        candidate.learned_hit_minutes = Some(540);
        let hint = hint("2024-05-01");

        let early = gate.should_run(at("2024-05-01T09:00:00Z"), &candidate, Some(&hint), Tier::Hot);
        assert!(!early.allow);
        assert_eq!(early.reason, GateReason::BeforeAirtime);
        assert_eq!(early.next_due, Some(at("2024-05-01T09:30:00Z")));

        let late = gate.should_run(at("2024-05-01T10:00:00Z"), &candidate, Some(&hint), Tier::Hot);
        assert!(late.allow);
        assert_eq!(late.reason, GateReason::AirtimeReached);
    }

    #[test]
    fn test_disabled_gate_uses_fixed_interval() {
        let gate = gate(false, Tz::UTC, 0);
        let mut candidate = entry();
        let t = at("2024-05-01T12:00:00Z");
        candidate.last_track_at = Some(t);

        for minutes in [0, 1, 9] {
            let d = gate.should_run(t + Duration::minutes(minutes), &candidate, None, Tier::Hot);
            assert!(!d.allow, "should deny at +{minutes}m");
            assert_eq!(d.next_due, Some(t + Duration::minutes(10)));
        }
        let d = gate.should_run(t + Duration::minutes(10), &candidate, None, Tier::Hot);
        assert!(d.allow);
        assert_eq!(d.reason, GateReason::IntervalElapsed);
    }

    #[test]
    fn test_never_attempted_is_allowed_without_air_date() {
        let gate = gate(true, Tz::UTC, 0);
        let d = gate.should_run(at("2024-05-01T00:00:00Z"), &entry(), None, Tier::Cold);
        assert!(d.allow);
        assert_eq!(d.reason, GateReason::FirstAttempt);
    }

    #[test]
    fn test_due_instant_respects_time_zone() {
        let gate = gate(true, "Asia/Shanghai".parse().unwrap(), 15);
        let due = gate.due_instant("2024-05-01".parse().unwrap(), Some(20 * 60));
        // 2024-05-01 20:15 +08:00
        assert_eq!(due, at("2024-05-01T12:15:00Z"));
    }

    #[test]
    fn test_uncalibrated_air_day_is_paced_by_tier_interval() {
        let gate = gate(true, Tz::UTC, 0);
        let hint = hint("2024-05-01");
        let mut candidate = entry();

        let before = gate.should_run(at("2024-04-30T23:59:00Z"), &candidate, Some(&hint), Tier::Hot);
        assert!(!before.allow);
        assert_eq!(before.next_due, Some(at("2024-05-01T00:00:00Z")));

        let first = gate.should_run(at("2024-05-01T00:00:00Z"), &candidate, Some(&hint), Tier::Hot);
        assert!(first.allow);

        candidate.last_track_at = Some(at("2024-05-01T00:00:00Z"));
        candidate.last_track_next_episode = Some(hint.fingerprint());
        let burst = gate.should_run(at("2024-05-01T00:05:00Z"), &candidate, Some(&hint), Tier::Hot);
        assert!(!burst.allow);
        assert_eq!(burst.reason, GateReason::IntervalPending);

        let later = gate.should_run(at("2024-05-01T00:10:00Z"), &candidate, Some(&hint), Tier::Hot);
        assert!(later.allow);
    }

    #[test]
    fn test_uncalibrated_window_is_serviced_after_air_day() {
        let gate = gate(true, Tz::UTC, 0);
        let hint = hint("2024-05-01");
        let mut candidate = entry();
        candidate.last_track_at = Some(at("2024-05-01T10:00:00Z"));
        candidate.last_track_next_episode = Some(hint.fingerprint());

        let d = gate.should_run(at("2024-05-03T10:00:00Z"), &candidate, Some(&hint), Tier::Hot);
        assert!(!d.allow);
        assert_eq!(d.reason, GateReason::WindowServiced);
        assert_eq!(d.next_due, None);

        // Still on the air day: interval pacing applies
        let d = gate.should_run(at("2024-05-01T23:50:00Z"), &candidate, Some(&hint), Tier::Hot);
        assert!(d.allow);
        assert_eq!(d.reason, GateReason::IntervalElapsed);

        // Never attempted during the window: one attempt after the day is allowed
        candidate.last_track_next_episode = Some("S1E4@2024-04-24".to_string());
        let d = gate.should_run(at("2024-05-03T10:00:00Z"), &candidate, Some(&hint), Tier::Hot);
        assert!(d.allow);
        assert_eq!(d.reason, GateReason::AirtimeReached);
    }

    #[test]
    fn test_serviced_window_is_not_reattempted() {
        let gate = gate(true, Tz::UTC, 0);
        let hint = hint("2024-05-01");
        let mut candidate = entry();
        candidate.learned_hit_minutes = Some(600);
        candidate.last_track_at = Some(at("2024-05-01T10:05:00Z"));
        candidate.last_track_next_episode = Some(hint.fingerprint());

        let d = gate.should_run(at("2024-05-02T10:00:00Z"), &candidate, Some(&hint), Tier::Hot);
        assert!(!d.allow);
        assert_eq!(d.reason, GateReason::WindowServiced);

        // An attempt before the window opened does not count
        candidate.last_track_at = Some(at("2024-05-01T09:00:00Z"));
        let d = gate.should_run(at("2024-05-02T10:00:00Z"), &candidate, Some(&hint), Tier::Hot);
        assert!(d.allow);

        // A new next episode opens a new window
        candidate.last_track_at = Some(at("2024-05-01T10:05:00Z"));
        let next = NextEpisodeHint {
            episode: 6,
            ..hint.clone()
        };
        let d = gate.should_run(at("2024-05-02T10:00:00Z"), &candidate, Some(&next), Tier::Hot);
        assert!(d.allow);
    }

    #[test]
    fn test_gate_is_deterministic() {
        let gate = gate(true, Tz::UTC, 30);
        let mut candidate = entry();
        candidate.learned_hit_minutes = Some(100);
        candidate.last_track_at = Some(at("2024-05-01T00:00:00Z"));
        let hint = hint("2024-05-01");
        let now = at("2024-05-01T01:00:00Z");
        let first = gate.should_run(now, &candidate, Some(&hint), Tier::Warm);
        for _ in 0..5 {
            assert_eq!(gate.should_run(now, &candidate, Some(&hint), Tier::Warm), first);
        }
    }

    #[test]
    fn test_calibration_only_moves_earlier() {
        let gate = gate(true, Tz::UTC, 0);
        let hint = hint("2024-05-01");
        let mut candidate = entry();

        assert!(gate.calibrate(&mut candidate, at("2024-05-01T10:30:00Z"), Some(&hint)));
        assert_eq!(candidate.learned_hit_minutes, Some(630));

        assert!(!gate.calibrate(&mut candidate, at("2024-05-01T11:00:00Z"), Some(&hint)));
        assert_eq!(candidate.learned_hit_minutes, Some(630));

        assert!(gate.calibrate(&mut candidate, at("2024-05-01T09:15:00Z"), Some(&hint)));
        assert_eq!(candidate.learned_hit_minutes, Some(555));
    }

    #[test]
    fn test_calibration_ignores_hits_off_air_day() {
        let gate = gate(true, "America/New_York".parse().unwrap(), 0);
        let hint = hint("2024-05-01");
        let mut candidate = entry();

        // 02:00Z on May 2nd is still May 1st in New York
        assert!(gate.calibrate(&mut candidate, at("2024-05-02T02:00:00Z"), Some(&hint)));
        assert_eq!(candidate.learned_hit_minutes, Some(22 * 60));

        assert!(!gate.calibrate(&mut candidate, at("2024-05-03T02:00:00Z"), Some(&hint)));
        assert!(!gate.calibrate(&mut candidate, at("2024-05-01T12:00:00Z"), None));
    }
}
