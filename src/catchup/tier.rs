//! Freshness tiers

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Entries seen within this many days are hot
pub const HOT_MAX_AGE_DAYS: i64 = 7;
/// Entries seen within this many days (and not hot) are warm
pub const WARM_MAX_AGE_DAYS: i64 = 30;

/// Freshness bucket; ordering is hot < warm < cold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    /// Classify by how long ago any source last saw the entry
    pub fn classify(last_seen_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Tier {
        let Some(seen) = last_seen_at else {
            return Tier::Cold;
        };
        let age = now - seen;
        if age <= Duration::days(HOT_MAX_AGE_DAYS) {
            Tier::Hot
        } else if age <= Duration::days(WARM_MAX_AGE_DAYS) {
            Tier::Warm
        } else {
            Tier::Cold
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }

    pub fn parse(raw: &str) -> Option<Tier> {
        match raw.trim().to_lowercase().as_str() {
            "hot" => Some(Tier::Hot),
            "warm" => Some(Tier::Warm),
            "cold" => Some(Tier::Cold),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Longest accepted interval, a leap year of minutes
pub const MAX_INTERVAL_MINUTES: i64 = 366 * 24 * 60;
pub const MAX_INTERVAL_HOURS: i64 = MAX_INTERVAL_MINUTES / 60;

/// Fixed re-attempt interval per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierIntervals {
    pub hot: Duration,
    pub warm: Duration,
    pub cold: Duration,
}

impl TierIntervals {
    /// Warm and cold are raised above hot when configured at or below it
    ///
    /// Values are clamped to at most [`MAX_INTERVAL_MINUTES`].
    pub fn new(hot_minutes: i64, warm_minutes: i64, cold_hours: i64) -> Self {
        let hot = Duration::minutes(hot_minutes.clamp(1, MAX_INTERVAL_MINUTES));
        let warm = Duration::minutes(warm_minutes.clamp(1, MAX_INTERVAL_MINUTES)).max(hot + Duration::minutes(1));
        let cold = Duration::hours(cold_hours.clamp(1, MAX_INTERVAL_HOURS)).max(hot + Duration::minutes(1));
        Self { hot, warm, cold }
    }

    pub fn for_tier(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Hot => self.hot,
            Tier::Warm => self.warm,
            Tier::Cold => self.cold,
        }
    }
}

impl Default for TierIntervals {
    fn default() -> Self {
        Self::new(10, 60, 6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_ten_days_is_warm() {
        let seen = now() - Duration::days(10);
        assert_eq!(Tier::classify(Some(seen), now()), Tier::Warm);
    }

    #[test]
    fn test_boundaries() {
        assert_eq!(Tier::classify(Some(now() - Duration::days(7)), now()), Tier::Hot);
        assert_eq!(
            Tier::classify(Some(now() - Duration::days(7) - Duration::seconds(1)), now()),
            Tier::Warm
        );
        assert_eq!(Tier::classify(Some(now() - Duration::days(30)), now()), Tier::Warm);
        assert_eq!(Tier::classify(Some(now() - Duration::days(31)), now()), Tier::Cold);
        assert_eq!(Tier::classify(None, now()), Tier::Cold);
    }

    #[test]
    fn test_classification_is_monotonic_in_age() {
        let ages: Vec<i64> = (0..60).map(|d| d * 12).collect();
        let tiers: Vec<Tier> = ages
            .iter()
            .map(|h| Tier::classify(Some(now() - Duration::hours(*h)), now()))
            .collect();
        assert!(tiers.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_intervals_keep_warm_and_cold_above_hot() {
        let intervals = TierIntervals::new(90, 30, 1);
        assert_eq!(intervals.hot, Duration::minutes(90));
        assert_eq!(intervals.warm, Duration::minutes(91));
        assert_eq!(intervals.cold, Duration::minutes(91));

        let intervals = TierIntervals::default();
        assert_eq!(intervals.for_tier(Tier::Hot), Duration::minutes(10));
        assert_eq!(intervals.for_tier(Tier::Cold), Duration::hours(6));
    }

    #[test]
    fn test_intervals_clamp_out_of_range_values() {
        let intervals = TierIntervals::new(i64::MAX, i64::MIN, i64::MAX);
        assert_eq!(intervals.hot, Duration::minutes(MAX_INTERVAL_MINUTES));
        assert_eq!(intervals.warm, intervals.hot + Duration::minutes(1));
        assert_eq!(intervals.cold, intervals.hot + Duration::minutes(1));
    }

    #[test]
    fn test_parse_tier() {
        assert_eq!(Tier::parse(" Warm "), Some(Tier::Warm));
        assert_eq!(Tier::parse("lukewarm"), None);
    }
}
