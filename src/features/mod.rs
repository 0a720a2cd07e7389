//! Per-team rolling feature store.
//!
//! - [`builder`]: turns completed contests into one row per (team, period)
//! - [`calendar`]: orders periods and knows when each one started
//! - [`resolver`]: three-tier lookup (current → prior → league average)

pub mod builder;
pub mod calendar;
pub mod resolver;

use serde::{Deserialize, Serialize};

pub use builder::FeatureStoreBuilder;
pub use calendar::PeriodCalendar;
pub use resolver::{FeatureResolver, ResolvedFeatures};

/// The rolling aggregates fed to the classifier for one team.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub win_rate_short: f64,
    pub win_rate_long: f64,
    pub point_diff_short: f64,
    pub point_diff_long: f64,
    pub win_rate_delta: f64,
    pub point_diff_delta: f64,
    pub recent_strength_index: f64,
}

impl FeatureVector {
    pub const LEN: usize = 7;

    pub const NAMES: [&'static str; Self::LEN] = [
        "win_rate_short",
        "win_rate_long",
        "point_diff_short",
        "point_diff_long",
        "win_rate_delta",
        "point_diff_delta",
        "recent_strength_index",
    ];

    /// Coin-flip team: .500 record, even point differential.
    pub const NEUTRAL: FeatureVector = FeatureVector {
        win_rate_short: 0.5,
        win_rate_long: 0.5,
        point_diff_short: 0.0,
        point_diff_long: 0.0,
        win_rate_delta: 0.0,
        point_diff_delta: 0.0,
        recent_strength_index: 0.0,
    };

    pub fn values(&self) -> [f64; Self::LEN] {
        [
            self.win_rate_short,
            self.win_rate_long,
            self.point_diff_short,
            self.point_diff_long,
            self.win_rate_delta,
            self.point_diff_delta,
            self.recent_strength_index,
        ]
    }

    pub fn from_values(v: [f64; Self::LEN]) -> Self {
        FeatureVector {
            win_rate_short: v[0],
            win_rate_long: v[1],
            point_diff_short: v[2],
            point_diff_long: v[3],
            win_rate_delta: v[4],
            point_diff_delta: v[5],
            recent_strength_index: v[6],
        }
    }

    pub fn has_missing(&self) -> bool {
        self.values().iter().any(|v| !v.is_finite())
    }

    /// Replace every non-finite value with the matching value from `fallback`.
    pub fn fill_missing(&self, fallback: &FeatureVector) -> FeatureVector {
        let mut out = self.values();
        for (v, fb) in out.iter_mut().zip(fallback.values()) {
            if !v.is_finite() {
                *v = fb;
            }
        }
        FeatureVector::from_values(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_missing_only_touches_nan_fields() {
        let mut v = FeatureVector::NEUTRAL;
        v.win_rate_short = 0.8;
        v.point_diff_long = f64::NAN;
        let filled = v.fill_missing(&FeatureVector {
            point_diff_long: 4.5,
            ..FeatureVector::NEUTRAL
        });
        assert_eq!(filled.win_rate_short, 0.8);
        assert_eq!(filled.point_diff_long, 4.5);
        assert!(!filled.has_missing());
    }

    #[test]
    fn values_round_trip_through_array() {
        let v = FeatureVector::from_values([1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(v.values(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(v.recent_strength_index, 7.0);
    }
}
