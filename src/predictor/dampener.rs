use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Confidence multiplier by the fewer games played of the two teams, used
/// while a period is young. Tiers are checked top-down; the first one whose
/// minimum is met wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EarlyPeriodPolicy {
    /// Days after the period start that still count as early.
    pub window_days: i64,
    /// `(min_games, factor)`, highest `min_games` first.
    pub tiers: Vec<(u32, f64)>,
    /// Factor when no tier matches.
    pub floor_factor: f64,
}

impl Default for EarlyPeriodPolicy {
    fn default() -> Self {
        EarlyPeriodPolicy {
            window_days: 30,
            tiers: vec![(10, 1.00), (7, 0.95), (5, 0.90), (3, 0.85)],
            floor_factor: 0.80,
        }
    }
}

impl EarlyPeriodPolicy {
    /// Factor for a contest on `date` in a period that started on
    /// `period_start`. Always 1.0 outside the early window.
    pub fn factor(
        &self,
        date: NaiveDate,
        period_start: Option<NaiveDate>,
        home_games: u32,
        away_games: u32,
    ) -> f64 {
        let Some(start) = period_start else {
            return 1.0;
        };
        let days_in = (date - start).num_days();
        if days_in < 0 || days_in > self.window_days {
            return 1.0;
        }
        let fewest = home_games.min(away_games);
        self.tiers
            .iter()
            .find(|(min_games, _)| fewest >= *min_games)
            .map_or(self.floor_factor, |(_, f)| *f)
    }
}

/// Pull `p` toward 0.5 by `factor`.
pub fn dampen(p: f64, factor: f64) -> f64 {
    if factor == 1.0 {
        return p;
    }
    0.5 + (p - 0.5) * factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, day).unwrap()
    }

    #[test]
    fn tiers_follow_fewest_games() {
        let policy = EarlyPeriodPolicy::default();
        let start = Some(d(1));
        assert_eq!(policy.factor(d(5), start, 20, 12), 1.00);
        assert_eq!(policy.factor(d(5), start, 20, 7), 0.95);
        assert_eq!(policy.factor(d(5), start, 5, 9), 0.90);
        assert_eq!(policy.factor(d(5), start, 3, 3), 0.85);
        assert_eq!(policy.factor(d(5), start, 2, 30), 0.80);
        assert_eq!(policy.factor(d(5), start, 0, 0), 0.80);
    }

    #[test]
    fn outside_window_is_noop() {
        let policy = EarlyPeriodPolicy {
            window_days: 10,
            ..EarlyPeriodPolicy::default()
        };
        assert_eq!(policy.factor(d(20), Some(d(1)), 0, 0), 1.0);
        assert_eq!(policy.factor(d(5), None, 0, 0), 1.0);
    }

    #[test]
    fn dampen_moves_toward_half() {
        assert_relative_eq!(dampen(0.7, 0.8), 0.66, epsilon = 1e-12);
        assert_relative_eq!(dampen(0.3, 0.8), 0.34, epsilon = 1e-12);
        assert_eq!(dampen(0.73, 1.0), 0.73);
    }
}
