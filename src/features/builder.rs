use chrono::{NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::db::models::{Contest, EntityPeriodFeatures};
use crate::error::SchemaError;

/// Games in the short rolling window.
pub const SHORT_WINDOW: usize = 5;
/// Games in the long rolling window.
pub const LONG_WINDOW: usize = 10;

/// One contest seen from one participant's side.
#[derive(Debug, Clone)]
struct TeamGame {
    date: NaiveDate,
    contest_id: String,
    won: f64,
    point_diff: f64,
}

/// Computes rolling per-team, per-period aggregates from completed contests.
#[derive(Debug, Clone, Copy)]
pub struct FeatureStoreBuilder {
    pub short_window: usize,
    pub long_window: usize,
}

impl Default for FeatureStoreBuilder {
    fn default() -> Self {
        FeatureStoreBuilder {
            short_window: SHORT_WINDOW,
            long_window: LONG_WINDOW,
        }
    }
}

impl FeatureStoreBuilder {
    /// Build one row per (period, team). Fails on the first history row that
    /// lacks an id, team, period or final score.
    pub fn build(&self, history: &[Contest]) -> Result<Vec<EntityPeriodFeatures>, SchemaError> {
        let mut groups: BTreeMap<(String, String), Vec<TeamGame>> = BTreeMap::new();
        for contest in history {
            let score = contest.completed_score()?;
            let diff = (score.home - score.away) as f64;
            let sides = [
                (&contest.home_team, score.home > score.away, diff),
                (&contest.away_team, score.away > score.home, -diff),
            ];
            for (team, won, point_diff) in sides {
                groups
                    .entry((contest.period.clone(), team.clone()))
                    .or_default()
                    .push(TeamGame {
                        date: contest.contest_date,
                        contest_id: contest.id.clone(),
                        won: if won { 1.0 } else { 0.0 },
                        point_diff,
                    });
            }
        }

        let now = Utc::now();
        let mut rows = Vec::with_capacity(groups.len());
        for ((period, entity_id), mut games) in groups {
            games.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.contest_id.cmp(&b.contest_id)));
            let won: Vec<f64> = games.iter().map(|g| g.won).collect();
            let diff: Vec<f64> = games.iter().map(|g| g.point_diff).collect();

            let win_rate_short = last(&rolling_mean(&won, self.short_window));
            let win_rate_long = last(&rolling_mean(&won, self.long_window));
            let point_diff_short = last(&rolling_mean(&diff, self.short_window));
            let point_diff_long = last(&rolling_mean(&diff, self.long_window));

            rows.push(EntityPeriodFeatures {
                entity_id,
                period,
                games_played: games.len() as u32,
                win_rate_short,
                win_rate_long,
                point_diff_short,
                point_diff_long,
                win_rate_delta: win_rate_short - win_rate_long,
                point_diff_delta: point_diff_short - point_diff_long,
                recent_strength_index: win_rate_short * point_diff_short,
                updated_at: now,
            });
        }
        info!(
            "Feature store built: {} contests -> {} team-period rows",
            history.len(),
            rows.len()
        );
        Ok(rows)
    }

    /// Merge freshly built rows into an existing store. Fresh rows replace
    /// existing rows with the same (period, team) key; other rows are kept.
    pub fn merge(
        existing: Vec<EntityPeriodFeatures>,
        fresh: Vec<EntityPeriodFeatures>,
    ) -> Vec<EntityPeriodFeatures> {
        let mut by_key: HashMap<(String, String), EntityPeriodFeatures> = HashMap::new();
        for row in existing.into_iter().chain(fresh) {
            by_key.insert((row.period.clone(), row.entity_id.clone()), row);
        }
        let mut merged: Vec<_> = by_key.into_values().collect();
        merged.sort_by(|a, b| a.key().cmp(&b.key()));
        debug!("Merged feature store holds {} rows", merged.len());
        merged
    }
}

/// Trailing mean over `window` values; NaN until `window` values exist.
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate() {
        sum += v;
        if i >= window {
            sum -= values[i - window];
        }
        if window == 0 || i + 1 < window {
            out.push(f64::NAN);
        } else {
            out.push(sum / window as f64);
        }
    }
    out
}

fn last(series: &[f64]) -> f64 {
    series.last().copied().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ContestStatus;
    use approx::assert_relative_eq;

    fn game(id: &str, day: u32, home: &str, away: &str, hs: i32, aws: i32) -> Contest {
        Contest {
            id: id.into(),
            contest_date: NaiveDate::from_ymd_opt(2024, 2, day).unwrap(),
            period: "2024".into(),
            home_team: home.into(),
            away_team: away.into(),
            home_score: Some(hs),
            away_score: Some(aws),
            status: ContestStatus::Final,
            neutral_site: false,
        }
    }

    #[test]
    fn rolling_mean_is_nan_until_window_fills() {
        let r = rolling_mean(&[1.0, 0.0, 1.0, 1.0], 3);
        assert!(r[0].is_nan() && r[1].is_nan());
        assert_relative_eq!(r[2], 2.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(r[3], 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn builds_short_window_stats_and_nan_long_window() {
        // Hawks win 4 of 6, alternating opponents; listed out of order on purpose.
        let history = vec![
            game("g6", 6, "Hawks", "Owls", 90, 80),
            game("g1", 1, "Hawks", "Owls", 100, 90),
            game("g2", 2, "Owls", "Hawks", 95, 85),
            game("g3", 3, "Hawks", "Owls", 99, 98),
            game("g4", 4, "Owls", "Hawks", 70, 72),
            game("g5", 5, "Hawks", "Owls", 60, 66),
        ];
        let rows = FeatureStoreBuilder::default().build(&history).unwrap();
        let hawks = rows.iter().find(|r| r.entity_id == "Hawks").unwrap();
        assert_eq!(hawks.games_played, 6);
        // Last five (g2..g6): L, W, W, L, W
        assert_relative_eq!(hawks.win_rate_short, 0.6, epsilon = 1e-12);
        // Diffs: -10, +1, +2, -6, +10
        assert_relative_eq!(hawks.point_diff_short, -0.6, epsilon = 1e-12);
        assert_relative_eq!(hawks.recent_strength_index, 0.6 * -0.6, epsilon = 1e-12);
        assert!(hawks.win_rate_long.is_nan());
        assert!(hawks.win_rate_delta.is_nan());
    }

    #[test]
    fn missing_score_fails_fast() {
        let mut bad = game("g1", 1, "Hawks", "Owls", 1, 0);
        bad.home_score = None;
        let err = FeatureStoreBuilder::default()
            .build(&[game("g0", 1, "Owls", "Hawks", 2, 2), bad])
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::MissingField {
                contest_id: "g1".into(),
                field: "home_score"
            }
        );
    }

    #[test]
    fn draws_count_as_non_wins_for_both_sides() {
        let rows = FeatureStoreBuilder {
            short_window: 1,
            long_window: 1,
        }
        .build(&[game("g1", 1, "Hawks", "Owls", 3, 3)])
        .unwrap();
        assert!(rows.iter().all(|r| r.win_rate_short == 0.0 && r.point_diff_short == 0.0));
    }

    #[test]
    fn merge_replaces_matching_keys_and_keeps_the_rest() {
        let builder = FeatureStoreBuilder::default();
        let old = builder
            .build(&[game("g1", 1, "Hawks", "Owls", 1, 0)])
            .unwrap();
        let mut other_period = game("x1", 1, "Bears", "Wolves", 2, 1);
        other_period.period = "2023".into();
        let old = FeatureStoreBuilder::merge(old, builder.build(&[other_period]).unwrap());
        assert_eq!(old.len(), 4);

        let fresh = builder
            .build(&[
                game("g1", 1, "Hawks", "Owls", 1, 0),
                game("g2", 2, "Owls", "Hawks", 1, 0),
            ])
            .unwrap();
        let merged = FeatureStoreBuilder::merge(old, fresh);
        assert_eq!(merged.len(), 4);
        let hawks = merged
            .iter()
            .find(|r| r.entity_id == "Hawks" && r.period == "2024")
            .unwrap();
        assert_eq!(hawks.games_played, 2);
        assert!(merged.iter().any(|r| r.entity_id == "Bears" && r.period == "2023"));
    }
}
