use std::collections::HashMap;
use tracing::warn;

use super::threshold::ThresholdSelection;
use crate::db::models::{Contest, LowDataExclusion};

/// Games played per team across the fitted history.
#[derive(Debug, Clone, Default)]
pub struct GamesPlayed {
    counts: HashMap<String, u32>,
}

impl GamesPlayed {
    pub fn from_history(history: &[Contest]) -> Self {
        let mut counts = HashMap::new();
        for c in history {
            for team in [&c.home_team, &c.away_team] {
                *counts.entry(team.clone()).or_insert(0) += 1;
            }
        }
        GamesPlayed { counts }
    }

    pub fn get(&self, team: &str) -> u32 {
        self.counts.get(team).copied().unwrap_or(0)
    }
}

/// Withholds predictions for contests whose weaker side has too little
/// history.
#[derive(Debug, Clone)]
pub struct LowDataGate {
    threshold: ThresholdSelection,
}

impl LowDataGate {
    pub fn new(threshold: ThresholdSelection) -> Self {
        LowDataGate { threshold }
    }

    /// `Some(exclusion)` when the contest must be skipped.
    pub fn check(&self, contest: &Contest, games: &GamesPlayed) -> Option<LowDataExclusion> {
        let home_games = games.get(&contest.home_team);
        let away_games = games.get(&contest.away_team);
        let threshold = self.threshold.value;
        if home_games.min(away_games) >= threshold {
            return None;
        }

        let short: Vec<String> = [
            (&contest.home_team, home_games),
            (&contest.away_team, away_games),
        ]
        .iter()
        .filter(|(_, n)| *n < threshold)
        .map(|(team, n)| format!("{team} has {n} games"))
        .collect();
        let reason = format!(
            "{} (home {}, away {}; minimum {} from {})",
            short.join(", "),
            home_games,
            away_games,
            threshold,
            self.threshold.source
        );
        warn!("Excluding contest {}: {}", contest.id, reason);
        Some(LowDataExclusion {
            contest_id: contest.id.clone(),
            home_team: contest.home_team.clone(),
            away_team: contest.away_team.clone(),
            home_games,
            away_games,
            threshold,
            threshold_source: self.threshold.source,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ContestStatus;
    use crate::predictor::threshold::ThresholdSource;
    use chrono::NaiveDate;

    fn contest(id: &str, home: &str, away: &str) -> Contest {
        Contest {
            id: id.into(),
            contest_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            period: "2024".into(),
            home_team: home.into(),
            away_team: away.into(),
            home_score: Some(2),
            away_score: Some(1),
            status: ContestStatus::Final,
            neutral_site: false,
        }
    }

    fn history(team_games: &[(&str, usize)]) -> Vec<Contest> {
        let mut out = Vec::new();
        for (team, n) in team_games {
            for i in 0..*n {
                out.push(contest(&format!("{team}{i}"), team, "Filler"));
            }
        }
        out
    }

    #[test]
    fn excludes_contest_below_threshold_and_explains() {
        let games = GamesPlayed::from_history(&history(&[("Rookies", 2), ("Veterans", 9)]));
        let gate = LowDataGate::new(ThresholdSelection {
            value: 5,
            source: ThresholdSource::Fixed,
        });
        let ex = gate
            .check(&contest("c1", "Rookies", "Veterans"), &games)
            .expect("excluded");
        assert_eq!((ex.home_games, ex.away_games), (2, 9));
        assert_eq!(ex.threshold, 5);
        assert!(ex.reason.contains('2'));
        assert!(ex.reason.contains('5'));
        assert!(ex.reason.contains("Rookies"));
        assert!(!ex.reason.contains("Veterans has"));
    }

    #[test]
    fn passes_when_both_teams_meet_threshold() {
        let games = GamesPlayed::from_history(&history(&[("A", 5), ("B", 6)]));
        let gate = LowDataGate::new(ThresholdSelection {
            value: 5,
            source: ThresholdSource::AutoCurrentPeriod,
        });
        assert!(gate.check(&contest("c2", "A", "B"), &games).is_none());
    }

    #[test]
    fn unknown_team_has_zero_games() {
        let games = GamesPlayed::from_history(&history(&[("A", 12)]));
        let gate = LowDataGate::new(ThresholdSelection {
            value: 10,
            source: ThresholdSource::AutoFloor,
        });
        let ex = gate.check(&contest("c3", "A", "Nobody"), &games).unwrap();
        assert_eq!(ex.away_games, 0);
        assert!(ex.reason.contains("auto_floor"));
    }
}
