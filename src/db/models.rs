use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::features::FeatureVector;
use crate::predictor::threshold::ThresholdSource;

/// A head-to-head contest between a home and an away team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contest {
    /// External contest/game ID
    pub id: String,
    pub contest_date: NaiveDate,
    /// Season label, e.g. "2023-24"
    pub period: String,
    pub home_team: String,
    pub away_team: String,
    /// Present if and only if `status` is `Final`
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    pub status: ContestStatus,
    /// Played at a neutral venue (no home advantage)
    pub neutral_site: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContestStatus {
    Scheduled,
    Final,
}

impl ContestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContestStatus::Scheduled => "scheduled",
            ContestStatus::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "scheduled" => Some(ContestStatus::Scheduled),
            "final" => Some(ContestStatus::Final),
            _ => None,
        }
    }
}

/// Final score of a completed contest, extracted by [`Contest::completed_score`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalScore {
    pub home: i32,
    pub away: i32,
}

impl Contest {
    /// Validate a completed-history row and return its final score.
    ///
    /// Every identifying field must be non-empty and both scores must be
    /// present on a `Final` contest.
    pub fn completed_score(&self) -> Result<FinalScore, SchemaError> {
        let missing = |field: &'static str| SchemaError::MissingField {
            contest_id: self.id.clone(),
            field,
        };
        if self.id.trim().is_empty() {
            return Err(missing("id"));
        }
        if self.home_team.trim().is_empty() {
            return Err(missing("home_team"));
        }
        if self.away_team.trim().is_empty() {
            return Err(missing("away_team"));
        }
        if self.period.trim().is_empty() {
            return Err(missing("period"));
        }
        if self.status != ContestStatus::Final {
            return Err(missing("status"));
        }
        let home = self.home_score.ok_or_else(|| missing("home_score"))?;
        let away = self.away_score.ok_or_else(|| missing("away_score"))?;
        Ok(FinalScore { home, away })
    }

    pub fn is_final(&self) -> bool {
        self.status == ContestStatus::Final
    }

    /// Scores must be present exactly when the contest is final.
    pub fn check_status(&self) -> Result<(), SchemaError> {
        let has_scores = self.home_score.is_some() && self.away_score.is_some();
        let no_scores = self.home_score.is_none() && self.away_score.is_none();
        let scores = match (self.is_final(), has_scores, no_scores) {
            (true, true, _) | (false, _, true) => return Ok(()),
            (true, ..) => "missing",
            (false, ..) => "present",
        };
        Err(SchemaError::ScoresStatusMismatch {
            contest_id: self.id.clone(),
            status: self.status.as_str(),
            scores,
        })
    }
}

/// Rolling aggregates for one team in one period.
///
/// Keyed by `(entity_id, period)`; a rebuild replaces the whole row.
/// Aggregates are NaN while fewer games than the window have been played.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPeriodFeatures {
    pub entity_id: String,
    pub period: String,
    pub games_played: u32,
    pub win_rate_short: f64,
    pub win_rate_long: f64,
    pub point_diff_short: f64,
    pub point_diff_long: f64,
    pub win_rate_delta: f64,
    pub point_diff_delta: f64,
    pub recent_strength_index: f64,
    pub updated_at: DateTime<Utc>,
}

impl EntityPeriodFeatures {
    pub fn key(&self) -> (&str, &str) {
        (&self.period, &self.entity_id)
    }

    pub fn vector(&self) -> FeatureVector {
        FeatureVector {
            win_rate_short: self.win_rate_short,
            win_rate_long: self.win_rate_long,
            point_diff_short: self.point_diff_short,
            point_diff_long: self.point_diff_long,
            win_rate_delta: self.win_rate_delta,
            point_diff_delta: self.point_diff_delta,
            recent_strength_index: self.recent_strength_index,
        }
    }
}

/// Calibrated prediction for one upcoming contest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub contest_id: String,
    pub home_team: String,
    pub away_team: String,
    pub home_win_prob: f64,
    /// Always `1 - home_win_prob`
    pub away_win_prob: f64,
    pub predicted_winner: String,
    /// max(home_win_prob, away_win_prob)
    pub confidence: f64,
    pub explanation: Option<String>,
    pub predicted_at: DateTime<Utc>,
}

/// A contest withheld because one participant has too little history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowDataExclusion {
    pub contest_id: String,
    pub home_team: String,
    pub away_team: String,
    pub home_games: u32,
    pub away_games: u32,
    pub threshold: u32,
    pub threshold_source: ThresholdSource,
    pub reason: String,
}

/// One persisted fit: the frozen calibration state plus bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRun {
    pub id: Option<i64>,
    pub training_rows: i64,
    /// Serialized `CalibrationState`
    pub calibration_state: String,
    pub trained_at: DateTime<Utc>,
}
