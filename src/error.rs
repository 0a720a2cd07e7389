use thiserror::Error;

/// Failures that abort a fit or a feature-store build.
#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("schema validation failed: {0}")]
    Schema(#[from] SchemaError),

    #[error("no completed contests to train on")]
    EmptyTrainingSet,

    #[error("store access failed: {0}")]
    Store(#[from] anyhow::Error),
}

/// Input history does not carry what the feature contract requires.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("table '{table}' is missing required columns: {}", columns.join(", "))]
    MissingColumns { table: String, columns: Vec<String> },

    #[error("contest '{contest_id}' is missing required field '{field}'")]
    MissingField { contest_id: String, field: &'static str },

    #[error("contest '{contest_id}' has status '{status}' but scores are {scores}")]
    ScoresStatusMismatch {
        contest_id: String,
        status: &'static str,
        scores: &'static str,
    },
}

/// A calibration stage could not be fit; callers fall back to a documented default.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("not enough samples ({got}, need {need})")]
    TooFewSamples { got: usize, need: usize },

    #[error("outcomes contain a single class")]
    SingleClass,

    #[error("target {0} is outside (0, 1)")]
    InvalidTarget(f64),

    #[error("bisection ended {gap:.5} away from target")]
    NotConverged { gap: f64 },

    #[error("degenerate denominator {0:e}")]
    Degenerate(f64),

    #[error("fit produced non-finite parameters")]
    NonFinite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_columns_message_lists_every_column() {
        let err = SchemaError::MissingColumns {
            table: "contests".into(),
            columns: vec!["home_score".into(), "period".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("home_score, period"), "got {msg}");
    }

    #[test]
    fn schema_error_converts_into_predictor_error() {
        let err: PredictorError = SchemaError::MissingField {
            contest_id: "c1".into(),
            field: "away_score",
        }
        .into();
        assert!(matches!(err, PredictorError::Schema(_)));
    }
}
