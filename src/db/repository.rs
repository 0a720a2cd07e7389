use anyhow::Result;

use super::models::{Contest, EntityPeriodFeatures, LowDataExclusion, Prediction};

/// Read side of the contest history.
pub trait ContestHistory: Send + Sync {
    /// All contests with status `final`, oldest first.
    fn completed_contests(&self) -> Result<Vec<Contest>>;

    /// All contests with status `scheduled`, oldest first.
    fn upcoming_contests(&self) -> Result<Vec<Contest>>;
}

/// Keyed access to the per-team, per-period feature store.
pub trait FeatureRepository: Send + Sync {
    fn get_features(&self, entity_id: &str, period: &str) -> Result<Option<EntityPeriodFeatures>>;

    fn features_for_period(&self, period: &str) -> Result<Vec<EntityPeriodFeatures>>;

    fn all_features(&self) -> Result<Vec<EntityPeriodFeatures>>;

    /// Insert or fully replace rows by `(entity_id, period)`.
    fn upsert_features(&self, rows: &[EntityPeriodFeatures]) -> Result<usize>;
}

/// Destination for predictions and low-data diagnostics.
pub trait PredictionSink: Send + Sync {
    fn upsert_prediction(&self, prediction: &Prediction) -> Result<()>;

    fn append_exclusion(&self, exclusion: &LowDataExclusion) -> Result<()>;
}
