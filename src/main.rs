use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

mod config;
mod db;
mod error;
mod features;
mod predictor;

use config::Config;
use db::models::{Contest, ModelRun};
use db::{ContestHistory, Database, FeatureRepository, PredictionSink};
use features::FeatureStoreBuilder;
use predictor::AdaptivePredictor;

fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;
    let model_config = config.predictor_config()?;

    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    if let Some(path) = &config.import_contests {
        let imported = import_contests(&db, path)?;
        info!("Imported {} contests from {}", imported, path);
    }

    // Feature store: rebuild from every completed contest, keep unrelated keys
    let history = db.completed_contests()?;
    let fresh = FeatureStoreBuilder::default().build(&history)?;
    let merged = FeatureStoreBuilder::merge(db.all_features()?, fresh);
    let written = db.upsert_features(&merged)?;
    info!(
        "Feature store refreshed: {} rows from {} completed contests",
        written,
        history.len()
    );

    if let Some(previous) = db.latest_model_run()? {
        info!(
            "Replacing model run {} trained at {} on {} rows",
            previous.id.unwrap_or_default(),
            previous.trained_at,
            previous.training_rows
        );
    }
    let model = AdaptivePredictor::new(model_config).fit(&history, &db)?;
    info!(
        "Model fit on {} rows with {} feature columns",
        model.training_rows(),
        model.schema().width()
    );
    let run_id = db.record_model_run(&ModelRun {
        id: None,
        training_rows: model.training_rows() as i64,
        calibration_state: serde_json::to_string(model.state())?,
        trained_at: Utc::now(),
    })?;
    info!("Model run {} recorded", run_id);

    let upcoming = db.upcoming_contests()?;
    if upcoming.is_empty() {
        info!("No upcoming contests to predict");
        return Ok(());
    }
    let batch = model.predict(&upcoming, &db);

    let mut stored = 0;
    for prediction in &batch.predictions {
        match db.upsert_prediction(prediction) {
            Ok(()) => stored += 1,
            Err(e) => warn!(
                "Failed to store prediction for {}: {}",
                prediction.contest_id, e
            ),
        }
    }
    for prediction in db.list_predictions(stored)? {
        info!(
            "{} vs {}: {} ({:.1}%)",
            prediction.home_team,
            prediction.away_team,
            prediction.predicted_winner,
            prediction.confidence * 100.0
        );
    }
    for exclusion in &batch.exclusions {
        if let Err(e) = db.append_exclusion(exclusion) {
            warn!(
                "Failed to log exclusion for {}: {}",
                exclusion.contest_id, e
            );
            continue;
        }
        let logged = db.list_exclusions(&exclusion.contest_id)?.len();
        if logged > 1 {
            info!(
                "Contest {} has been excluded in {} runs",
                exclusion.contest_id, logged
            );
        }
    }

    info!(
        "Run complete: {} predictions, {} exclusions, {} failures",
        batch.predictions.len(),
        batch.exclusions.len(),
        batch.failed
    );
    Ok(())
}

fn import_contests(db: &Database, path: &str) -> Result<usize> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let contests: Vec<Contest> =
        serde_json::from_str(&raw).with_context(|| format!("parsing contests in {path}"))?;
    store_contests(db, &contests)
}

/// Upsert contests, skipping rows whose scores disagree with their status.
fn store_contests(db: &Database, contests: &[Contest]) -> Result<usize> {
    let mut stored = 0;
    for contest in contests {
        if let Err(e) = contest.check_status() {
            warn!("Rejecting contest: {}", e);
            continue;
        }
        db.upsert_contest(contest)?;
        stored += 1;
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crate::db::models::ContestStatus;

    fn contest(id: &str, status: ContestStatus, score: Option<(i32, i32)>) -> Contest {
        Contest {
            id: id.into(),
            contest_date: NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
            period: "2024".into(),
            home_team: "Hawks".into(),
            away_team: "Owls".into(),
            home_score: score.map(|s| s.0),
            away_score: score.map(|s| s.1),
            status,
            neutral_site: false,
        }
    }

    #[test]
    fn import_skips_contests_whose_scores_disagree_with_status() {
        let db = Database::open(":memory:").unwrap();
        let rows = [
            contest("ok-final", ContestStatus::Final, Some((2, 1))),
            contest("final-no-score", ContestStatus::Final, None),
            contest("scheduled-with-score", ContestStatus::Scheduled, Some((0, 0))),
            contest("ok-scheduled", ContestStatus::Scheduled, None),
        ];
        assert_eq!(store_contests(&db, &rows).unwrap(), 2);

        let done: Vec<String> = db.completed_contests().unwrap().into_iter().map(|c| c.id).collect();
        let todo: Vec<String> = db.upcoming_contests().unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(done, ["ok-final"]);
        assert_eq!(todo, ["ok-scheduled"]);
    }
}
