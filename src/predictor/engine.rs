//! Fit and inference entry points.
//!
//! [`AdaptivePredictor::fit`] runs every training stage to completion and
//! returns an immutable [`FittedModel`]. Refitting builds a new model; an
//! existing one is never mutated, so it can be shared across threads for
//! read-only inference.

use anyhow::bail;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::calibration::{
    apply_shift, fit_confidence_temperature, fit_venue_shift, CalibrationPipeline,
    CalibrationSample, CalibrationState, ProbabilityCalibrator, StageSource,
};
use super::dampener::dampen;
use super::encoder::EntityEncoder;
use super::forest::{ForestParams, RandomForest};
use super::gate::{GamesPlayed, LowDataGate};
use super::threshold::select_threshold;
use crate::config::{PredictorConfig, VenueShiftMode};
use crate::db::models::{Contest, LowDataExclusion, Prediction};
use crate::db::FeatureRepository;
use crate::error::PredictorError;
use crate::features::{FeatureResolver, FeatureVector, PeriodCalendar, ResolvedFeatures};

/// Optional stages, decided once when a fit starts and carried by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub probability_calibration: bool,
    pub smart_encoding: bool,
    pub early_period_adjustment: bool,
    /// The feature store held rows when training began
    pub feature_store: bool,
}

impl Capabilities {
    pub fn resolve(config: &PredictorConfig, store_rows: usize) -> Self {
        Capabilities {
            probability_calibration: config.calibrate,
            smart_encoding: config.use_smart_encoding,
            early_period_adjustment: config.use_early_period_adjustment,
            feature_store: store_rows > 0,
        }
    }
}

/// Column layout of the classifier input, fixed per fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSchema {
    columns: Vec<String>,
}

impl Default for FeatureSchema {
    fn default() -> Self {
        let mut columns = vec!["home_idx".to_string(), "away_idx".to_string()];
        for side in ["home", "away"] {
            columns.extend(FeatureVector::NAMES.iter().map(|n| format!("{side}_{n}")));
        }
        FeatureSchema { columns }
    }
}

impl FeatureSchema {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn row(
        &self,
        home_idx: usize,
        away_idx: usize,
        home: &FeatureVector,
        away: &FeatureVector,
    ) -> Vec<f64> {
        let mut row = Vec::with_capacity(self.width());
        row.push(home_idx as f64);
        row.push(away_idx as f64);
        row.extend_from_slice(&home.values());
        row.extend_from_slice(&away.values());
        debug_assert_eq!(row.len(), self.width());
        row
    }
}

/// Predictions for the non-excluded contests of one batch, plus the
/// exclusions.
#[derive(Debug, Clone, Default)]
pub struct PredictionBatch {
    pub predictions: Vec<Prediction>,
    pub exclusions: Vec<LowDataExclusion>,
    /// Contests skipped because scoring them failed
    pub failed: usize,
}

pub struct AdaptivePredictor {
    config: PredictorConfig,
}

impl AdaptivePredictor {
    pub fn new(config: PredictorConfig) -> Self {
        AdaptivePredictor { config }
    }

    /// Train the forest and fit every calibration stage on completed history.
    ///
    /// Fails on schema violations, an empty history, or store errors.
    /// Calibration problems never fail the fit; they fall back and are
    /// recorded in the state's source tags.
    pub fn fit(
        &self,
        history: &[Contest],
        store: &dyn FeatureRepository,
    ) -> Result<FittedModel, PredictorError> {
        let cfg = &self.config;
        let mut labels = Vec::with_capacity(history.len());
        for contest in history {
            let score = contest.completed_score()?;
            labels.push(if score.home > score.away { 1.0 } else { 0.0 });
        }
        if history.is_empty() {
            return Err(PredictorError::EmptyTrainingSet);
        }

        let capabilities = Capabilities::resolve(cfg, store.all_features()?.len());
        info!("Fit capabilities: {:?}", capabilities);
        if !capabilities.feature_store {
            warn!("Feature store is empty; every team trains on neutral features");
        }

        let calendar = PeriodCalendar::from_contests(history);
        let encoder = EntityEncoder::fit(
            history
                .iter()
                .flat_map(|c| [c.home_team.as_str(), c.away_team.as_str()]),
            capabilities.smart_encoding,
        );
        let schema = FeatureSchema::default();

        let resolver = FeatureResolver::new(store, cfg.feature_min_games);
        let mut x = Vec::with_capacity(history.len());
        for contest in history {
            let prior = calendar.prior(&contest.period);
            let home = resolver.resolve(&contest.home_team, &contest.period, prior)?;
            let away = resolver.resolve(&contest.away_team, &contest.period, prior)?;
            x.push(schema.row(
                encoder.encode(&contest.home_team),
                encoder.encode(&contest.away_team),
                &home.vector,
                &away.vector,
            ));
        }
        info!(
            "Training matrix: {} rows x {} columns, {} teams",
            x.len(),
            schema.width(),
            encoder.n_classes()
        );
        debug!("Feature columns: {}", schema.columns().join(", "));

        let threshold = select_threshold(history, cfg.min_games_threshold, &cfg.threshold);
        let params = cfg.forest_params();

        // Out-of-fold probabilities feed every calibration stage.
        let oof = out_of_fold(&x, &labels, &params, cfg.calibration_folds)?;
        let held_out: Vec<(f64, f64)> = oof
            .iter()
            .zip(&labels)
            .filter(|(p, _)| p.is_finite())
            .map(|(p, y)| (*p, *y))
            .collect();

        let (calibrator, probability_source) = if capabilities.probability_calibration {
            match ProbabilityCalibrator::fit(cfg.calibration_method, &held_out) {
                Ok(c) => (Some(c), StageSource::Auto),
                Err(e) => {
                    warn!(
                        "Probability calibration ({}) failed: {}; using raw forest output",
                        cfg.calibration_method, e
                    );
                    (None, StageSource::Fallback)
                }
            }
        } else {
            (None, StageSource::Disabled)
        };

        let samples: Vec<CalibrationSample> = oof
            .iter()
            .zip(&labels)
            .zip(history)
            .filter(|((p, _), _)| p.is_finite())
            .map(|((p, y), c)| CalibrationSample {
                prob: calibrator.as_ref().map_or(*p, |cal| cal.apply(*p)),
                label: *y,
                neutral_site: c.neutral_site,
            })
            .collect();

        let (venue_shift, venue_shift_source, venue_target) =
            fit_venue_shift(&samples, cfg.venue_logit_shift);
        let shifted: Vec<(f64, f64)> = samples
            .iter()
            .map(|s| {
                let p = if s.neutral_site || cfg.venue_logit_shift == VenueShiftMode::Disabled {
                    s.prob
                } else {
                    apply_shift(s.prob, venue_shift)
                };
                (p, s.label)
            })
            .collect();
        let (temperature, temperature_source) = fit_confidence_temperature(
            &shifted,
            cfg.confidence_temperature,
            cfg.temperature_min,
            cfg.temperature_max,
        );

        let forest = RandomForest::fit(&x, &labels, &params)?;

        let state = CalibrationState {
            probability_calibration: calibrator.as_ref().map(|_| cfg.calibration_method),
            probability_source,
            venue_shift,
            venue_shift_source,
            venue_target,
            temperature,
            temperature_source,
            min_games: threshold,
        };
        info!(
            "Fit complete: calibration={}, shift={:.4} ({}), temperature={:.4} ({}), min games={} ({})",
            state.probability_source,
            state.venue_shift,
            state.venue_shift_source,
            state.temperature,
            state.temperature_source,
            threshold.value,
            threshold.source
        );

        Ok(FittedModel {
            config: cfg.clone(),
            capabilities,
            schema,
            encoder,
            forest,
            pipeline: CalibrationPipeline { calibrator, state },
            calendar,
            games: GamesPlayed::from_history(history),
            gate: LowDataGate::new(threshold),
            training_rows: x.len(),
        })
    }
}

/// Forest probabilities for each row from a model that never saw it.
/// Rows whose fold could not be trained stay NaN.
fn out_of_fold(
    x: &[Vec<f64>],
    y: &[f64],
    params: &ForestParams,
    folds: usize,
) -> Result<Vec<f64>, PredictorError> {
    let folds = folds.max(2);
    let mut oof = vec![f64::NAN; x.len()];
    for fold in 0..folds {
        let (held, train): (Vec<usize>, Vec<usize>) = (0..x.len()).partition(|i| i % folds == fold);
        if held.is_empty() || train.is_empty() {
            continue;
        }
        let train_x: Vec<Vec<f64>> = train.iter().map(|&i| x[i].clone()).collect();
        let train_y: Vec<f64> = train.iter().map(|&i| y[i]).collect();
        let fold_params = ForestParams {
            seed: params.seed.wrapping_add(fold as u64 + 1),
            ..*params
        };
        let forest = RandomForest::fit(&train_x, &train_y, &fold_params)?;
        for i in held {
            oof[i] = forest.predict_proba(&x[i]);
        }
    }
    Ok(oof)
}

/// A trained forest with its frozen calibration, ready for inference.
pub struct FittedModel {
    config: PredictorConfig,
    capabilities: Capabilities,
    schema: FeatureSchema,
    encoder: EntityEncoder,
    forest: RandomForest,
    pipeline: CalibrationPipeline,
    calendar: PeriodCalendar,
    games: GamesPlayed,
    gate: LowDataGate,
    training_rows: usize,
}

impl FittedModel {
    pub fn state(&self) -> &CalibrationState {
        &self.pipeline.state
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn training_rows(&self) -> usize {
        self.training_rows
    }

    /// Score a batch of upcoming contests.
    ///
    /// Low-data contests become exclusions. A contest that fails to score is
    /// logged and skipped; the rest of the batch still runs.
    pub fn predict(&self, upcoming: &[Contest], store: &dyn FeatureRepository) -> PredictionBatch {
        let mut calendar = self.calendar.clone();
        calendar.extend(upcoming);
        let resolver = FeatureResolver::new(store, self.config.feature_min_games);

        let mut batch = PredictionBatch::default();
        for contest in upcoming {
            if let Some(exclusion) = self.gate.check(contest, &self.games) {
                batch.exclusions.push(exclusion);
                continue;
            }
            match self.score(contest, &calendar, &resolver) {
                Ok(prediction) => batch.predictions.push(prediction),
                Err(e) => {
                    warn!("Skipping contest {}: {:#}", contest.id, e);
                    batch.failed += 1;
                }
            }
        }
        info!(
            "Scored {} contests: {} predicted, {} excluded, {} failed",
            upcoming.len(),
            batch.predictions.len(),
            batch.exclusions.len(),
            batch.failed
        );
        batch
    }

    fn score(
        &self,
        contest: &Contest,
        calendar: &PeriodCalendar,
        resolver: &FeatureResolver<'_>,
    ) -> anyhow::Result<Prediction> {
        if contest.home_team.trim().is_empty() || contest.away_team.trim().is_empty() {
            bail!("contest is missing a team name");
        }
        if contest.period.trim().is_empty() {
            bail!("contest has no period");
        }

        let prior = calendar.prior(&contest.period);
        let home = resolver.resolve(&contest.home_team, &contest.period, prior)?;
        let away = resolver.resolve(&contest.away_team, &contest.period, prior)?;
        let row = self.schema.row(
            self.encoder.encode(&contest.home_team),
            self.encoder.encode(&contest.away_team),
            &home.vector,
            &away.vector,
        );
        if row.len() != self.forest.n_features() {
            bail!(
                "feature row has {} columns, model was fit on {}",
                row.len(),
                self.forest.n_features()
            );
        }

        let raw = self.forest.predict_proba(&row);
        let calibrated = self.pipeline.apply(raw, contest.neutral_site);
        let factor = if self.capabilities.early_period_adjustment {
            self.config.early_period.factor(
                contest.contest_date,
                calendar.start_of(&contest.period),
                home.games_played,
                away.games_played,
            )
        } else {
            1.0
        };
        let home_win_prob = dampen(calibrated, factor).clamp(0.0, 1.0);
        if !home_win_prob.is_finite() {
            bail!("non-finite probability from raw {raw}");
        }
        let away_win_prob = 1.0 - home_win_prob;

        let predicted_winner = if home_win_prob >= away_win_prob {
            contest.home_team.clone()
        } else {
            contest.away_team.clone()
        };
        let confidence = home_win_prob.max(away_win_prob);
        let explanation =
            self.explain(contest, &predicted_winner, confidence, &home, &away, factor);

        Ok(Prediction {
            contest_id: contest.id.clone(),
            home_team: contest.home_team.clone(),
            away_team: contest.away_team.clone(),
            home_win_prob,
            away_win_prob,
            predicted_winner,
            confidence,
            explanation: Some(explanation),
            predicted_at: Utc::now(),
        })
    }

    fn explain(
        &self,
        contest: &Contest,
        winner: &str,
        confidence: f64,
        home: &ResolvedFeatures,
        away: &ResolvedFeatures,
        factor: f64,
    ) -> String {
        let state = self.state();
        let shift = if contest.neutral_site {
            "neutral site, no venue shift".to_string()
        } else {
            format!("venue shift {:.3} ({})", state.venue_shift, state.venue_shift_source)
        };
        format!(
            "{} favoured at {:.1}%. Features: {} {}, {} {}. {}; temperature {:.3} ({}); early-period factor {:.2}",
            winner,
            confidence * 100.0,
            contest.home_team,
            home.tier,
            contest.away_team,
            away.tier,
            shift,
            state.temperature,
            state.temperature_source,
            factor
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MinGamesMode, TemperatureMode};
    use crate::db::models::ContestStatus;
    use crate::db::Database;
    use crate::features::FeatureStoreBuilder;
    use crate::predictor::threshold::ThresholdSource;
    use chrono::{Duration, NaiveDate};

    const TEAMS: [(&str, i32); 6] = [
        ("Aces", 12),
        ("Bolts", 8),
        ("Comets", 4),
        ("Drakes", -4),
        ("Eagles", -8),
        ("Foxes", -12),
    ];

    /// Double round robin per period; the stronger side plus a small home
    /// edge decides the score.
    fn league(periods: &[(&str, i32)]) -> Vec<Contest> {
        let mut out = Vec::new();
        for (period, year) in periods {
            let mut date = NaiveDate::from_ymd_opt(*year, 1, 1).unwrap();
            let mut n = 0;
            for round in 0..3 {
                for (hi, (home, hs)) in TEAMS.iter().enumerate() {
                    for (ai, (away, as_)) in TEAMS.iter().enumerate() {
                        if hi == ai {
                            continue;
                        }
                        let swing = ((n * 7 + round * 3) % 9) as i32 - 4;
                        let margin = hs - as_ + 2 + swing;
                        let (home_score, away_score) = if margin > 0 {
                            (100 + margin, 100)
                        } else {
                            (100, 101 - margin)
                        };
                        out.push(Contest {
                            id: format!("{period}-{n}"),
                            contest_date: date,
                            period: period.to_string(),
                            home_team: home.to_string(),
                            away_team: away.to_string(),
                            home_score: Some(home_score),
                            away_score: Some(away_score),
                            status: ContestStatus::Final,
                            neutral_site: n % 10 == 0,
                        });
                        n += 1;
                        date += Duration::days(1);
                    }
                }
            }
        }
        out
    }

    fn upcoming(id: &str, home: &str, away: &str, date: NaiveDate) -> Contest {
        Contest {
            id: id.into(),
            contest_date: date,
            period: "2024".into(),
            home_team: home.into(),
            away_team: away.into(),
            home_score: None,
            away_score: None,
            status: ContestStatus::Scheduled,
            neutral_site: false,
        }
    }

    fn test_config() -> PredictorConfig {
        PredictorConfig {
            base_estimator_count: 15,
            min_games_threshold: MinGamesMode::Fixed(5),
            ..PredictorConfig::default()
        }
    }

    fn seeded_store(history: &[Contest]) -> Database {
        let db = Database::open(":memory:").unwrap();
        let rows = FeatureStoreBuilder::default().build(history).unwrap();
        db.upsert_features(&rows).unwrap();
        db
    }

    #[test]
    fn schema_has_indices_then_both_sides() {
        let schema = FeatureSchema::default();
        assert_eq!(schema.width(), 2 + 2 * FeatureVector::LEN);
        assert_eq!(schema.columns()[0], "home_idx");
        assert_eq!(schema.columns()[2], "home_win_rate_short");
        assert_eq!(schema.columns()[2 + FeatureVector::LEN], "away_win_rate_short");
    }

    #[test]
    fn fit_then_predict_end_to_end() {
        let history = league(&[("2023", 2023), ("2024", 2024)]);
        let store = seeded_store(&history);
        let model = AdaptivePredictor::new(test_config())
            .fit(&history, &store)
            .unwrap();

        let state = model.state();
        assert_eq!(state.min_games.value, 5);
        assert_eq!(state.min_games.source, ThresholdSource::Fixed);
        assert!((0.3..=1.0).contains(&state.temperature));
        assert!(model.capabilities().feature_store);
        assert_eq!(model.training_rows(), history.len());

        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let batch = model.predict(
            &[
                upcoming("u1", "Aces", "Foxes", day),
                upcoming("u2", "Foxes", "Aces", day),
                upcoming("u3", "Comets", "Expansion", day),
            ],
            &store,
        );
        assert_eq!(batch.predictions.len(), 2);
        assert_eq!(batch.exclusions.len(), 1);
        assert_eq!(batch.exclusions[0].contest_id, "u3");
        assert_eq!(batch.failed, 0);

        for p in &batch.predictions {
            assert!((p.home_win_prob + p.away_win_prob - 1.0).abs() < 1e-12);
            assert_eq!(p.confidence, p.home_win_prob.max(p.away_win_prob));
            assert!(p.explanation.as_deref().unwrap().contains("favoured"));
        }
        let aces_home = &batch.predictions[0];
        assert_eq!(aces_home.predicted_winner, "Aces");
        let aces_away = &batch.predictions[1];
        assert_eq!(aces_away.predicted_winner, "Aces");
    }

    #[test]
    fn same_seed_gives_same_state_and_probabilities() {
        let history = league(&[("2024", 2024)]);
        let store = seeded_store(&history);
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let games = [upcoming("u1", "Bolts", "Drakes", day)];

        let a = AdaptivePredictor::new(test_config()).fit(&history, &store).unwrap();
        let b = AdaptivePredictor::new(test_config()).fit(&history, &store).unwrap();
        assert_eq!(a.state(), b.state());
        let pa = a.predict(&games, &store);
        let pb = b.predict(&games, &store);
        assert_eq!(pa.predictions[0].home_win_prob, pb.predictions[0].home_win_prob);
    }

    #[test]
    fn disabled_stages_are_tagged() {
        let history = league(&[("2024", 2024)]);
        let store = seeded_store(&history);
        let config = PredictorConfig {
            calibrate: false,
            venue_logit_shift: VenueShiftMode::Disabled,
            confidence_temperature: TemperatureMode::Disabled,
            ..test_config()
        };
        let model = AdaptivePredictor::new(config).fit(&history, &store).unwrap();
        let state = model.state();
        assert_eq!(state.probability_calibration, None);
        assert_eq!(state.probability_source, StageSource::Disabled);
        assert_eq!(state.venue_shift_source, StageSource::Disabled);
        assert_eq!(state.temperature_source, StageSource::Disabled);
        assert_eq!(state.temperature, 1.0);
    }

    #[test]
    fn early_period_contest_is_dampened() {
        let history = league(&[("2023", 2023)]);
        let store = seeded_store(&history);
        let on = AdaptivePredictor::new(test_config()).fit(&history, &store).unwrap();
        let off = AdaptivePredictor::new(PredictorConfig {
            use_early_period_adjustment: false,
            ..test_config()
        })
        .fit(&history, &store)
        .unwrap();

        // First week of a period nobody has played in yet.
        let day = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let games = [upcoming("u1", "Aces", "Foxes", day)];
        let damped = on.predict(&games, &store).predictions[0].home_win_prob;
        let raw = off.predict(&games, &store).predictions[0].home_win_prob;
        approx::assert_relative_eq!(damped - 0.5, (raw - 0.5) * 0.80, epsilon = 1e-9);
    }

    #[test]
    fn empty_history_is_rejected() {
        let store = Database::open(":memory:").unwrap();
        let err = AdaptivePredictor::new(test_config())
            .fit(&[], &store)
            .err()
            .unwrap();
        assert!(matches!(err, PredictorError::EmptyTrainingSet));
    }

    #[test]
    fn incomplete_history_row_is_a_schema_error() {
        let mut history = league(&[("2024", 2024)]);
        history[3].away_score = None;
        let store = Database::open(":memory:").unwrap();
        let err = AdaptivePredictor::new(test_config())
            .fit(&history, &store)
            .err()
            .unwrap();
        assert!(matches!(err, PredictorError::Schema(_)));
    }

    /// Delegates to the real store but fails lookups for one entity.
    struct FailingFor<'a> {
        inner: &'a Database,
        entity: &'static str,
    }

    impl FeatureRepository for FailingFor<'_> {
        fn get_features(
            &self,
            entity_id: &str,
            period: &str,
        ) -> anyhow::Result<Option<crate::db::models::EntityPeriodFeatures>> {
            if entity_id == self.entity {
                anyhow::bail!("feature lookup failed for {entity_id}");
            }
            self.inner.get_features(entity_id, period)
        }

        fn features_for_period(
            &self,
            period: &str,
        ) -> anyhow::Result<Vec<crate::db::models::EntityPeriodFeatures>> {
            self.inner.features_for_period(period)
        }

        fn all_features(&self) -> anyhow::Result<Vec<crate::db::models::EntityPeriodFeatures>> {
            self.inner.all_features()
        }

        fn upsert_features(
            &self,
            rows: &[crate::db::models::EntityPeriodFeatures],
        ) -> anyhow::Result<usize> {
            self.inner.upsert_features(rows)
        }
    }

    #[test]
    fn failed_contest_is_counted_and_batch_continues() {
        let history = league(&[("2023", 2023), ("2024", 2024)]);
        let store = seeded_store(&history);
        let model = AdaptivePredictor::new(PredictorConfig {
            min_games_threshold: MinGamesMode::Fixed(1),
            ..test_config()
        })
        .fit(&history, &store)
        .unwrap();

        let flaky = FailingFor {
            inner: &store,
            entity: "Comets",
        };
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let games = [
            upcoming("u1", "Aces", "Foxes", day),
            upcoming("u2", "Comets", "Drakes", day),
            upcoming("u3", "Bolts", "Eagles", day),
        ];
        let batch = model.predict(&games, &flaky);

        assert_eq!(batch.failed, 1);
        assert!(batch.exclusions.is_empty());
        let ids: Vec<&str> = batch.predictions.iter().map(|p| p.contest_id.as_str()).collect();
        assert_eq!(ids, ["u1", "u3"]);
    }

    #[test]
    fn fitted_model_row_width_matches_forest() {
        let history = league(&[("2024", 2024)]);
        let store = seeded_store(&history);
        let model = AdaptivePredictor::new(test_config())
            .fit(&history, &store)
            .unwrap();
        assert_eq!(model.schema().width(), model.forest.n_features());
    }

    #[test]
    fn fitted_model_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FittedModel>();
    }
}
