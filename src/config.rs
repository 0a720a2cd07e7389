use anyhow::Context;
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::predictor::dampener::EarlyPeriodPolicy;
use crate::predictor::forest::ForestParams;
use crate::predictor::threshold::ThresholdPolicy;

/// Batch trainer and predictor for head-to-head contest outcomes
#[derive(Parser, Debug, Clone)]
#[command(name = "contest-predictor", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "contests.db")]
    pub database_path: String,

    /// JSON array of contests to upsert before training
    #[arg(long, env = "IMPORT_CONTESTS")]
    pub import_contests: Option<String>,

    /// JSON file with a full model configuration; replaces the model options below
    #[arg(long, env = "MODEL_CONFIG")]
    pub model_config: Option<String>,

    /// Number of trees in the forest
    #[arg(long, env = "BASE_ESTIMATOR_COUNT", default_value_t = 100)]
    pub base_estimator_count: usize,

    /// Maximum depth of each tree
    #[arg(long, env = "MAX_TREE_DEPTH", default_value_t = 8)]
    pub max_tree_depth: usize,

    /// Fewest rows a node needs before it may split
    #[arg(long, env = "MIN_SAMPLES_PER_SPLIT", default_value_t = 10)]
    pub min_samples_per_split: usize,

    /// Seed for bootstrap sampling and feature selection
    #[arg(long, env = "RANDOM_SEED", default_value_t = 42)]
    pub random_seed: u64,

    /// Minimum games per team before a contest is predicted: `auto` or an integer
    #[arg(long, env = "MIN_GAMES_THRESHOLD", default_value = "auto")]
    pub min_games_threshold: MinGamesMode,

    /// Refit raw forest probabilities on out-of-fold predictions
    #[arg(long, env = "CALIBRATE", default_value_t = true, action = ArgAction::Set)]
    pub calibrate: bool,

    /// `isotonic` or `sigmoid`
    #[arg(long, env = "CALIBRATION_METHOD", default_value = "isotonic")]
    pub calibration_method: CalibrationMethod,

    /// `auto`, `auto:neutral`, `auto:<target>`, `none` or a fixed logit shift
    #[arg(long, env = "VENUE_LOGIT_SHIFT", default_value = "auto")]
    pub venue_logit_shift: VenueShiftMode,

    /// `auto`, `none` or a fixed temperature
    #[arg(long, env = "CONFIDENCE_TEMPERATURE", default_value = "auto")]
    pub confidence_temperature: TemperatureMode,

    /// Spread unseen team names around the median index instead of one sentinel
    #[arg(long, env = "USE_SMART_ENCODING", default_value_t = true, action = ArgAction::Set)]
    pub use_smart_encoding: bool,

    /// Shrink confidence early in a period
    #[arg(long, env = "USE_EARLY_PERIOD_ADJUSTMENT", default_value_t = true, action = ArgAction::Set)]
    pub use_early_period_adjustment: bool,

    /// Number of interleaved folds for out-of-fold calibration data
    #[arg(long, env = "CALIBRATION_FOLDS", default_value_t = 3)]
    pub calibration_folds: usize,

    /// Games a stored feature row needs before the resolver trusts it
    #[arg(long, env = "FEATURE_MIN_GAMES", default_value_t = 5)]
    pub feature_min_games: u32,

    /// Days after a period starts during which confidence is dampened
    #[arg(long, env = "EARLY_PERIOD_DAYS", default_value_t = 30)]
    pub early_period_days: i64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_path.trim().is_empty() {
            anyhow::bail!("database_path must not be empty");
        }
        if let Some(path) = &self.import_contests {
            if !std::path::Path::new(path).is_file() {
                anyhow::bail!("contest import file '{}' does not exist", path);
            }
        }
        if let Some(path) = &self.model_config {
            if !std::path::Path::new(path).is_file() {
                anyhow::bail!("model config '{}' does not exist", path);
            }
            return Ok(());
        }
        self.cli_predictor_config().validate()
    }

    /// Model configuration from `--model-config` when given, otherwise from
    /// the command-line options.
    pub fn predictor_config(&self) -> anyhow::Result<PredictorConfig> {
        let config = match &self.model_config {
            Some(path) => PredictorConfig::load(path)?,
            None => self.cli_predictor_config(),
        };
        config.validate()?;
        Ok(config)
    }

    fn cli_predictor_config(&self) -> PredictorConfig {
        PredictorConfig {
            base_estimator_count: self.base_estimator_count,
            max_tree_depth: self.max_tree_depth,
            min_samples_per_split: self.min_samples_per_split,
            random_seed: self.random_seed,
            min_games_threshold: self.min_games_threshold,
            calibrate: self.calibrate,
            calibration_method: self.calibration_method,
            venue_logit_shift: self.venue_logit_shift,
            confidence_temperature: self.confidence_temperature,
            use_smart_encoding: self.use_smart_encoding,
            use_early_period_adjustment: self.use_early_period_adjustment,
            calibration_folds: self.calibration_folds,
            feature_min_games: self.feature_min_games,
            early_period: EarlyPeriodPolicy {
                window_days: self.early_period_days,
                ..EarlyPeriodPolicy::default()
            },
            ..PredictorConfig::default()
        }
    }
}

/// Every knob the predictor reads. Built once and handed to the fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PredictorConfig {
    pub base_estimator_count: usize,
    pub max_tree_depth: usize,
    pub min_samples_per_split: usize,
    pub random_seed: u64,
    pub min_games_threshold: MinGamesMode,
    pub calibrate: bool,
    pub calibration_method: CalibrationMethod,
    pub venue_logit_shift: VenueShiftMode,
    pub confidence_temperature: TemperatureMode,
    pub use_smart_encoding: bool,
    pub use_early_period_adjustment: bool,
    pub calibration_folds: usize,
    pub feature_min_games: u32,
    /// Clip range for the `auto` confidence temperature
    pub temperature_min: f64,
    pub temperature_max: f64,
    pub threshold: ThresholdPolicy,
    pub early_period: EarlyPeriodPolicy,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        PredictorConfig {
            base_estimator_count: 100,
            max_tree_depth: 8,
            min_samples_per_split: 10,
            random_seed: 42,
            min_games_threshold: MinGamesMode::Auto,
            calibrate: true,
            calibration_method: CalibrationMethod::Isotonic,
            venue_logit_shift: VenueShiftMode::Auto(ShiftTarget::HomeWinRate),
            confidence_temperature: TemperatureMode::Auto,
            use_smart_encoding: true,
            use_early_period_adjustment: true,
            calibration_folds: 3,
            feature_min_games: 5,
            temperature_min: 0.3,
            temperature_max: 1.0,
            threshold: ThresholdPolicy::default(),
            early_period: EarlyPeriodPolicy::default(),
        }
    }
}

impl PredictorConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading model config {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing model config {path}"))
    }

    pub fn forest_params(&self) -> ForestParams {
        ForestParams {
            n_estimators: self.base_estimator_count,
            max_depth: self.max_tree_depth,
            min_samples_split: self.min_samples_per_split,
            seed: self.random_seed,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_estimator_count == 0 {
            anyhow::bail!("base_estimator_count must be at least 1");
        }
        if self.max_tree_depth == 0 {
            anyhow::bail!("max_tree_depth must be at least 1");
        }
        if self.min_samples_per_split < 2 {
            anyhow::bail!("min_samples_per_split must be at least 2");
        }
        if self.calibration_folds < 2 {
            anyhow::bail!("calibration_folds must be at least 2");
        }
        if !(0.0 < self.temperature_min && self.temperature_min <= self.temperature_max) {
            anyhow::bail!("temperature range must satisfy 0 < temperature_min <= temperature_max");
        }
        let t = &self.threshold;
        if !(0.0..=100.0).contains(&t.current_period_percentile)
            || !(0.0..=100.0).contains(&t.global_percentile)
        {
            anyhow::bail!("threshold percentiles must be between 0 and 100");
        }
        if t.floor > t.ceiling {
            anyhow::bail!("threshold floor {} exceeds ceiling {}", t.floor, t.ceiling);
        }
        if self.early_period.window_days < 0 {
            anyhow::bail!("early_period.window_days must not be negative");
        }
        let factors_ok = self
            .early_period
            .tiers
            .iter()
            .map(|(_, f)| *f)
            .chain(std::iter::once(self.early_period.floor_factor))
            .all(|f| (0.0..=1.0).contains(&f));
        if !factors_ok {
            anyhow::bail!("early-period factors must be between 0.0 and 1.0");
        }
        Ok(())
    }
}

// ── Option value types ───────────────────────────────────────────────────────

/// `auto` or a fixed game count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MinGamesMode {
    Auto,
    Fixed(u32),
}

impl FromStr for MinGamesMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" => Ok(MinGamesMode::Auto),
            other => other
                .parse::<u32>()
                .map(MinGamesMode::Fixed)
                .map_err(|_| format!("expected 'auto' or a non-negative integer, got '{other}'")),
        }
    }
}

impl fmt::Display for MinGamesMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinGamesMode::Auto => f.write_str("auto"),
            MinGamesMode::Fixed(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CalibrationMethod {
    Isotonic,
    Sigmoid,
}

impl FromStr for CalibrationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "isotonic" => Ok(CalibrationMethod::Isotonic),
            "sigmoid" => Ok(CalibrationMethod::Sigmoid),
            other => Err(format!("expected 'isotonic' or 'sigmoid', got '{other}'")),
        }
    }
}

impl fmt::Display for CalibrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CalibrationMethod::Isotonic => "isotonic",
            CalibrationMethod::Sigmoid => "sigmoid",
        })
    }
}

/// Mean home-win probability the `auto` venue shift aims for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShiftTarget {
    /// Empirical home-win rate of the non-neutral training contests
    HomeWinRate,
    Neutral,
    Value(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VenueShiftMode {
    Auto(ShiftTarget),
    Fixed(f64),
    Disabled,
}

impl FromStr for VenueShiftMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "auto" => return Ok(VenueShiftMode::Auto(ShiftTarget::HomeWinRate)),
            "auto:neutral" => return Ok(VenueShiftMode::Auto(ShiftTarget::Neutral)),
            "none" => return Ok(VenueShiftMode::Disabled),
            _ => {}
        }
        if let Some(target) = s.strip_prefix("auto:") {
            let t: f64 = target
                .parse()
                .map_err(|_| format!("invalid venue shift target '{target}'"))?;
            if !(t > 0.0 && t < 1.0) {
                return Err(format!("venue shift target {t} must lie strictly between 0 and 1"));
            }
            return Ok(VenueShiftMode::Auto(ShiftTarget::Value(t)));
        }
        match s.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(VenueShiftMode::Fixed(v)),
            _ => Err(format!(
                "expected 'auto', 'auto:neutral', 'auto:<target>', 'none' or a number, got '{s}'"
            )),
        }
    }
}

impl fmt::Display for VenueShiftMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueShiftMode::Auto(ShiftTarget::HomeWinRate) => f.write_str("auto"),
            VenueShiftMode::Auto(ShiftTarget::Neutral) => f.write_str("auto:neutral"),
            VenueShiftMode::Auto(ShiftTarget::Value(t)) => write!(f, "auto:{t}"),
            VenueShiftMode::Fixed(v) => write!(f, "{v}"),
            VenueShiftMode::Disabled => f.write_str("none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TemperatureMode {
    Auto,
    Fixed(f64),
    Disabled,
}

impl FromStr for TemperatureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" => Ok(TemperatureMode::Auto),
            "none" => Ok(TemperatureMode::Disabled),
            other => match other.parse::<f64>() {
                Ok(t) if t.is_finite() && t > 0.0 => Ok(TemperatureMode::Fixed(t)),
                _ => Err(format!(
                    "expected 'auto', 'none' or a positive number, got '{other}'"
                )),
            },
        }
    }
}

impl fmt::Display for TemperatureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemperatureMode::Auto => f.write_str("auto"),
            TemperatureMode::Fixed(t) => write!(f, "{t}"),
            TemperatureMode::Disabled => f.write_str("none"),
        }
    }
}

macro_rules! string_conversions {
    ($($ty:ty),*) => {$(
        impl TryFrom<String> for $ty {
            type Error = String;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$ty> for String {
            fn from(v: $ty) -> String {
                v.to_string()
            }
        }
    )*};
}

string_conversions!(MinGamesMode, CalibrationMethod, VenueShiftMode, TemperatureMode);
