//! Probability calibration pipeline.
//!
//! Applied in a fixed order to the forest's raw home-win probability:
//!
//! 1. **Probability calibration**: isotonic (pool adjacent violators) or
//!    sigmoid (Platt, `p = sigmoid(a * logit(p_raw) + b)`), fit on
//!    out-of-fold predictions.
//! 2. **Venue shift**: `p = sigmoid(logit(p) - s)`, with `s` solved by
//!    bisection so the mean home-win probability hits a target.
//! 3. **Confidence temperature**: `p = 0.5 + (p - 0.5) * tau`.
//!
//! Stages 2 and 3 never fail the fit: a stage that cannot be solved falls
//! back to a documented default and says so in its source tag.
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use super::threshold::ThresholdSelection;
use crate::config::{CalibrationMethod, ShiftTarget, TemperatureMode, VenueShiftMode};
use crate::error::CalibrationError;

const EPS: f64 = 1e-6;

/// Fewest labelled samples any calibration stage will fit on.
pub const MIN_CALIBRATION_SAMPLES: usize = 8;

const PLATT_MAX_ITERS: usize = 500;
const PLATT_LEARNING_RATE: f64 = 0.2;
const PLATT_L2: f64 = 1e-3;

/// Bisection searches the shift in `[-SHIFT_BOUND, SHIFT_BOUND]`.
pub const SHIFT_BOUND: f64 = 10.0;
pub const SHIFT_ITERATIONS: usize = 60;
/// Largest acceptable gap between the shifted mean and the target.
pub const SHIFT_TOLERANCE: f64 = 1e-3;

/// Temperature used when the auto fit is degenerate.
pub const FALLBACK_TEMPERATURE: f64 = 0.85;

// ── Math utilities ───────────────────────────────────────────────────────────

pub fn clamp_prob(p: f64) -> f64 {
    p.clamp(EPS, 1.0 - EPS)
}

pub fn logit(p: f64) -> f64 {
    let p = clamp_prob(p);
    (p / (1.0 - p)).ln()
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

fn logloss(p: f64, y: f64) -> f64 {
    let p = clamp_prob(p);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

fn check_samples(samples: &[(f64, f64)]) -> Result<(), CalibrationError> {
    if samples.len() < MIN_CALIBRATION_SAMPLES {
        return Err(CalibrationError::TooFewSamples {
            got: samples.len(),
            need: MIN_CALIBRATION_SAMPLES,
        });
    }
    let positives = samples.iter().filter(|(_, y)| *y > 0.5).count();
    if positives == 0 || positives == samples.len() {
        return Err(CalibrationError::SingleClass);
    }
    Ok(())
}

// ── Stage 1: probability calibration ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlattCalibration {
    pub a: f64,
    pub b: f64,
}

pub fn apply_platt(raw_prob: f64, model: PlattCalibration) -> f64 {
    let x = logit(raw_prob);
    sigmoid(model.a * x + model.b).clamp(0.0, 1.0)
}

/// Fit Platt scaling by gradient descent on log-loss with L2 on the slope.
pub fn fit_platt(
    samples: &[(f64, f64)],
    max_iters: usize,
    learning_rate: f64,
    l2: f64,
) -> Result<PlattCalibration, CalibrationError> {
    check_samples(samples)?;

    let n = samples.len() as f64;
    let mut a = 1.0f64;
    let mut b = 0.0f64;

    for i in 0..max_iters.max(1) {
        let lr = learning_rate / (1.0 + 0.01 * i as f64);
        let mut grad_a = 0.0;
        let mut grad_b = 0.0;
        for (raw_p, y) in samples {
            let x = logit(*raw_p);
            let p = sigmoid(a * x + b);
            let err = p - *y;
            grad_a += err * x;
            grad_b += err;
        }
        grad_a = grad_a / n + l2 * a;
        grad_b /= n;
        a -= lr * grad_a;
        b -= lr * grad_b;
        if !a.is_finite() || !b.is_finite() {
            return Err(CalibrationError::NonFinite);
        }
    }
    Ok(PlattCalibration { a, b })
}

/// Monotone step function fit by pool adjacent violators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsotonicCalibration {
    /// Lowest raw probability in each pooled block, ascending
    pub thresholds: Vec<f64>,
    /// Mean outcome of each block, non-decreasing
    pub values: Vec<f64>,
}

impl IsotonicCalibration {
    pub fn fit(samples: &[(f64, f64)]) -> Result<Self, CalibrationError> {
        check_samples(samples)?;
        let mut pairs = samples.to_vec();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        // (x_min, sum_y, count)
        let mut blocks: Vec<(f64, f64, usize)> = Vec::new();
        for (x, y) in pairs {
            match blocks.last_mut() {
                // Equal inputs must share one output.
                Some(last) if last.0 == x => {
                    last.1 += y;
                    last.2 += 1;
                }
                _ => blocks.push((x, y, 1)),
            }
            while blocks.len() >= 2 {
                let len = blocks.len();
                let (_, sum_last, n_last) = blocks[len - 1];
                let (x_prev, sum_prev, n_prev) = blocks[len - 2];
                if sum_last / n_last as f64 >= sum_prev / n_prev as f64 {
                    break;
                }
                blocks.truncate(len - 2);
                blocks.push((x_prev, sum_prev + sum_last, n_prev + n_last));
            }
        }

        Ok(IsotonicCalibration {
            thresholds: blocks.iter().map(|b| b.0).collect(),
            values: blocks.iter().map(|b| b.1 / b.2 as f64).collect(),
        })
    }

    /// Calibrated value, linearly interpolated between block starts.
    pub fn apply(&self, p: f64) -> f64 {
        if self.thresholds.is_empty() {
            return p;
        }
        let idx = self.thresholds.partition_point(|&t| t <= p);
        if idx == 0 {
            return self.values[0];
        }
        if idx >= self.values.len() {
            return self.values[self.values.len() - 1];
        }
        let (t0, t1) = (self.thresholds[idx - 1], self.thresholds[idx]);
        let (v0, v1) = (self.values[idx - 1], self.values[idx]);
        if t1 - t0 < 1e-12 {
            v0
        } else {
            v0 + (p - t0) / (t1 - t0) * (v1 - v0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ProbabilityCalibrator {
    Isotonic(IsotonicCalibration),
    Sigmoid(PlattCalibration),
}

impl ProbabilityCalibrator {
    pub fn fit(method: CalibrationMethod, samples: &[(f64, f64)]) -> Result<Self, CalibrationError> {
        let calibrator = match method {
            CalibrationMethod::Isotonic => {
                ProbabilityCalibrator::Isotonic(IsotonicCalibration::fit(samples)?)
            }
            CalibrationMethod::Sigmoid => ProbabilityCalibrator::Sigmoid(fit_platt(
                samples,
                PLATT_MAX_ITERS,
                PLATT_LEARNING_RATE,
                PLATT_L2,
            )?),
        };
        let metrics = FitMetrics::compare(samples, &calibrator);
        info!(
            "Probability calibration ({}) fit on {} samples: logloss {:.4}->{:.4}, brier {:.4}->{:.4}",
            method,
            samples.len(),
            metrics.logloss_before,
            metrics.logloss_after,
            metrics.brier_before,
            metrics.brier_after
        );
        Ok(calibrator)
    }

    pub fn apply(&self, raw_prob: f64) -> f64 {
        match self {
            ProbabilityCalibrator::Isotonic(m) => m.apply(raw_prob),
            ProbabilityCalibrator::Sigmoid(m) => apply_platt(raw_prob, *m),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FitMetrics {
    pub logloss_before: f64,
    pub logloss_after: f64,
    pub brier_before: f64,
    pub brier_after: f64,
}

impl FitMetrics {
    fn compare(samples: &[(f64, f64)], calibrator: &ProbabilityCalibrator) -> Self {
        let n = samples.len().max(1) as f64;
        let mut m = FitMetrics {
            logloss_before: 0.0,
            logloss_after: 0.0,
            brier_before: 0.0,
            brier_after: 0.0,
        };
        for (raw_p, y) in samples {
            let before = clamp_prob(*raw_p);
            let after = calibrator.apply(*raw_p);
            m.logloss_before += logloss(before, *y);
            m.logloss_after += logloss(after, *y);
            m.brier_before += (before - *y).powi(2);
            m.brier_after += (after - *y).powi(2);
        }
        m.logloss_before /= n;
        m.logloss_after /= n;
        m.brier_before /= n;
        m.brier_after /= n;
        m
    }
}

// ── Stage 2: venue shift ─────────────────────────────────────────────────────

pub fn apply_shift(p: f64, shift: f64) -> f64 {
    sigmoid(logit(p) - shift)
}

/// Solve for `s` with `mean(sigmoid(logit(p) - s)) == target` by bisection.
///
/// The shifted mean is strictly decreasing in `s`, so each step keeps the
/// half of the bracket that still contains the target.
pub fn solve_venue_shift(probs: &[f64], target: f64) -> Result<f64, CalibrationError> {
    if probs.is_empty() {
        return Err(CalibrationError::TooFewSamples { got: 0, need: 1 });
    }
    if !(target > 0.0 && target < 1.0) {
        return Err(CalibrationError::InvalidTarget(target));
    }
    let logits: Vec<f64> = probs.iter().map(|p| logit(*p)).collect();
    let mean_at = |s: f64| logits.iter().map(|l| sigmoid(l - s)).sum::<f64>() / logits.len() as f64;

    let (mut lo, mut hi) = (-SHIFT_BOUND, SHIFT_BOUND);
    for _ in 0..SHIFT_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        if mean_at(mid) > target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let shift = 0.5 * (lo + hi);
    let gap = (mean_at(shift) - target).abs();
    if !shift.is_finite() || !gap.is_finite() || gap >= SHIFT_TOLERANCE {
        return Err(CalibrationError::NotConverged { gap });
    }
    Ok(shift)
}

/// Log-odds of a base rate, used as the shift when bisection fails.
pub fn empirical_logit(base_rate: f64) -> f64 {
    if !base_rate.is_finite() {
        return 0.0;
    }
    logit(base_rate)
}

// ── Stage 3: confidence temperature ──────────────────────────────────────────

pub fn apply_temperature(p: f64, tau: f64) -> f64 {
    if tau == 1.0 {
        return p;
    }
    0.5 + (p - 0.5) * tau
}

/// Intercept-free least squares of `(y - 0.5)` on `(p - 0.5)`, clipped to
/// `[min, max]`.
pub fn fit_temperature(
    samples: &[(f64, f64)],
    min: f64,
    max: f64,
) -> Result<f64, CalibrationError> {
    if samples.is_empty() {
        return Err(CalibrationError::TooFewSamples { got: 0, need: 1 });
    }
    let (num, den) = samples.iter().fold((0.0, 0.0), |(num, den), (p, y)| {
        let dp = p - 0.5;
        (num + (y - 0.5) * dp, den + dp * dp)
    });
    if den < 1e-12 {
        return Err(CalibrationError::Degenerate(den));
    }
    let tau = num / den;
    if !tau.is_finite() {
        return Err(CalibrationError::NonFinite);
    }
    Ok(tau.clamp(min, max))
}

// ── Frozen state ─────────────────────────────────────────────────────────────

/// How a calibration parameter was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageSource {
    Fixed,
    Auto,
    Disabled,
    Fallback,
}

impl fmt::Display for StageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageSource::Fixed => "fixed",
            StageSource::Auto => "auto",
            StageSource::Disabled => "disabled",
            StageSource::Fallback => "fallback",
        })
    }
}

/// One labelled, stage-1-calibrated training probability.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationSample {
    pub prob: f64,
    pub label: f64,
    pub neutral_site: bool,
}

/// Everything inference needs from the calibration fit. Built once per fit
/// and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationState {
    pub probability_calibration: Option<CalibrationMethod>,
    pub probability_source: StageSource,
    pub venue_shift: f64,
    pub venue_shift_source: StageSource,
    /// Mean home-win probability the shift was solved for
    pub venue_target: Option<f64>,
    pub temperature: f64,
    pub temperature_source: StageSource,
    pub min_games: ThresholdSelection,
}

impl CalibrationState {
    /// Stages 2 and 3 on an already stage-1-calibrated probability.
    pub fn apply(&self, p: f64, neutral_site: bool) -> f64 {
        let shifted = if neutral_site || self.venue_shift_source == StageSource::Disabled {
            p
        } else {
            apply_shift(p, self.venue_shift)
        };
        apply_temperature(shifted, self.temperature).clamp(0.0, 1.0)
    }
}

/// Fit the venue shift. Only non-neutral contests inform it.
pub fn fit_venue_shift(
    samples: &[CalibrationSample],
    mode: VenueShiftMode,
) -> (f64, StageSource, Option<f64>) {
    let target_for = |t: ShiftTarget, base_rate: f64| match t {
        ShiftTarget::HomeWinRate => base_rate,
        ShiftTarget::Neutral => 0.5,
        ShiftTarget::Value(v) => v,
    };
    match mode {
        VenueShiftMode::Disabled => (0.0, StageSource::Disabled, None),
        VenueShiftMode::Fixed(s) => (s, StageSource::Fixed, None),
        VenueShiftMode::Auto(t) => {
            let home: Vec<&CalibrationSample> =
                samples.iter().filter(|s| !s.neutral_site).collect();
            let base_rate = if home.is_empty() {
                0.5
            } else {
                home.iter().map(|s| s.label).sum::<f64>() / home.len() as f64
            };
            let target = target_for(t, base_rate);
            let probs: Vec<f64> = home.iter().map(|s| s.prob).collect();
            match solve_venue_shift(&probs, target) {
                Ok(shift) => {
                    info!("Venue shift solved: s={:.4} (target {:.4})", shift, target);
                    (shift, StageSource::Auto, Some(target))
                }
                Err(e) => {
                    let shift = empirical_logit(base_rate);
                    warn!(
                        "Venue shift fit failed ({}); falling back to empirical logit {:.4} of base rate {:.4}",
                        e, shift, base_rate
                    );
                    (shift, StageSource::Fallback, Some(target))
                }
            }
        }
    }
}

/// Fit the confidence temperature on probabilities that already carry the shift.
pub fn fit_confidence_temperature(
    shifted: &[(f64, f64)],
    mode: TemperatureMode,
    min: f64,
    max: f64,
) -> (f64, StageSource) {
    match mode {
        TemperatureMode::Disabled => (1.0, StageSource::Disabled),
        TemperatureMode::Fixed(t) => (t, StageSource::Fixed),
        TemperatureMode::Auto => match fit_temperature(shifted, min, max) {
            Ok(tau) => {
                info!("Confidence temperature fitted: tau={:.4}", tau);
                (tau, StageSource::Auto)
            }
            Err(e) => {
                warn!(
                    "Temperature fit failed ({}); using default {:.2}",
                    e, FALLBACK_TEMPERATURE
                );
                (FALLBACK_TEMPERATURE, StageSource::Fallback)
            }
        },
    }
}

/// Stage 1 (optional) plus the frozen state for stages 2 and 3.
#[derive(Debug, Clone)]
pub struct CalibrationPipeline {
    pub calibrator: Option<ProbabilityCalibrator>,
    pub state: CalibrationState,
}

impl CalibrationPipeline {
    pub fn apply(&self, raw_prob: f64, neutral_site: bool) -> f64 {
        let p = match &self.calibrator {
            Some(c) => c.apply(raw_prob),
            None => raw_prob,
        };
        self.state.apply(p, neutral_site)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
