//! Minimum-games gate derived from how much each team has actually played.
//!
//! In `auto` mode the threshold is a low percentile of the games-played
//! distribution in the most recent period, so it tracks the season's
//! progress instead of a hand-picked constant.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::config::MinGamesMode;
use crate::db::models::Contest;
use crate::features::PeriodCalendar;

/// Which branch produced the resolved threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    Fixed,
    AutoCurrentPeriod,
    AutoGlobal,
    AutoFloor,
}

impl ThresholdSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdSource::Fixed => "fixed",
            ThresholdSource::AutoCurrentPeriod => "auto_current_period",
            ThresholdSource::AutoGlobal => "auto_global",
            ThresholdSource::AutoFloor => "auto_floor",
        }
    }
}

impl fmt::Display for ThresholdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThresholdSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(ThresholdSource::Fixed),
            "auto_current_period" => Ok(ThresholdSource::AutoCurrentPeriod),
            "auto_global" => Ok(ThresholdSource::AutoGlobal),
            "auto_floor" => Ok(ThresholdSource::AutoFloor),
            other => Err(format!("unknown threshold source '{other}'")),
        }
    }
}

/// Percentiles and clip bounds for `auto` mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThresholdPolicy {
    pub current_period_percentile: f64,
    pub global_percentile: f64,
    pub floor: u32,
    pub ceiling: u32,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        ThresholdPolicy {
            current_period_percentile: 40.0,
            global_percentile: 30.0,
            floor: 10,
            ceiling: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSelection {
    pub value: u32,
    pub source: ThresholdSource,
}

/// Resolve the minimum-games threshold for this training history.
pub fn select_threshold(
    history: &[Contest],
    mode: MinGamesMode,
    policy: &ThresholdPolicy,
) -> ThresholdSelection {
    let selection = match mode {
        MinGamesMode::Fixed(value) => ThresholdSelection {
            value,
            source: ThresholdSource::Fixed,
        },
        MinGamesMode::Auto => auto_threshold(history, policy),
    };
    info!(
        "Minimum-games threshold: {} (source: {})",
        selection.value, selection.source
    );
    selection
}

fn auto_threshold(history: &[Contest], policy: &ThresholdPolicy) -> ThresholdSelection {
    let calendar = PeriodCalendar::from_contests(history);
    threshold_from_counts(&games_per_team_period(history), calendar.latest(), policy)
}

fn threshold_from_counts(
    per_team: &HashMap<(&str, &str), u32>,
    latest: Option<&str>,
    policy: &ThresholdPolicy,
) -> ThresholdSelection {
    let clip = |v: f64| (v.round() as i64).clamp(policy.floor as i64, policy.ceiling as i64) as u32;

    if let Some(latest) = latest {
        let recent: Vec<f64> = per_team
            .iter()
            .filter(|((period, _), _)| *period == latest)
            .map(|(_, n)| *n as f64)
            .collect();
        if let Some(p) = percentile(&recent, policy.current_period_percentile) {
            return ThresholdSelection {
                value: clip(p),
                source: ThresholdSource::AutoCurrentPeriod,
            };
        }
    }

    let all: Vec<f64> = per_team.values().map(|n| *n as f64).collect();
    match percentile(&all, policy.global_percentile) {
        Some(p) => ThresholdSelection {
            value: clip(p),
            source: ThresholdSource::AutoGlobal,
        },
        None => ThresholdSelection {
            value: policy.floor,
            source: ThresholdSource::AutoFloor,
        },
    }
}

/// Games played per (period, team).
fn games_per_team_period(history: &[Contest]) -> HashMap<(&str, &str), u32> {
    let mut counts: HashMap<(&str, &str), u32> = HashMap::new();
    for c in history {
        for team in [&c.home_team, &c.away_team] {
            *counts.entry((c.period.as_str(), team.as_str())).or_insert(0) += 1;
        }
    }
    counts
}

/// Linearly interpolated percentile (`q` in 0..=100). `None` for empty input.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}
