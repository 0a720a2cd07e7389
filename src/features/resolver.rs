use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use super::FeatureVector;
use crate::db::models::EntityPeriodFeatures;
use crate::db::FeatureRepository;

/// Teams need this many games in a period to count toward its league average.
pub const LEAGUE_AVERAGE_MIN_GAMES: u32 = 5;

/// Which data source satisfied a feature lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureTier {
    Current,
    Prior,
    LeagueAverage,
    EmptyStore,
}

impl FeatureTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureTier::Current => "current",
            FeatureTier::Prior => "prior",
            FeatureTier::LeagueAverage => "league_average",
            FeatureTier::EmptyStore => "empty_store",
        }
    }
}

impl fmt::Display for FeatureTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete feature vector plus where it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedFeatures {
    /// Never contains NaN.
    pub vector: FeatureVector,
    pub tier: FeatureTier,
    /// Games the team has played in the requested (current) period.
    pub games_played: u32,
}

/// Three-tier feature lookup over a [`FeatureRepository`].
///
/// League averages are cached per period for the lifetime of the resolver,
/// so create one resolver per batch.
pub struct FeatureResolver<'a> {
    store: &'a dyn FeatureRepository,
    min_games: u32,
    league_cache: RefCell<HashMap<String, Option<FeatureVector>>>,
}

impl<'a> FeatureResolver<'a> {
    pub fn new(store: &'a dyn FeatureRepository, min_games: u32) -> Self {
        FeatureResolver {
            store,
            min_games,
            league_cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn resolve(
        &self,
        entity: &str,
        current_period: &str,
        prior_period: Option<&str>,
    ) -> Result<ResolvedFeatures> {
        let current = self.store.get_features(entity, current_period)?;
        let games_played = current.as_ref().map_or(0, |r| r.games_played);

        let (row, tier) = match current.filter(|r| r.games_played >= self.min_games) {
            Some(row) => (Some(row), FeatureTier::Current),
            None => match prior_period {
                Some(prior) => match self
                    .store
                    .get_features(entity, prior)?
                    .filter(|r| r.games_played >= self.min_games)
                {
                    Some(row) => (Some(row), FeatureTier::Prior),
                    None => (None, FeatureTier::LeagueAverage),
                },
                None => (None, FeatureTier::LeagueAverage),
            },
        };

        let resolved = match row {
            Some(row) => {
                let vector = row.vector();
                let vector = if vector.has_missing() {
                    let avg = self
                        .league_average(current_period)?
                        .unwrap_or(FeatureVector::NEUTRAL);
                    vector.fill_missing(&avg)
                } else {
                    vector
                };
                ResolvedFeatures {
                    vector,
                    tier,
                    games_played,
                }
            }
            None => match self.league_average(current_period)? {
                Some(avg) => ResolvedFeatures {
                    vector: avg,
                    tier: FeatureTier::LeagueAverage,
                    games_played,
                },
                None => ResolvedFeatures {
                    vector: FeatureVector::NEUTRAL,
                    tier: FeatureTier::EmptyStore,
                    games_played,
                },
            },
        };
        debug!(
            "Resolved features for {} in {}: tier={}",
            entity, current_period, resolved.tier
        );
        Ok(resolved)
    }

    /// Mean of each aggregate over qualifying teams in `period`, widening to
    /// every period when `period` has none. `None` only for an empty store.
    fn league_average(&self, period: &str) -> Result<Option<FeatureVector>> {
        if let Some(cached) = self.league_cache.borrow().get(period) {
            return Ok(*cached);
        }
        let in_period = self.store.features_for_period(period)?;
        let avg = match average_of_qualifying(&in_period) {
            Some(v) => Some(v),
            None => {
                let all = self.store.all_features()?;
                if all.is_empty() {
                    None
                } else {
                    Some(average_of_qualifying(&all).unwrap_or(FeatureVector::NEUTRAL))
                }
            }
        };
        self.league_cache
            .borrow_mut()
            .insert(period.to_string(), avg);
        Ok(avg)
    }
}

fn average_of_qualifying(rows: &[EntityPeriodFeatures]) -> Option<FeatureVector> {
    let qualifying: Vec<[f64; FeatureVector::LEN]> = rows
        .iter()
        .filter(|r| r.games_played >= LEAGUE_AVERAGE_MIN_GAMES)
        .map(|r| r.vector().values())
        .collect();
    if qualifying.is_empty() {
        return None;
    }
    let neutral = FeatureVector::NEUTRAL.values();
    let mut out = [0.0; FeatureVector::LEN];
    for (i, slot) in out.iter_mut().enumerate() {
        let finite: Vec<f64> = qualifying
            .iter()
            .map(|v| v[i])
            .filter(|v| v.is_finite())
            .collect();
        *slot = if finite.is_empty() {
            neutral[i]
        } else {
            finite.iter().sum::<f64>() / finite.len() as f64
        };
    }
    Some(FeatureVector::from_values(out))
}
