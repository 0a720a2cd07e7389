//! Random forest of CART trees for the binary home-win outcome.
//!
//! Trees are grown in parallel, each from its own seed derived from the
//! forest seed, and collected in order, so a fixed seed always yields the
//! same forest regardless of thread count.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PredictorError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        ForestParams {
            n_estimators: 100,
            max_depth: 8,
            min_samples_split: 10,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        prob: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    fn predict(&self, row: &[f64]) -> f64 {
        let mut i = 0;
        loop {
            match &self.nodes[i] {
                Node::Leaf { prob } => return *prob,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    i = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

/// Best split found at one node.
struct SplitCandidate {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

struct TreeBuilder<'a> {
    x: &'a [Vec<f64>],
    y: &'a [f64],
    params: &'a ForestParams,
    max_features: usize,
    nodes: Vec<Node>,
}

impl<'a> TreeBuilder<'a> {
    fn grow(mut self, rows: Vec<usize>, rng: &mut StdRng) -> DecisionTree {
        self.build_node(rows, 0, rng);
        DecisionTree { nodes: self.nodes }
    }

    fn build_node(&mut self, rows: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        let positives: f64 = rows.iter().map(|&r| self.y[r]).sum();
        let n = rows.len() as f64;
        let prob = positives / n;
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { prob });

        let pure = positives == 0.0 || positives == n;
        if pure || depth >= self.params.max_depth || rows.len() < self.params.min_samples_split {
            return id;
        }

        let Some(split) = self.best_split(&rows, rng) else {
            return id;
        };
        if split.impurity >= n * gini(positives, n) - 1e-12 {
            return id;
        }

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&r| self.x[r][split.feature] <= split.threshold);
        let left = self.build_node(left_rows, depth + 1, rng);
        let right = self.build_node(right_rows, depth + 1, rng);
        self.nodes[id] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        id
    }

    fn best_split(&self, rows: &[usize], rng: &mut StdRng) -> Option<SplitCandidate> {
        let n_features = self.x[rows[0]].len();
        let total_pos: f64 = rows.iter().map(|&r| self.y[r]).sum();
        let total = rows.len() as f64;
        let mut best: Option<SplitCandidate> = None;

        for feature in sample(rng, n_features, self.max_features.min(n_features)).into_iter() {
            let mut sorted: Vec<(f64, f64)> = rows
                .iter()
                .map(|&r| (self.x[r][feature], self.y[r]))
                .collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_pos = 0.0;
            for i in 0..sorted.len() - 1 {
                left_pos += sorted[i].1;
                if sorted[i].0 == sorted[i + 1].0 {
                    continue;
                }
                let left_n = (i + 1) as f64;
                let right_n = total - left_n;
                let impurity = left_n * gini(left_pos, left_n)
                    + right_n * gini(total_pos - left_pos, right_n);
                if best.as_ref().map_or(true, |b| impurity < b.impurity) {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: (sorted[i].0 + sorted[i + 1].0) / 2.0,
                        impurity,
                    });
                }
            }
        }
        best
    }
}

/// Gini impurity of a binary node with `pos` positives out of `n`.
fn gini(pos: f64, n: f64) -> f64 {
    if n <= 0.0 {
        return 0.0;
    }
    let p = pos / n;
    2.0 * p * (1.0 - p)
}

#[derive(Debug, Clone)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
    n_features: usize,
}

impl RandomForest {
    /// Fit on rows `x` with 0/1 labels `y`.
    pub fn fit(x: &[Vec<f64>], y: &[f64], params: &ForestParams) -> Result<Self, PredictorError> {
        if x.is_empty() || x.len() != y.len() {
            return Err(PredictorError::EmptyTrainingSet);
        }
        let n = x.len();
        let n_features = x[0].len();
        let max_features = ((n_features as f64).sqrt().round() as usize).max(1);

        let trees: Vec<DecisionTree> = (0..params.n_estimators.max(1))
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(tree_seed(params.seed, t));
                let rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                TreeBuilder {
                    x,
                    y,
                    params,
                    max_features,
                    nodes: Vec::new(),
                }
                .grow(rows, &mut rng)
            })
            .collect();

        info!(
            "Random forest fitted: {} trees on {} rows x {} features",
            trees.len(),
            n,
            n_features
        );
        Ok(RandomForest { trees, n_features })
    }

    /// Mean leaf probability of a home win across trees.
    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        debug_assert_eq!(row.len(), self.n_features, "feature count mismatch");
        let sum: f64 = self.trees.iter().map(|t| t.predict(row)).sum();
        sum / self.trees.len() as f64
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }
}

fn tree_seed(seed: u64, tree: usize) -> u64 {
    seed ^ (tree as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
