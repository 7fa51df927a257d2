//! Tree ensembles averaged over bootstrap replicas.

use super::tree::{GrowParams, Node, grow_classifier};
use super::{
    Estimator, ForestParams, ProbabilityEstimator, check_training, check_width, encode_labels,
    labels_from_scores,
};
use crate::error::MlError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Sampling and split strategy of a forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForestKind {
    /// Bootstrap rows, sqrt(d) features per split.
    Random,
    /// All rows, sqrt(d) features, random thresholds.
    Extra,
    /// Per-class undersampled bootstrap, sqrt(d) features per split.
    BalancedRandom,
    /// Per-class undersampled bootstrap, all features per split.
    BalancedBagging,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forest {
    kind: ForestKind,
    classes: Vec<i64>,
    dims: usize,
    trees: Vec<Node>,
}

impl Forest {
    pub fn fit(kind: ForestKind, params: &ForestParams, x: &[Vec<f64>], y: &[i64]) -> Result<Self, MlError> {
        let dims = check_training(x, y)?;
        let (classes, encoded) = encode_labels(y);
        let n_classes = classes.len();
        let weights = vec![1.0; y.len()];
        let sqrt_features = ((dims as f64).sqrt().round() as usize).max(1);
        let grow_params = GrowParams {
            max_depth: params.max_depth,
            min_samples_split: 2,
            max_features: match kind {
                ForestKind::BalancedBagging => None,
                _ => Some(sqrt_features),
            },
            random_thresholds: kind == ForestKind::Extra,
        };

        let trees = (0..params.n_estimators)
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(t as u64));
                let mut rows = match kind {
                    ForestKind::Random => bootstrap(y.len(), &mut rng),
                    ForestKind::Extra => (0..y.len()).collect(),
                    ForestKind::BalancedRandom | ForestKind::BalancedBagging => {
                        balanced_bootstrap(&encoded, n_classes, &mut rng)
                    }
                };
                grow_classifier(x, &encoded, &weights, n_classes, &mut rows, &grow_params, &mut rng)
            })
            .collect();

        Ok(Self {
            kind,
            classes,
            dims,
            trees,
        })
    }

    pub fn kind(&self) -> ForestKind {
        self.kind
    }
}

fn bootstrap(n: usize, rng: &mut StdRng) -> Vec<usize> {
    (0..n).map(|_| rng.gen_range(0..n)).collect()
}

/// Draw, with replacement, as many rows of every class as the rarest has.
pub(crate) fn balanced_bootstrap(encoded: &[usize], n_classes: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); n_classes];
    for (i, &c) in encoded.iter().enumerate() {
        by_class[c].push(i);
    }
    let minority = by_class.iter().map(Vec::len).filter(|n| *n > 0).min().unwrap_or(0);
    let mut rows = Vec::with_capacity(minority * n_classes);
    for members in by_class.iter().filter(|m| !m.is_empty()) {
        for _ in 0..minority {
            if let Some(&i) = members.choose(rng) {
                rows.push(i);
            }
        }
    }
    rows
}

impl Estimator for Forest {
    fn classes(&self) -> &[i64] {
        &self.classes
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        Ok(labels_from_scores(&self.classes, &self.predict_proba(x)?))
    }
}

impl ProbabilityEstimator for Forest {
    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, MlError> {
        check_width(x, self.dims)?;
        let n_trees = self.trees.len().max(1) as f64;
        Ok(x.iter()
            .map(|row| {
                let mut p = vec![0.0; self.classes.len()];
                for tree in &self.trees {
                    for (acc, v) in p.iter_mut().zip(tree.leaf(row)) {
                        *acc += v / n_trees;
                    }
                }
                p
            })
            .collect())
    }
}
