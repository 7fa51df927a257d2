//! Isolation forest: unsupervised ensemble outlier scoring.

use super::{OutlierScorer, nominal_rows};
use crate::error::MlError;
use crate::models::check_width;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

const MAX_SAMPLES: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum IsolationNode {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
}

/// Expected path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        n => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + 0.577_215_664_901_532_9) - 2.0 * (n - 1.0) / n
        }
    }
}

fn build(x: &[Vec<f64>], rows: &[usize], depth: usize, limit: usize, rng: &mut StdRng) -> IsolationNode {
    if depth >= limit || rows.len() <= 1 {
        return IsolationNode::Leaf { size: rows.len() };
    }
    let dims = x[rows[0]].len();
    let splittable: Vec<(usize, f64, f64)> = (0..dims)
        .filter_map(|f| {
            let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                (lo.min(x[i][f]), hi.max(x[i][f]))
            });
            (hi > lo).then_some((f, lo, hi))
        })
        .collect();
    if splittable.is_empty() {
        return IsolationNode::Leaf { size: rows.len() };
    }
    let (feature, lo, hi) = splittable[rng.gen_range(0..splittable.len())];
    let threshold = rng.gen_range(lo..hi);
    let (left, right): (Vec<usize>, Vec<usize>) = rows.iter().partition(|&&i| x[i][feature] < threshold);
    IsolationNode::Split {
        feature,
        threshold,
        left: Box::new(build(x, &left, depth + 1, limit, rng)),
        right: Box::new(build(x, &right, depth + 1, limit, rng)),
    }
}

fn path_length(node: &IsolationNode, row: &[f64], depth: usize) -> f64 {
    match node {
        IsolationNode::Leaf { size } => depth as f64 + average_path_length(*size),
        IsolationNode::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            let next = if row[*feature] < *threshold { left } else { right };
            path_length(next, row, depth + 1)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    n_estimators: usize,
    seed: u64,
    dims: usize,
    sample_size: usize,
    trees: Vec<IsolationNode>,
}

impl IsolationForest {
    pub fn new(n_estimators: usize, seed: u64) -> Self {
        Self {
            n_estimators: n_estimators.max(1),
            seed,
            dims: 0,
            sample_size: 0,
            trees: Vec::new(),
        }
    }
}

impl OutlierScorer for IsolationForest {
    /// Fits on the nominal rows; known outliers are ignored.
    fn fit(&mut self, x: &[Vec<f64>], y: Option<&[i64]>) -> Result<(), MlError> {
        let nominal = nominal_rows(x, y)?;
        let dims = nominal[0].len();
        check_width(&nominal, dims)?;
        let sample_size = nominal.len().min(MAX_SAMPLES);
        let limit = (sample_size as f64).log2().ceil().max(1.0) as usize;
        let seed = self.seed;
        self.trees = (0..self.n_estimators)
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
                let rows = sample(&mut rng, nominal.len(), sample_size).into_vec();
                build(&nominal, &rows, 0, limit, &mut rng)
            })
            .collect();
        self.dims = dims;
        self.sample_size = sample_size;
        Ok(())
    }

    /// Negated anomaly score `2^(-E[h(x)] / c(n))`: higher is more nominal.
    fn score_samples(&self, x: &[Vec<f64>]) -> Result<Vec<f64>, MlError> {
        if self.trees.is_empty() {
            return Err(MlError::not_fitted("isolation forest"));
        }
        check_width(x, self.dims)?;
        let c = average_path_length(self.sample_size).max(f64::MIN_POSITIVE);
        Ok(x.iter()
            .map(|row| {
                let mean = self.trees.iter().map(|t| path_length(t, row, 0)).sum::<f64>()
                    / self.trees.len() as f64;
                -(2f64).powf(-mean / c)
            })
            .collect())
    }

    fn save(&self, dir: &Path) -> Result<(), MlError> {
        super::save_model(dir, self)
    }
}
