//! RBF-kernel support vector machine, one-vs-rest, trained with kernelised
//! Pegasos. Exposes no probability estimates.

use super::{
    Estimator, LinearParams, Standardizer, check_training, check_width, encode_labels,
    labels_from_scores,
};
use crate::error::MlError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSvm {
    classes: Vec<i64>,
    dims: usize,
    gamma: f64,
    scaler: Standardizer,
    support: Vec<Vec<f64>>,
    /// Per class, the dual coefficient of every support vector.
    coef: Vec<Vec<f64>>,
}

fn rbf(gamma: f64, a: &[f64], b: &[f64]) -> f64 {
    let d: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    (-gamma * d).exp()
}

impl KernelSvm {
    /// `max_iter` counts passes over the training set.
    pub fn fit(params: &LinearParams, x: &[Vec<f64>], y: &[i64]) -> Result<Self, MlError> {
        let dims = check_training(x, y)?;
        let (classes, encoded) = encode_labels(y);
        let k = classes.len();
        let scaler = Standardizer::fit(x);
        let z = scaler.apply_all(x);
        let n = z.len();
        let gamma = 1.0 / dims.max(1) as f64;
        let lambda = 1.0 / (params.c.max(1e-12) * n as f64);

        let gram: Vec<Vec<f64>> = z
            .par_iter()
            .map(|a| z.iter().map(|b| rbf(gamma, a, b)).collect())
            .collect();

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut order: Vec<usize> = (0..n).collect();
        let mut alpha = vec![vec![0.0f64; n]; k];
        // partial[c][m] = sum_j alpha[c][j] * y_c(j) * K(j, m)
        let mut partial = vec![vec![0.0f64; n]; k];
        let mut t = 0.0f64;
        for _ in 0..params.max_iter {
            order.shuffle(&mut rng);
            for &i in &order {
                t += 1.0;
                for c in 0..k {
                    let target = if encoded[i] == c { 1.0 } else { -1.0 };
                    if target * partial[c][i] / (lambda * t) < 1.0 {
                        alpha[c][i] += 1.0;
                        for (p, kv) in partial[c].iter_mut().zip(&gram[i]) {
                            *p += target * kv;
                        }
                    }
                }
            }
        }

        let support_rows: Vec<usize> = (0..n).filter(|&i| alpha.iter().any(|a| a[i] > 0.0)).collect();
        let scale = 1.0 / (lambda * t.max(1.0));
        let coef = (0..k)
            .map(|c| {
                support_rows
                    .iter()
                    .map(|&i| {
                        let target = if encoded[i] == c { 1.0 } else { -1.0 };
                        alpha[c][i] * target * scale
                    })
                    .collect()
            })
            .collect();
        tracing::debug!(support = support_rows.len(), samples = n, "Fitted kernel SVM");

        Ok(Self {
            classes,
            dims,
            gamma,
            scaler,
            support: support_rows.iter().map(|&i| z[i].clone()).collect(),
            coef,
        })
    }

    pub fn decision_function(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, MlError> {
        check_width(x, self.dims)?;
        Ok(x.iter()
            .map(|row| {
                let z = self.scaler.apply(row);
                let kernel: Vec<f64> = self.support.iter().map(|s| rbf(self.gamma, s, &z)).collect();
                self.coef
                    .iter()
                    .map(|c| c.iter().zip(&kernel).map(|(a, kv)| a * kv).sum())
                    .collect()
            })
            .collect())
    }
}

impl Estimator for KernelSvm {
    fn classes(&self) -> &[i64] {
        &self.classes
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        Ok(labels_from_scores(&self.classes, &self.decision_function(x)?))
    }
}
