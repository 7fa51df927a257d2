//! Gaussian naive Bayes.

use super::{
    Estimator, ProbabilityEstimator, check_training, check_width, encode_labels,
    labels_from_scores, softmax_in_place,
};
use crate::error::MlError;
use serde::{Deserialize, Serialize};

/// Variance floor as a fraction of the largest feature variance.
const VAR_SMOOTHING: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianNb {
    classes: Vec<i64>,
    log_prior: Vec<f64>,
    mean: Vec<Vec<f64>>,
    var: Vec<Vec<f64>>,
}

impl GaussianNb {
    pub fn fit(x: &[Vec<f64>], y: &[i64]) -> Result<Self, MlError> {
        let dims = check_training(x, y)?;
        let (classes, encoded) = encode_labels(y);
        let k = classes.len();

        let mut counts = vec![0.0; k];
        let mut mean = vec![vec![0.0; dims]; k];
        for (row, &c) in x.iter().zip(&encoded) {
            counts[c] += 1.0;
            for (m, v) in mean[c].iter_mut().zip(row) {
                *m += v;
            }
        }
        for c in 0..k {
            mean[c].iter_mut().for_each(|m| *m /= counts[c]);
        }
        let mut var = vec![vec![0.0; dims]; k];
        for (row, &c) in x.iter().zip(&encoded) {
            for ((s, v), m) in var[c].iter_mut().zip(row).zip(&mean[c]) {
                *s += (v - m).powi(2);
            }
        }

        let overall = super::Standardizer::fit(x);
        let max_var = overall.std.iter().map(|s| s * s).fold(0.0, f64::max);
        let epsilon = (VAR_SMOOTHING * max_var).max(1e-12);
        for c in 0..k {
            var[c].iter_mut().for_each(|s| *s = *s / counts[c] + epsilon);
        }

        let n = y.len() as f64;
        Ok(Self {
            classes,
            log_prior: counts.iter().map(|c| (c / n).ln()).collect(),
            mean,
            var,
        })
    }

    fn joint_log_likelihood(&self, row: &[f64]) -> Vec<f64> {
        (0..self.classes.len())
            .map(|c| {
                let ll: f64 = row
                    .iter()
                    .zip(&self.mean[c])
                    .zip(&self.var[c])
                    .map(|((v, m), s)| {
                        -0.5 * (2.0 * std::f64::consts::PI * s).ln() - (v - m).powi(2) / (2.0 * s)
                    })
                    .sum();
                self.log_prior[c] + ll
            })
            .collect()
    }
}

impl Estimator for GaussianNb {
    fn classes(&self) -> &[i64] {
        &self.classes
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        Ok(labels_from_scores(&self.classes, &self.predict_proba(x)?))
    }
}

impl ProbabilityEstimator for GaussianNb {
    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, MlError> {
        check_width(x, self.mean.first().map(Vec::len).unwrap_or(0))?;
        Ok(x.iter()
            .map(|row| {
                let mut p = self.joint_log_likelihood(row);
                softmax_in_place(&mut p);
                p
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_statistics() {
        let x = vec![vec![0.0], vec![2.0], vec![10.0], vec![12.0]];
        let y = vec![0, 0, 1, 1];
        let nb = GaussianNb::fit(&x, &y).unwrap();
        assert_eq!(nb.mean, vec![vec![1.0], vec![11.0]]);
        assert!((nb.var[0][0] - 1.0).abs() < 1e-6);
        let p = nb.predict_proba(&[vec![1.0], vec![6.0]]).unwrap();
        assert!(p[0][0] > 0.99);
        assert!((p[1][0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_constant_feature_does_not_divide_by_zero() {
        let x = vec![vec![1.0, 0.0], vec![1.0, 1.0]];
        let nb = GaussianNb::fit(&x, &[0, 1]).unwrap();
        let p = nb.predict_proba(&x).unwrap();
        assert!(p.iter().flatten().all(|v| v.is_finite()));
    }
}
