//! Kernel-density Bayes classifier used as an outlier scorer.
//!
//! Each class is modelled by a Gaussian kernel density over standardised
//! features. With known outliers in the training labels the classifier is
//! two-class (nominal against outlier), otherwise every nominal class gets
//! its own density. A sample scores the highest posterior probability over
//! the fitted classes, so samples the classifier is unsure about rank low.

use super::{NOMINAL_LABEL, OutlierScorer};
use crate::dataset::OUTLIER_LABEL;
use crate::error::MlError;
use crate::models::{Standardizer, check_training, check_width, encode_labels, softmax_in_place};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ClassDensity {
    label: i64,
    log_prior: f64,
    samples: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelDensityScorer {
    scaler: Option<Standardizer>,
    bandwidth: f64,
    densities: Vec<ClassDensity>,
    two_class: bool,
}

fn log_sum_exp(values: impl Iterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.collect();
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

impl KernelDensityScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the classes are nominal against known outliers.
    pub fn is_two_class(&self) -> bool {
        self.two_class
    }

    fn log_density(&self, class: &ClassDensity, z: &[f64]) -> f64 {
        let d = z.len() as f64;
        let h2 = self.bandwidth * self.bandwidth;
        let norm = -(class.samples.len() as f64).ln()
            - 0.5 * d * (2.0 * std::f64::consts::PI * h2).ln();
        norm + log_sum_exp(class.samples.iter().map(|s| {
            -s.iter().zip(z).map(|(a, b)| (a - b).powi(2)).sum::<f64>() / (2.0 * h2)
        }))
    }
}

impl OutlierScorer for KernelDensityScorer {
    fn fit(&mut self, x: &[Vec<f64>], y: Option<&[i64]>) -> Result<(), MlError> {
        let labels: Vec<i64> = match y {
            Some(y) => y.to_vec(),
            None => vec![NOMINAL_LABEL; x.len()],
        };
        let dims = check_training(x, &labels)?;
        let two_class = labels.contains(&OUTLIER_LABEL);
        let labels: Vec<i64> = if two_class {
            super::binarize(&labels)
        } else {
            labels
        };

        let scaler = Standardizer::fit(x);
        let z = scaler.apply_all(x);
        let (classes, encoded) = encode_labels(&labels);
        let n = z.len() as f64;
        let densities = classes
            .iter()
            .enumerate()
            .map(|(c, &label)| {
                let samples: Vec<Vec<f64>> = z
                    .iter()
                    .zip(&encoded)
                    .filter(|(_, e)| **e == c)
                    .map(|(row, _)| row.clone())
                    .collect();
                ClassDensity {
                    label,
                    log_prior: (samples.len() as f64 / n).ln(),
                    samples,
                }
            })
            .collect();

        *self = Self {
            scaler: Some(scaler),
            // Scott's rule on unit-variance features.
            bandwidth: n.powf(-1.0 / (dims as f64 + 4.0)),
            densities,
            two_class,
        };
        Ok(())
    }

    fn score_samples(&self, x: &[Vec<f64>]) -> Result<Vec<f64>, MlError> {
        let scaler = self
            .scaler
            .as_ref()
            .ok_or_else(|| MlError::not_fitted("kernel density outlier scorer"))?;
        check_width(x, scaler.mean.len())?;
        Ok(x.iter()
            .map(|row| {
                let z = scaler.apply(row);
                let mut joint: Vec<f64> = self
                    .densities
                    .iter()
                    .map(|c| c.log_prior + self.log_density(c, &z))
                    .collect();
                softmax_in_place(&mut joint);
                joint.into_iter().fold(0.0, f64::max)
            })
            .collect())
    }

    fn save(&self, dir: &Path) -> Result<(), MlError> {
        super::save_model(dir, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> (Vec<Vec<f64>>, Vec<i64>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..20 {
            x.push(vec![(i % 5) as f64 * 0.1, (i / 5) as f64 * 0.1]);
            y.push(i64::from(i % 2 == 0) + 3);
        }
        for i in 0..5 {
            x.push(vec![5.0 + i as f64 * 0.1, 5.0]);
            y.push(OUTLIER_LABEL);
        }
        (x, y)
    }

    /// Two separated nominal classes, ten samples each.
    fn separated() -> (Vec<Vec<f64>>, Vec<i64>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..10 {
            let jitter = (i % 5) as f64 * 0.05;
            x.push(vec![jitter, (i / 5) as f64 * 0.05]);
            y.push(0);
            x.push(vec![3.0 + jitter, (i / 5) as f64 * 0.05]);
            y.push(1);
        }
        (x, y)
    }

    #[test]
    fn test_two_class_scores_the_most_probable_class() {
        let (x, y) = data();
        let mut scorer = KernelDensityScorer::new();
        scorer.fit(&x, Some(&y)).unwrap();
        assert!(scorer.is_two_class());
        // Both points sit deep inside one class, nominal or outlier.
        let s = scorer.score_samples(&[vec![0.2, 0.2], vec![5.2, 5.0]]).unwrap();
        assert!(s[0] > 0.9, "{s:?}");
        assert!(s[1] > 0.9, "{s:?}");
    }

    #[test]
    fn test_ambiguous_samples_score_lower() {
        let (x, y) = separated();
        let mut scorer = KernelDensityScorer::new();
        scorer.fit(&x, Some(&y)).unwrap();
        assert!(!scorer.is_two_class());
        let s = scorer
            .score_samples(&[vec![0.1, 0.02], vec![1.6, 0.02]])
            .unwrap();
        assert!(s[0] > 0.9, "{s:?}");
        assert!(s[1] < s[0], "{s:?}");
        assert!(s.iter().all(|p| (0.5 - 1e-9..=1.0).contains(p)), "{s:?}");
    }

    #[test]
    fn test_scores_are_probabilities_without_known_outliers() {
        let (x, y) = data();
        let mut scorer = KernelDensityScorer::new();
        scorer.fit(&x[..20], Some(&y[..20])).unwrap();
        let s = scorer.score_samples(&[vec![0.2, 0.2], vec![5.0, 5.0]]).unwrap();
        assert!(s.iter().all(|p| (0.5 - 1e-9..=1.0).contains(p)), "{s:?}");
    }
}
