//! Distance-to-mean outlier scoring in standardised feature space.

use super::{NOMINAL_LABEL, OutlierScorer, nominal_rows};
use crate::dataset::OUTLIER_LABEL;
use crate::error::MlError;
use crate::models::check_width;
use crate::persistence::{atomic_write_json, require_json};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const PARAMETERS_FILE: &str = "outlier_parameters.json";
pub const MEAN_FILE: &str = "outlier_param_x_mean.json";
pub const STD_FILE: &str = "outlier_param_x_std.json";

/// Floor for per-feature standard deviations.
pub const STD_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct DistanceParameters {
    #[serde(rename = "max_dist")]
    max_distance: i64,
    #[serde(rename = "min_dist")]
    min_distance: i64,
}

/// Scores samples by their negative Euclidean distance to the nominal mean.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistanceScorer {
    mean: Vec<f64>,
    std: Vec<f64>,
    /// Largest training distance; the frozen threshold of [`Self::predict`].
    max_distance: f64,
    min_distance: f64,
}

impl DistanceScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from known statistics.
    pub fn from_parameters(mean: Vec<f64>, std: Vec<f64>) -> Self {
        Self {
            std: std.into_iter().map(|s| s.max(STD_EPSILON)).collect(),
            mean,
            max_distance: 0.0,
            min_distance: 0.0,
        }
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn std(&self) -> &[f64] {
        &self.std
    }

    pub fn max_distance(&self) -> f64 {
        self.max_distance
    }

    fn distance(&self, row: &[f64]) -> f64 {
        row.iter()
            .zip(&self.mean)
            .zip(&self.std)
            .map(|((v, m), s)| ((v - m) / s).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Hard labels: nominal within the largest training distance, else outlier.
    pub fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        self.ensure_fitted()?;
        check_width(x, self.mean.len())?;
        Ok(x.iter()
            .map(|row| {
                if self.distance(row) <= self.max_distance {
                    NOMINAL_LABEL
                } else {
                    OUTLIER_LABEL
                }
            })
            .collect())
    }

    fn ensure_fitted(&self) -> Result<(), MlError> {
        if self.mean.is_empty() {
            return Err(MlError::not_fitted("distance outlier scorer"));
        }
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self, MlError> {
        let params: DistanceParameters = require_json(&dir.join(PARAMETERS_FILE))?;
        let mean: Vec<f64> = require_json(&dir.join(MEAN_FILE))?;
        let std: Vec<f64> = require_json(&dir.join(STD_FILE))?;
        Ok(Self {
            max_distance: params.max_distance as f64,
            min_distance: params.min_distance as f64,
            ..Self::from_parameters(mean, std)
        })
    }
}

impl OutlierScorer for DistanceScorer {
    fn fit(&mut self, x: &[Vec<f64>], y: Option<&[i64]>) -> Result<(), MlError> {
        let nominal = nominal_rows(x, y)?;
        let dims = nominal[0].len();
        check_width(&nominal, dims)?;
        let n = nominal.len() as f64;
        let mut mean = vec![0.0; dims];
        for row in &nominal {
            for (m, v) in mean.iter_mut().zip(row.iter()) {
                *m += v / n;
            }
        }
        let mut var = vec![0.0; dims];
        for row in &nominal {
            for ((s, v), m) in var.iter_mut().zip(row.iter()).zip(&mean) {
                *s += (v - m).powi(2) / n;
            }
        }
        *self = Self::from_parameters(mean, var.into_iter().map(f64::sqrt).collect());

        let distances: Vec<f64> = nominal.iter().map(|row| self.distance(row)).collect();
        self.max_distance = distances.iter().copied().fold(0.0, f64::max);
        self.min_distance = distances.iter().copied().fold(f64::INFINITY, f64::min);
        Ok(())
    }

    fn score_samples(&self, x: &[Vec<f64>]) -> Result<Vec<f64>, MlError> {
        self.ensure_fitted()?;
        check_width(x, self.mean.len())?;
        Ok(x.iter().map(|row| -self.distance(row)).collect())
    }

    fn save(&self, dir: &Path) -> Result<(), MlError> {
        // Bounds are stored truncated to whole distances.
        let params = DistanceParameters {
            max_distance: self.max_distance.trunc() as i64,
            min_distance: self.min_distance.trunc() as i64,
        };
        atomic_write_json(&dir.join(PARAMETERS_FILE), &params)?;
        atomic_write_json(&dir.join(MEAN_FILE), &self.mean)?;
        atomic_write_json(&dir.join(STD_FILE), &self.std)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_far_sample_scores_low() {
        let scorer = DistanceScorer::from_parameters(vec![0.0, 0.0], vec![1.0, 1.0]);
        let scores = scorer
            .score_samples(&[vec![10.0, 10.0], vec![0.1, -0.1]])
            .unwrap();
        assert!((scores[0] + 200f64.sqrt()).abs() < 1e-12);
        assert!(scores[0] < -10.0);
        assert!(scores[1].abs() < 0.2);
    }

    #[test]
    fn test_fit_uses_nominal_rows_only() {
        let x = vec![vec![-1.0, 5.0], vec![1.0, 5.0], vec![100.0, 100.0]];
        let mut scorer = DistanceScorer::new();
        scorer.fit(&x, Some(&[0, 0, OUTLIER_LABEL])).unwrap();
        assert_eq!(scorer.mean(), &[0.0, 5.0]);
        // Zero spread is floored instead of dividing by zero.
        assert_eq!(scorer.std(), &[1.0, STD_EPSILON]);
        assert!((scorer.max_distance() - 1.0).abs() < 1e-12);
        assert_eq!(
            scorer.predict(&[vec![0.5, 5.0], vec![3.0, 5.0]]).unwrap(),
            vec![NOMINAL_LABEL, OUTLIER_LABEL]
        );
    }

    #[test]
    fn test_save_writes_whole_parameters() {
        let dir = TempDir::new().unwrap();
        let x = vec![vec![0.0], vec![2.0], vec![4.0]];
        let mut scorer = DistanceScorer::new();
        scorer.fit(&x, None).unwrap();
        scorer.save(dir.path()).unwrap();

        let raw: serde_json::Value = require_json(&dir.path().join(PARAMETERS_FILE)).unwrap();
        assert_eq!(raw["max_dist"], serde_json::json!(1));
        assert_eq!(raw["min_dist"], serde_json::json!(0));

        let loaded = DistanceScorer::load(dir.path()).unwrap();
        assert_eq!(
            loaded.score_samples(&[vec![3.0]]).unwrap(),
            scorer.score_samples(&[vec![3.0]]).unwrap()
        );
    }

    #[test]
    fn test_saved_bounds_are_truncated() {
        let dir = TempDir::new().unwrap();
        let x = vec![vec![0.0], vec![0.0], vec![0.0], vec![1.0]];
        let mut scorer = DistanceScorer::new();
        scorer.fit(&x, None).unwrap();
        assert!((scorer.max_distance() - 3f64.sqrt()).abs() < 1e-9);
        scorer.save(dir.path()).unwrap();

        let raw: serde_json::Value = require_json(&dir.path().join(PARAMETERS_FILE)).unwrap();
        assert_eq!(raw["max_dist"], serde_json::json!(1));

        // The reloaded threshold is the truncated one.
        let loaded = DistanceScorer::load(dir.path()).unwrap();
        assert_eq!(loaded.max_distance(), 1.0);
        assert_eq!(scorer.predict(&[vec![1.0]]).unwrap(), vec![NOMINAL_LABEL]);
        assert_eq!(loaded.predict(&[vec![1.0]]).unwrap(), vec![OUTLIER_LABEL]);
    }

    #[test]
    fn test_unfitted_scorer_fails() {
        assert!(matches!(
            DistanceScorer::new().score_samples(&[vec![1.0]]),
            Err(MlError::NotFitted(_))
        ));
    }
}
