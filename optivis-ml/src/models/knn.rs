//! k-nearest-neighbour voting on standardised features.

use super::{
    Estimator, KnnParams, ProbabilityEstimator, Standardizer, check_training, check_width,
    encode_labels, labels_from_scores,
};
use crate::aggregation::codebook::squared_distance;
use crate::error::MlError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Knn {
    classes: Vec<i64>,
    k: usize,
    scaler: Standardizer,
    samples: Vec<Vec<f64>>,
    encoded: Vec<usize>,
}

impl Knn {
    pub fn fit(params: &KnnParams, x: &[Vec<f64>], y: &[i64]) -> Result<Self, MlError> {
        check_training(x, y)?;
        let (classes, encoded) = encode_labels(y);
        let scaler = Standardizer::fit(x);
        Ok(Self {
            classes,
            k: params.n_neighbours.min(y.len()).max(1),
            samples: scaler.apply_all(x),
            scaler,
            encoded,
        })
    }

    fn votes(&self, row: &[f64]) -> Vec<f64> {
        let z = self.scaler.apply(row);
        let mut distances: Vec<(f64, usize)> = self
            .samples
            .iter()
            .enumerate()
            .map(|(i, s)| (squared_distance(s, &z), i))
            .collect();
        // Equal distances keep training order.
        distances.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let mut votes = vec![0.0; self.classes.len()];
        for &(_, i) in distances.iter().take(self.k) {
            votes[self.encoded[i]] += 1.0 / self.k as f64;
        }
        votes
    }
}

impl Estimator for Knn {
    fn classes(&self) -> &[i64] {
        &self.classes
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        Ok(labels_from_scores(&self.classes, &self.predict_proba(x)?))
    }
}

impl ProbabilityEstimator for Knn {
    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, MlError> {
        check_width(x, self.scaler.mean.len())?;
        Ok(x.iter().map(|row| self.votes(row)).collect())
    }
}
