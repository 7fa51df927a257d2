//! Boosted tree ensembles.

use super::forest::balanced_bootstrap;
use super::tree::{GrowParams, Node, RegressionStats, grow, grow_classifier};
use super::{
    BoostParams, Estimator, ProbabilityEstimator, argmax, check_training, check_width,
    encode_labels, labels_from_scores, softmax_in_place,
};
use crate::error::MlError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Multi-class AdaBoost (SAMME) over shallow trees.
///
/// With `undersample` set, every round fits on a class-balanced random
/// undersample of the data (RUSBoost) while weights are updated on all rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaBoost {
    classes: Vec<i64>,
    dims: usize,
    undersample: bool,
    learners: Vec<(Node, f64)>,
}

impl AdaBoost {
    pub fn fit(params: &BoostParams, undersample: bool, x: &[Vec<f64>], y: &[i64]) -> Result<Self, MlError> {
        let dims = check_training(x, y)?;
        let (classes, encoded) = encode_labels(y);
        let k = classes.len();
        let n = y.len();
        let mut rng = StdRng::seed_from_u64(params.seed);
        let grow_params = GrowParams::full(Some(params.max_depth.max(1)));
        let mut weights = vec![1.0 / n as f64; n];
        let mut learners = Vec::new();

        // A single class needs one constant learner and no boosting.
        let n_rounds = if k < 2 { 1 } else { params.n_estimators };
        for round in 0..n_rounds {
            let mut rows = if undersample {
                balanced_bootstrap(&encoded, k, &mut rng)
            } else {
                (0..n).collect()
            };
            let tree = grow_classifier(x, &encoded, &weights, k, &mut rows, &grow_params, &mut rng);
            let wrong: Vec<bool> = (0..n)
                .map(|i| argmax(tree.leaf(&x[i])) != encoded[i])
                .collect();
            let total: f64 = weights.iter().sum();
            let error: f64 = weights
                .iter()
                .zip(&wrong)
                .filter(|(_, w)| **w)
                .map(|(v, _)| v)
                .sum::<f64>()
                / total;

            if error <= 1e-10 {
                learners.push((tree, 1.0));
                break;
            }
            if error >= 1.0 - 1.0 / k as f64 {
                if learners.is_empty() {
                    learners.push((tree, 1.0));
                }
                tracing::debug!(round, error, "Boosting stopped: learner no better than chance");
                break;
            }
            let alpha =
                params.learning_rate * (((1.0 - error) / error).ln() + (k as f64 - 1.0).ln());
            for (w, is_wrong) in weights.iter_mut().zip(&wrong) {
                if *is_wrong {
                    *w *= alpha.exp();
                }
            }
            let total: f64 = weights.iter().sum();
            weights.iter_mut().for_each(|w| *w /= total);
            learners.push((tree, alpha));
        }

        Ok(Self {
            classes,
            dims,
            undersample,
            learners,
        })
    }

    fn decision(&self, row: &[f64]) -> Vec<f64> {
        let k = self.classes.len();
        let mut votes = vec![0.0; k];
        for (tree, alpha) in &self.learners {
            votes[argmax(tree.leaf(row))] += alpha;
        }
        let total: f64 = self.learners.iter().map(|(_, a)| a).sum();
        if total > 0.0 {
            votes.iter_mut().for_each(|v| *v /= total);
        }
        votes
    }
}

impl Estimator for AdaBoost {
    fn classes(&self) -> &[i64] {
        &self.classes
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        check_width(x, self.dims)?;
        let scores: Vec<Vec<f64>> = x.iter().map(|row| self.decision(row)).collect();
        Ok(labels_from_scores(&self.classes, &scores))
    }
}

impl ProbabilityEstimator for AdaBoost {
    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, MlError> {
        check_width(x, self.dims)?;
        let k = self.classes.len();
        let scale = (k as f64 - 1.0).max(1.0);
        Ok(x.iter()
            .map(|row| {
                let mut p: Vec<f64> = self.decision(row).iter().map(|v| v * k as f64 / scale).collect();
                softmax_in_place(&mut p);
                p
            })
            .collect())
    }
}

/// Gradient boosting with a softmax loss: one regression tree per class and round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoosting {
    classes: Vec<i64>,
    dims: usize,
    learning_rate: f64,
    init: Vec<f64>,
    rounds: Vec<Vec<Node>>,
}

impl GradientBoosting {
    pub fn fit(params: &BoostParams, x: &[Vec<f64>], y: &[i64]) -> Result<Self, MlError> {
        let dims = check_training(x, y)?;
        let (classes, encoded) = encode_labels(y);
        let k = classes.len();
        let n = y.len();
        let mut rng = StdRng::seed_from_u64(params.seed);
        let grow_params = GrowParams::full(Some(params.max_depth.max(1)));

        let mut counts = vec![0.0; k];
        encoded.iter().for_each(|&c| counts[c] += 1.0);
        let init: Vec<f64> = counts.iter().map(|c| (c / n as f64).ln()).collect();
        let mut raw: Vec<Vec<f64>> = vec![init.clone(); n];
        let mut rounds = Vec::new();

        if k >= 2 {
            for _ in 0..params.n_estimators {
                let probs: Vec<Vec<f64>> = raw
                    .iter()
                    .map(|r| {
                        let mut p = r.clone();
                        softmax_in_place(&mut p);
                        p
                    })
                    .collect();
                let mut trees = Vec::with_capacity(k);
                for class in 0..k {
                    let target: Vec<f64> = (0..n)
                        .map(|i| f64::from(u8::from(encoded[i] == class)) - probs[i][class])
                        .collect();
                    let hessian: Vec<f64> = (0..n)
                        .map(|i| (probs[i][class] * (1.0 - probs[i][class])).max(1e-6))
                        .collect();
                    let mut rows: Vec<usize> = (0..n).collect();
                    let stats = RegressionStats::new(&target, &hessian);
                    let mut tree = grow(x, &mut rows, &stats, &grow_params, &mut rng, 0);
                    scale_leaves(&mut tree, (k as f64 - 1.0) / k as f64);
                    for (i, row) in x.iter().enumerate() {
                        raw[i][class] += params.learning_rate * tree.leaf(row)[0];
                    }
                    trees.push(tree);
                }
                rounds.push(trees);
            }
        }

        Ok(Self {
            classes,
            dims,
            learning_rate: params.learning_rate,
            init,
            rounds,
        })
    }

    fn raw_scores(&self, row: &[f64]) -> Vec<f64> {
        let mut raw = self.init.clone();
        for trees in &self.rounds {
            for (r, tree) in raw.iter_mut().zip(trees) {
                *r += self.learning_rate * tree.leaf(row)[0];
            }
        }
        raw
    }
}

fn scale_leaves(node: &mut Node, factor: f64) {
    match node {
        Node::Leaf(values) => values.iter_mut().for_each(|v| *v *= factor),
        Node::Split { left, right, .. } => {
            scale_leaves(left, factor);
            scale_leaves(right, factor);
        }
    }
}

impl Estimator for GradientBoosting {
    fn classes(&self) -> &[i64] {
        &self.classes
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        Ok(labels_from_scores(&self.classes, &self.predict_proba(x)?))
    }
}

impl ProbabilityEstimator for GradientBoosting {
    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, MlError> {
        check_width(x, self.dims)?;
        Ok(x.iter()
            .map(|row| {
                let mut p = self.raw_scores(row);
                softmax_in_place(&mut p);
                p
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::{accuracy, blobs};

    fn params(n: usize, lr: f64, depth: usize) -> BoostParams {
        BoostParams {
            n_estimators: n,
            learning_rate: lr,
            max_depth: depth,
            seed: 0,
        }
    }

    #[test]
    fn test_samme_combines_stumps() {
        let (x, y) = blobs(20);
        let model = AdaBoost::fit(&params(10, 1.0, 1), false, &x, &y).unwrap();
        // Three blobs need at least two axis-aligned stumps.
        assert!(model.learners.len() >= 2);
        assert!(accuracy(&model.predict(&x).unwrap(), &y) > 0.95);
    }

    #[test]
    fn test_gradient_boosting_confidence_grows_with_rounds() {
        let (x, y) = blobs(10);
        let few = GradientBoosting::fit(&params(2, 0.1, 2), &x, &y).unwrap();
        let many = GradientBoosting::fit(&params(30, 0.1, 2), &x, &y).unwrap();
        let p_few = few.predict_proba(&x[..1]).unwrap()[0][0];
        let p_many = many.predict_proba(&x[..1]).unwrap()[0][0];
        assert!(p_many > p_few);
        assert!(p_few > 1.0 / 3.0);
    }

    #[test]
    fn test_single_class_training() {
        let x = vec![vec![1.0], vec![2.0]];
        let y = vec![4, 4];
        let ada = AdaBoost::fit(&params(5, 1.0, 1), false, &x, &y).unwrap();
        assert_eq!(ada.predict(&x).unwrap(), vec![4, 4]);
        let gb = GradientBoosting::fit(&params(5, 0.1, 1), &x, &y).unwrap();
        assert_eq!(gb.predict_proba(&x).unwrap()[0], vec![1.0]);
    }
}
