//! Linear classifiers on standardised features.

use super::{
    Estimator, LinearParams, ProbabilityEstimator, Standardizer, check_training, check_width,
    encode_labels, labels_from_scores, softmax_in_place,
};
use crate::error::MlError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

const LOGISTIC_STEP: f64 = 0.5;
const SGD_ALPHA: f64 = 1e-4;
const SGD_ETA0: f64 = 0.1;

/// Weights and biases of one linear score per class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LinearScores {
    scaler: Standardizer,
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

impl LinearScores {
    fn zeros(scaler: Standardizer, k: usize, dims: usize) -> Self {
        Self {
            scaler,
            weights: vec![vec![0.0; dims]; k],
            bias: vec![0.0; k],
        }
    }

    fn raw(&self, z: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(w, b)| w.iter().zip(z).map(|(a, v)| a * v).sum::<f64>() + b)
            .collect()
    }

    fn scores(&self, x: &[Vec<f64>]) -> Vec<Vec<f64>> {
        x.iter().map(|row| self.raw(&self.scaler.apply(row))).collect()
    }
}

/// Multinomial logistic regression fitted by full-batch gradient descent
/// with L2 penalty `1 / (2 C n)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    classes: Vec<i64>,
    dims: usize,
    linear: LinearScores,
}

impl LogisticRegression {
    pub fn fit(params: &LinearParams, x: &[Vec<f64>], y: &[i64]) -> Result<Self, MlError> {
        let dims = check_training(x, y)?;
        let (classes, encoded) = encode_labels(y);
        let k = classes.len();
        let scaler = Standardizer::fit(x);
        let z = scaler.apply_all(x);
        let n = z.len() as f64;
        let l2 = 1.0 / (params.c.max(1e-12) * n);
        let mut linear = LinearScores::zeros(scaler, k, dims);

        for _ in 0..params.max_iter {
            let mut grad_w = vec![vec![0.0; dims]; k];
            let mut grad_b = vec![0.0; k];
            for (row, &label) in z.iter().zip(&encoded) {
                let mut p = linear.raw(row);
                softmax_in_place(&mut p);
                for c in 0..k {
                    let err = p[c] - f64::from(u8::from(c == label));
                    grad_b[c] += err / n;
                    for (g, v) in grad_w[c].iter_mut().zip(row) {
                        *g += err * v / n;
                    }
                }
            }
            for c in 0..k {
                for (w, g) in linear.weights[c].iter_mut().zip(&grad_w[c]) {
                    *w -= LOGISTIC_STEP * (g + l2 * *w);
                }
                linear.bias[c] -= LOGISTIC_STEP * grad_b[c];
            }
        }

        Ok(Self {
            classes,
            dims,
            linear,
        })
    }
}

impl Estimator for LogisticRegression {
    fn classes(&self) -> &[i64] {
        &self.classes
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        check_width(x, self.dims)?;
        Ok(labels_from_scores(&self.classes, &self.linear.scores(x)))
    }
}

impl ProbabilityEstimator for LogisticRegression {
    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, MlError> {
        check_width(x, self.dims)?;
        let mut scores = self.linear.scores(x);
        scores.iter_mut().for_each(|s| softmax_in_place(s));
        Ok(scores)
    }
}

/// One-vs-rest linear SVM trained by stochastic gradient descent on the
/// hinge loss. Exposes no probability estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdClassifier {
    classes: Vec<i64>,
    dims: usize,
    linear: LinearScores,
}

impl SgdClassifier {
    pub fn fit(params: &LinearParams, x: &[Vec<f64>], y: &[i64]) -> Result<Self, MlError> {
        let dims = check_training(x, y)?;
        let (classes, encoded) = encode_labels(y);
        let k = classes.len();
        let scaler = Standardizer::fit(x);
        let z = scaler.apply_all(x);
        let mut linear = LinearScores::zeros(scaler, k, dims);
        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut order: Vec<usize> = (0..z.len()).collect();

        if k > 1 {
            let mut t = 1.0f64;
            for _ in 0..params.max_iter {
                order.shuffle(&mut rng);
                for &i in &order {
                    let eta = SGD_ETA0 / t.sqrt();
                    t += 1.0;
                    for c in 0..k {
                        let target = if encoded[i] == c { 1.0 } else { -1.0 };
                        let w = &mut linear.weights[c];
                        let margin =
                            target * (w.iter().zip(&z[i]).map(|(a, v)| a * v).sum::<f64>() + linear.bias[c]);
                        w.iter_mut().for_each(|a| *a *= 1.0 - eta * SGD_ALPHA);
                        if margin < 1.0 {
                            for (a, v) in w.iter_mut().zip(&z[i]) {
                                *a += eta * target * v;
                            }
                            linear.bias[c] += eta * target;
                        }
                    }
                }
            }
        }

        Ok(Self {
            classes,
            dims,
            linear,
        })
    }

    /// Signed distance to each one-vs-rest hyperplane.
    pub fn decision_function(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, MlError> {
        check_width(x, self.dims)?;
        Ok(self.linear.scores(x))
    }
}

impl Estimator for SgdClassifier {
    fn classes(&self) -> &[i64] {
        &self.classes
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        Ok(labels_from_scores(&self.classes, &self.decision_function(x)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::{accuracy, blobs};

    fn params(max_iter: usize) -> LinearParams {
        LinearParams {
            max_iter,
            c: 1.0,
            seed: 0,
        }
    }

    #[test]
    fn test_logistic_probabilities_follow_distance() {
        let x: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64]).collect();
        let y: Vec<i64> = (0..20).map(|i| i64::from(i >= 10)).collect();
        let model = LogisticRegression::fit(&params(200), &x, &y).unwrap();
        let p = model.predict_proba(&[vec![0.0], vec![9.0], vec![19.0]]).unwrap();
        assert!(p[0][1] < p[1][1]);
        assert!(p[1][1] < p[2][1]);
        assert_eq!(model.predict(&[vec![2.0], vec![17.0]]).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_sgd_separates_blobs() {
        let (x, y) = blobs(20);
        let model = SgdClassifier::fit(&params(30), &x, &y).unwrap();
        assert!(accuracy(&model.predict(&x).unwrap(), &y) > 0.95);
        assert_eq!(model.decision_function(&x[..1]).unwrap()[0].len(), 3);
    }
}
