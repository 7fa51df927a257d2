//! Multilayer perceptron: ReLU hidden layers, softmax output, Adam.

use super::{
    Estimator, MlpParams, ProbabilityEstimator, Standardizer, check_training, check_width,
    encode_labels, labels_from_scores, softmax_in_place,
};
use crate::error::MlError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const BATCH_SIZE: usize = 200;
const L2_ALPHA: f64 = 1e-4;
const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Layer {
    /// `weights[o][i]` connects input `i` to output `o`.
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

impl Layer {
    fn glorot(inputs: usize, outputs: usize, rng: &mut StdRng) -> Self {
        let bound = (6.0 / (inputs + outputs) as f64).sqrt();
        Self {
            weights: (0..outputs)
                .map(|_| (0..inputs).map(|_| rng.gen_range(-bound..bound)).collect())
                .collect(),
            bias: (0..outputs).map(|_| rng.gen_range(-bound..bound)).collect(),
        }
    }

    fn forward(&self, input: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(w, b)| w.iter().zip(input).map(|(a, v)| a * v).sum::<f64>() + b)
            .collect()
    }

    fn zeros_like(&self) -> Self {
        Self {
            weights: self.weights.iter().map(|w| vec![0.0; w.len()]).collect(),
            bias: vec![0.0; self.bias.len()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    classes: Vec<i64>,
    scaler: Standardizer,
    layers: Vec<Layer>,
}

impl Mlp {
    /// `max_iter` counts epochs.
    pub fn fit(params: &MlpParams, x: &[Vec<f64>], y: &[i64]) -> Result<Self, MlError> {
        let dims = check_training(x, y)?;
        let (classes, encoded) = encode_labels(y);
        let scaler = Standardizer::fit(x);
        let z = scaler.apply_all(x);
        let mut rng = StdRng::seed_from_u64(params.seed);

        let mut sizes = vec![dims];
        sizes.extend(params.layer_structure.iter().filter(|s| **s > 0));
        sizes.push(classes.len());
        let mut layers: Vec<Layer> = sizes
            .windows(2)
            .map(|w| Layer::glorot(w[0], w[1], &mut rng))
            .collect();

        let mut first = layers.iter().map(Layer::zeros_like).collect::<Vec<_>>();
        let mut second = first.clone();
        let mut step = 0i32;
        let mut order: Vec<usize> = (0..z.len()).collect();
        let batch = BATCH_SIZE.min(z.len());

        for _ in 0..params.max_iter {
            order.shuffle(&mut rng);
            for chunk in order.chunks(batch) {
                let mut grads: Vec<Layer> = layers.iter().map(Layer::zeros_like).collect();
                for &i in chunk {
                    accumulate_gradient(&layers, &z[i], encoded[i], &mut grads);
                }
                step += 1;
                let scale = 1.0 / chunk.len() as f64;
                let lr = params.learning_rate * (1.0 - BETA2.powi(step)).sqrt() / (1.0 - BETA1.powi(step));
                for (l, layer) in layers.iter_mut().enumerate() {
                    for o in 0..layer.bias.len() {
                        for i in 0..layer.weights[o].len() {
                            let g = grads[l].weights[o][i] * scale + L2_ALPHA * layer.weights[o][i] * scale;
                            let (m, v) = adam(&mut first[l].weights[o][i], &mut second[l].weights[o][i], g);
                            layer.weights[o][i] -= lr * m / (v.sqrt() + ADAM_EPS);
                        }
                        let g = grads[l].bias[o] * scale;
                        let (m, v) = adam(&mut first[l].bias[o], &mut second[l].bias[o], g);
                        layer.bias[o] -= lr * m / (v.sqrt() + ADAM_EPS);
                    }
                }
            }
        }

        Ok(Self {
            classes,
            scaler,
            layers,
        })
    }

    fn activations(layers: &[Layer], input: &[f64]) -> Vec<Vec<f64>> {
        let mut acts = vec![input.to_vec()];
        for (l, layer) in layers.iter().enumerate() {
            let mut out = layer.forward(&acts[l]);
            if l + 1 < layers.len() {
                out.iter_mut().for_each(|v| *v = v.max(0.0));
            } else {
                softmax_in_place(&mut out);
            }
            acts.push(out);
        }
        acts
    }
}

fn adam(m: &mut f64, v: &mut f64, g: f64) -> (f64, f64) {
    *m = BETA1 * *m + (1.0 - BETA1) * g;
    *v = BETA2 * *v + (1.0 - BETA2) * g * g;
    (*m, *v)
}

/// Backpropagate the cross-entropy loss of one sample into `grads`.
fn accumulate_gradient(layers: &[Layer], input: &[f64], label: usize, grads: &mut [Layer]) {
    let acts = Mlp::activations(layers, input);
    let mut delta: Vec<f64> = acts[layers.len()].clone();
    delta[label] -= 1.0;
    for l in (0..layers.len()).rev() {
        for (o, d) in delta.iter().enumerate() {
            grads[l].bias[o] += d;
            for (g, a) in grads[l].weights[o].iter_mut().zip(&acts[l]) {
                *g += d * a;
            }
        }
        if l == 0 {
            break;
        }
        delta = (0..acts[l].len())
            .map(|i| {
                if acts[l][i] <= 0.0 {
                    return 0.0;
                }
                layers[l].weights.iter().zip(&delta).map(|(w, d)| w[i] * d).sum()
            })
            .collect();
    }
}

impl Estimator for Mlp {
    fn classes(&self) -> &[i64] {
        &self.classes
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        Ok(labels_from_scores(&self.classes, &self.predict_proba(x)?))
    }
}

impl ProbabilityEstimator for Mlp {
    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, MlError> {
        check_width(x, self.scaler.mean.len())?;
        Ok(x.iter()
            .map(|row| {
                let mut acts = Self::activations(&self.layers, &self.scaler.apply(row));
                acts.pop().unwrap_or_default()
            })
            .collect())
    }
}
