//! CART trees.
//!
//! One grower serves classification (weighted Gini) and regression
//! (squared error with Newton leaf values) through the [`SplitStats`] seam.

use super::{
    ProbabilityEstimator, Estimator, TreeParams, balanced_weights, check_width, encode_labels,
    labels_from_scores,
};
use crate::error::MlError;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// A fitted tree node. Leaves hold a class distribution or a single value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Leaf(Vec<f64>),
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    pub fn leaf(&self, row: &[f64]) -> &[f64] {
        let mut node = self;
        loop {
            match node {
                Node::Leaf(value) => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if row[*feature] <= *threshold { left } else { right };
                }
            }
        }
    }
}

/// How a grower picks features and thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct GrowParams {
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    /// Features examined per split; `None` examines all.
    pub max_features: Option<usize>,
    /// Draw one random threshold per feature instead of scanning all.
    pub random_thresholds: bool,
}

impl GrowParams {
    pub fn full(max_depth: Option<usize>) -> Self {
        Self {
            max_depth,
            min_samples_split: 2,
            max_features: None,
            random_thresholds: false,
        }
    }
}

/// Running sufficient statistics of one side of a split.
pub(crate) trait SplitStats: Clone {
    fn add(&mut self, i: usize);
    fn remove(&mut self, i: usize);
    /// Weighted impurity of the samples currently held.
    fn cost(&self) -> f64;
    fn leaf(&self) -> Vec<f64>;
}

#[derive(Clone)]
pub(crate) struct ClassStats<'a> {
    y: &'a [usize],
    w: &'a [f64],
    weights: Vec<f64>,
    total: f64,
}

impl<'a> ClassStats<'a> {
    pub fn new(y: &'a [usize], w: &'a [f64], n_classes: usize) -> Self {
        Self {
            y,
            w,
            weights: vec![0.0; n_classes],
            total: 0.0,
        }
    }
}

impl SplitStats for ClassStats<'_> {
    fn add(&mut self, i: usize) {
        self.weights[self.y[i]] += self.w[i];
        self.total += self.w[i];
    }

    fn remove(&mut self, i: usize) {
        self.weights[self.y[i]] -= self.w[i];
        self.total -= self.w[i];
    }

    fn cost(&self) -> f64 {
        if self.total <= 0.0 {
            return 0.0;
        }
        self.total - self.weights.iter().map(|c| c * c).sum::<f64>() / self.total
    }

    fn leaf(&self) -> Vec<f64> {
        if self.total <= 0.0 {
            let k = self.weights.len() as f64;
            return vec![1.0 / k; self.weights.len()];
        }
        self.weights.iter().map(|c| (c / self.total).max(0.0)).collect()
    }

}

/// Squared-error statistics over gradient targets with Newton leaf values.
#[derive(Clone)]
pub(crate) struct RegressionStats<'a> {
    target: &'a [f64],
    hessian: &'a [f64],
    sum: f64,
    sum_sq: f64,
    sum_h: f64,
    count: usize,
}

impl<'a> RegressionStats<'a> {
    pub fn new(target: &'a [f64], hessian: &'a [f64]) -> Self {
        Self {
            target,
            hessian,
            sum: 0.0,
            sum_sq: 0.0,
            sum_h: 0.0,
            count: 0,
        }
    }
}

impl SplitStats for RegressionStats<'_> {
    fn add(&mut self, i: usize) {
        self.sum += self.target[i];
        self.sum_sq += self.target[i] * self.target[i];
        self.sum_h += self.hessian[i];
        self.count += 1;
    }

    fn remove(&mut self, i: usize) {
        self.sum -= self.target[i];
        self.sum_sq -= self.target[i] * self.target[i];
        self.sum_h -= self.hessian[i];
        self.count -= 1;
    }

    fn cost(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.sum_sq - self.sum * self.sum / self.count as f64).max(0.0)
    }

    fn leaf(&self) -> Vec<f64> {
        if self.sum_h.abs() < 1e-12 {
            return vec![0.0];
        }
        vec![self.sum / self.sum_h]
    }

}

struct Split {
    feature: usize,
    threshold: f64,
    cost: f64,
}

/// Grow a tree over `indices` of `x`.
pub(crate) fn grow<S: SplitStats>(
    x: &[Vec<f64>],
    indices: &mut [usize],
    empty: &S,
    params: &GrowParams,
    rng: &mut StdRng,
    depth: usize,
) -> Node {
    let mut all = empty.clone();
    indices.iter().for_each(|&i| all.add(i));
    let cost = all.cost();

    let stop = params.max_depth.is_some_and(|d| depth >= d)
        || indices.len() < params.min_samples_split.max(2)
        || cost <= 1e-12;
    if stop {
        return Node::Leaf(all.leaf());
    }

    let Some(split) = best_split(x, indices, empty, &all, params, rng) else {
        return Node::Leaf(all.leaf());
    };
    if split.cost >= cost - 1e-12 {
        return Node::Leaf(all.leaf());
    }

    let mut boundary = 0;
    for k in 0..indices.len() {
        if x[indices[k]][split.feature] <= split.threshold {
            indices.swap(k, boundary);
            boundary += 1;
        }
    }
    if boundary == 0 || boundary == indices.len() {
        return Node::Leaf(all.leaf());
    }
    let (left, right) = indices.split_at_mut(boundary);
    Node::Split {
        feature: split.feature,
        threshold: split.threshold,
        left: Box::new(grow(x, left, empty, params, rng, depth + 1)),
        right: Box::new(grow(x, right, empty, params, rng, depth + 1)),
    }
}

fn best_split<S: SplitStats>(
    x: &[Vec<f64>],
    indices: &[usize],
    empty: &S,
    all: &S,
    params: &GrowParams,
    rng: &mut StdRng,
) -> Option<Split> {
    let dims = x[indices[0]].len();
    let features: Vec<usize> = match params.max_features {
        Some(m) if m < dims => sample(rng, dims, m.max(1)).into_vec(),
        _ => (0..dims).collect(),
    };

    let mut best: Option<Split> = None;
    let mut consider = |candidate: Split| {
        if best.as_ref().is_none_or(|b| candidate.cost < b.cost) {
            best = Some(candidate);
        }
    };

    for feature in features {
        if params.random_thresholds {
            let (lo, hi) = indices.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                (lo.min(x[i][feature]), hi.max(x[i][feature]))
            });
            if hi <= lo {
                continue;
            }
            let threshold = rng.gen_range(lo..hi);
            let mut left = empty.clone();
            let mut right = empty.clone();
            for &i in indices {
                if x[i][feature] <= threshold {
                    left.add(i);
                } else {
                    right.add(i);
                }
            }
            consider(Split {
                feature,
                threshold,
                cost: left.cost() + right.cost(),
            });
            continue;
        }

        let mut order = indices.to_vec();
        order.sort_by(|&a, &b| x[a][feature].total_cmp(&x[b][feature]));
        let mut left = empty.clone();
        let mut right = all.clone();
        for k in 0..order.len() - 1 {
            left.add(order[k]);
            right.remove(order[k]);
            let (here, next) = (x[order[k]][feature], x[order[k + 1]][feature]);
            if here >= next {
                continue;
            }
            consider(Split {
                feature,
                threshold: here + (next - here) / 2.0,
                cost: left.cost() + right.cost(),
            });
        }
    }
    best
}

/// Grow a classification tree with per-sample weights.
pub(crate) fn grow_classifier(
    x: &[Vec<f64>],
    encoded: &[usize],
    weights: &[f64],
    n_classes: usize,
    indices: &mut [usize],
    params: &GrowParams,
    rng: &mut StdRng,
) -> Node {
    let empty = ClassStats::new(encoded, weights, n_classes);
    grow(x, indices, &empty, params, rng, 0)
}

/// A single CART classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    classes: Vec<i64>,
    dims: usize,
    root: Node,
}

impl DecisionTree {
    /// `balanced` reweights samples inversely to their class frequency.
    pub fn fit(params: &TreeParams, balanced: bool, x: &[Vec<f64>], y: &[i64]) -> Result<Self, MlError> {
        let dims = super::check_training(x, y)?;
        let (classes, encoded) = encode_labels(y);
        let weights = if balanced {
            balanced_weights(&encoded, classes.len())
        } else {
            vec![1.0; y.len()]
        };
        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut indices: Vec<usize> = (0..y.len()).collect();
        let root = grow_classifier(
            x,
            &encoded,
            &weights,
            classes.len(),
            &mut indices,
            &GrowParams::full(params.max_depth),
            &mut rng,
        );
        Ok(Self {
            classes,
            dims,
            root,
        })
    }
}

impl Estimator for DecisionTree {
    fn classes(&self) -> &[i64] {
        &self.classes
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        Ok(labels_from_scores(&self.classes, &self.predict_proba(x)?))
    }
}

impl ProbabilityEstimator for DecisionTree {
    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, MlError> {
        check_width(x, self.dims)?;
        Ok(x.iter().map(|row| self.root.leaf(row).to_vec()).collect())
    }
}
