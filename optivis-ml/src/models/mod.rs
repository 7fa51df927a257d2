//! Trainable model capability.
//!
//! [`ModelConfig`] is a closed set of supported model families, each with a
//! typed parameter payload. [`Model`] is the matching set of fitted models.
//! Every model implements [`Estimator`]; models that expose class
//! probabilities also implement [`ProbabilityEstimator`], which callers
//! query through [`Model::as_proba`].

pub mod bayes;
pub mod boosting;
pub mod forest;
pub mod knn;
pub mod linear;
pub mod mlp;
pub mod svm;
pub mod tree;

pub use bayes::GaussianNb;
pub use boosting::{AdaBoost, GradientBoosting};
pub use forest::{Forest, ForestKind};
pub use knn::Knn;
pub use linear::{LogisticRegression, SgdClassifier};
pub use mlp::Mlp;
pub use svm::KernelSvm;
pub use tree::DecisionTree;

use crate::error::MlError;
use crate::grid::ConcreteConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A fitted classifier.
pub trait Estimator {
    /// Sorted class labels seen during fitting.
    fn classes(&self) -> &[i64];

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError>;
}

/// A classifier that estimates class probabilities.
pub trait ProbabilityEstimator: Estimator {
    /// One row per sample, columns ordered like [`Estimator::classes`].
    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, MlError>;
}

/// Supported model families, keyed by the `clf_type` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    RandomForest,
    ExtraTree,
    AdaBoost,
    Xgboost,
    LogisticRegression,
    Sgd,
    GaussianNb,
    Svm,
    Mlp,
    DecisionTree,
    BDecisionTree,
    Knn,
    BRandomForest,
    BBagging,
    BBoosting,
}

impl ModelKind {
    pub const ALL: [ModelKind; 15] = [
        Self::RandomForest,
        Self::ExtraTree,
        Self::AdaBoost,
        Self::Xgboost,
        Self::LogisticRegression,
        Self::Sgd,
        Self::GaussianNb,
        Self::Svm,
        Self::Mlp,
        Self::DecisionTree,
        Self::BDecisionTree,
        Self::Knn,
        Self::BRandomForest,
        Self::BBagging,
        Self::BBoosting,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::RandomForest => "random_forest",
            Self::ExtraTree => "extra_tree",
            Self::AdaBoost => "ada_boost",
            Self::Xgboost => "xgboost",
            Self::LogisticRegression => "logistic_regression",
            Self::Sgd => "sgd",
            Self::GaussianNb => "gaussian_nb",
            Self::Svm => "svm",
            Self::Mlp => "mlp",
            Self::DecisionTree => "decision_tree",
            Self::BDecisionTree => "b_decision_tree",
            Self::Knn => "knn",
            Self::BRandomForest => "b_random_forest",
            Self::BBagging => "b_bagging",
            Self::BBoosting => "b_boosting",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random_forest" | "rf" | "random_forrest" => Ok(Self::RandomForest),
            "extra_tree" => Ok(Self::ExtraTree),
            "ada_boost" => Ok(Self::AdaBoost),
            "xgboost" | "gradient_boosting" => Ok(Self::Xgboost),
            "logistic_regression" | "lr" => Ok(Self::LogisticRegression),
            "sgd" => Ok(Self::Sgd),
            "gaussian_nb" | "bayes" | "gaussian_bayes" => Ok(Self::GaussianNb),
            "svm" | "support_vector_machine" => Ok(Self::Svm),
            "mlp" | "multilayer_perceptron" => Ok(Self::Mlp),
            "decision_tree" | "dt" | "tree" => Ok(Self::DecisionTree),
            "b_decision_tree" | "b_dt" | "b_tree" => Ok(Self::BDecisionTree),
            "knn" | "neighbours" => Ok(Self::Knn),
            "b_random_forest" | "b_rf" | "b_random_forrest" => Ok(Self::BRandomForest),
            "b_bagging" => Ok(Self::BBagging),
            "b_boosting" => Ok(Self::BBoosting),
            other => Err(MlError::UnknownModel(other.to_string())),
        }
    }
}

/// Model options shared across families, read from the concrete config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    #[serde(default = "default_n_estimators")]
    pub n_estimators: usize,
    #[serde(default)]
    pub max_iter: Option<usize>,
    #[serde(default = "default_layer_structure")]
    pub layer_structure: Vec<usize>,
    #[serde(default = "default_n_neighbours")]
    pub n_neighbours: usize,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub learning_rate: Option<f64>,
    /// Inverse regularisation strength.
    #[serde(default = "default_c")]
    pub c: f64,
    #[serde(default)]
    pub seed: u64,
}

fn default_n_estimators() -> usize {
    200
}

fn default_layer_structure() -> Vec<usize> {
    vec![100]
}

fn default_n_neighbours() -> usize {
    5
}

fn default_c() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    pub max_depth: Option<usize>,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoostParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearParams {
    pub max_iter: usize,
    pub c: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KnnParams {
    pub n_neighbours: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpParams {
    pub layer_structure: Vec<usize>,
    pub max_iter: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

/// A model family with its typed parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "clf_type", rename_all = "snake_case")]
pub enum ModelConfig {
    RandomForest(ForestParams),
    ExtraTree(ForestParams),
    AdaBoost(BoostParams),
    Xgboost(BoostParams),
    LogisticRegression(LinearParams),
    Sgd(LinearParams),
    GaussianNb,
    Svm(LinearParams),
    Mlp(MlpParams),
    DecisionTree(TreeParams),
    BDecisionTree(TreeParams),
    Knn(KnnParams),
    BRandomForest(ForestParams),
    BBagging(ForestParams),
    BBoosting(BoostParams),
}

impl ModelConfig {
    /// Build the config named by `clf_type` (default `random_forest`).
    pub fn from_options(options: &ConcreteConfig) -> Result<Self, MlError> {
        let kind: ModelKind = options
            .get_str("clf_type")
            .unwrap_or("random_forest")
            .parse()?;
        let opts: ModelOptions = options.extract()?;
        Ok(Self::new(kind, &opts))
    }

    pub fn new(kind: ModelKind, opts: &ModelOptions) -> Self {
        let forest = ForestParams {
            n_estimators: opts.n_estimators.max(1),
            max_depth: opts.max_depth,
            seed: opts.seed,
        };
        let boost = |learning_rate: f64, max_depth: usize| BoostParams {
            n_estimators: opts.n_estimators.max(1),
            learning_rate: opts.learning_rate.unwrap_or(learning_rate),
            max_depth: opts.max_depth.unwrap_or(max_depth),
            seed: opts.seed,
        };
        let linear = |max_iter: usize| LinearParams {
            max_iter: opts.max_iter.unwrap_or(max_iter).max(1),
            c: opts.c,
            seed: opts.seed,
        };
        let tree = TreeParams {
            max_depth: opts.max_depth,
            seed: opts.seed,
        };
        match kind {
            ModelKind::RandomForest => Self::RandomForest(forest),
            ModelKind::ExtraTree => Self::ExtraTree(forest),
            ModelKind::BRandomForest => Self::BRandomForest(forest),
            ModelKind::BBagging => Self::BBagging(forest),
            ModelKind::AdaBoost => Self::AdaBoost(boost(1.0, 1)),
            ModelKind::BBoosting => Self::BBoosting(boost(1.0, 1)),
            ModelKind::Xgboost => Self::Xgboost(boost(0.1, 3)),
            ModelKind::LogisticRegression => Self::LogisticRegression(linear(200)),
            ModelKind::Sgd => Self::Sgd(linear(50)),
            ModelKind::Svm => Self::Svm(linear(10)),
            ModelKind::GaussianNb => Self::GaussianNb,
            ModelKind::Mlp => Self::Mlp(MlpParams {
                layer_structure: opts.layer_structure.clone(),
                max_iter: opts.max_iter.unwrap_or(200).max(1),
                learning_rate: opts.learning_rate.unwrap_or(1e-3),
                seed: opts.seed,
            }),
            ModelKind::DecisionTree => Self::DecisionTree(tree),
            ModelKind::BDecisionTree => Self::BDecisionTree(tree),
            ModelKind::Knn => Self::Knn(KnnParams {
                n_neighbours: opts.n_neighbours.max(1),
            }),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Self::RandomForest(_) => ModelKind::RandomForest,
            Self::ExtraTree(_) => ModelKind::ExtraTree,
            Self::AdaBoost(_) => ModelKind::AdaBoost,
            Self::Xgboost(_) => ModelKind::Xgboost,
            Self::LogisticRegression(_) => ModelKind::LogisticRegression,
            Self::Sgd(_) => ModelKind::Sgd,
            Self::GaussianNb => ModelKind::GaussianNb,
            Self::Svm(_) => ModelKind::Svm,
            Self::Mlp(_) => ModelKind::Mlp,
            Self::DecisionTree(_) => ModelKind::DecisionTree,
            Self::BDecisionTree(_) => ModelKind::BDecisionTree,
            Self::Knn(_) => ModelKind::Knn,
            Self::BRandomForest(_) => ModelKind::BRandomForest,
            Self::BBagging(_) => ModelKind::BBagging,
            Self::BBoosting(_) => ModelKind::BBoosting,
        }
    }
}

/// A fitted model of any supported family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum Model {
    Tree(DecisionTree),
    Forest(Forest),
    AdaBoost(AdaBoost),
    GradientBoosting(GradientBoosting),
    Logistic(LogisticRegression),
    Sgd(SgdClassifier),
    Svm(KernelSvm),
    NaiveBayes(GaussianNb),
    Knn(Knn),
    Mlp(Mlp),
}

impl Model {
    /// Fit the model described by `config` on `x`/`y`.
    pub fn fit(config: &ModelConfig, x: &[Vec<f64>], y: &[i64]) -> Result<Self, MlError> {
        check_training(x, y)?;
        Ok(match config {
            ModelConfig::RandomForest(p) => Self::Forest(Forest::fit(ForestKind::Random, p, x, y)?),
            ModelConfig::ExtraTree(p) => Self::Forest(Forest::fit(ForestKind::Extra, p, x, y)?),
            ModelConfig::BRandomForest(p) => {
                Self::Forest(Forest::fit(ForestKind::BalancedRandom, p, x, y)?)
            }
            ModelConfig::BBagging(p) => {
                Self::Forest(Forest::fit(ForestKind::BalancedBagging, p, x, y)?)
            }
            ModelConfig::AdaBoost(p) => Self::AdaBoost(AdaBoost::fit(p, false, x, y)?),
            ModelConfig::BBoosting(p) => Self::AdaBoost(AdaBoost::fit(p, true, x, y)?),
            ModelConfig::Xgboost(p) => Self::GradientBoosting(GradientBoosting::fit(p, x, y)?),
            ModelConfig::LogisticRegression(p) => Self::Logistic(LogisticRegression::fit(p, x, y)?),
            ModelConfig::Sgd(p) => Self::Sgd(SgdClassifier::fit(p, x, y)?),
            ModelConfig::Svm(p) => Self::Svm(KernelSvm::fit(p, x, y)?),
            ModelConfig::GaussianNb => Self::NaiveBayes(GaussianNb::fit(x, y)?),
            ModelConfig::Mlp(p) => Self::Mlp(Mlp::fit(p, x, y)?),
            ModelConfig::DecisionTree(p) => Self::Tree(DecisionTree::fit(p, false, x, y)?),
            ModelConfig::BDecisionTree(p) => Self::Tree(DecisionTree::fit(p, true, x, y)?),
            ModelConfig::Knn(p) => Self::Knn(Knn::fit(p, x, y)?),
        })
    }

    pub fn as_estimator(&self) -> &dyn Estimator {
        match self {
            Self::Tree(m) => m,
            Self::Forest(m) => m,
            Self::AdaBoost(m) => m,
            Self::GradientBoosting(m) => m,
            Self::Logistic(m) => m,
            Self::Sgd(m) => m,
            Self::Svm(m) => m,
            Self::NaiveBayes(m) => m,
            Self::Knn(m) => m,
            Self::Mlp(m) => m,
        }
    }

    /// The probability capability, when this model family has one.
    pub fn as_proba(&self) -> Option<&dyn ProbabilityEstimator> {
        match self {
            Self::Tree(m) => Some(m),
            Self::Forest(m) => Some(m),
            Self::AdaBoost(m) => Some(m),
            Self::GradientBoosting(m) => Some(m),
            Self::Logistic(m) => Some(m),
            Self::NaiveBayes(m) => Some(m),
            Self::Knn(m) => Some(m),
            Self::Mlp(m) => Some(m),
            Self::Sgd(_) | Self::Svm(_) => None,
        }
    }

    pub fn classes(&self) -> &[i64] {
        self.as_estimator().classes()
    }

    pub fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        self.as_estimator().predict(x)
    }
}

/// Sorted distinct labels and each sample's index into them.
pub(crate) fn encode_labels(y: &[i64]) -> (Vec<i64>, Vec<usize>) {
    let mut classes = y.to_vec();
    classes.sort_unstable();
    classes.dedup();
    let encoded = y
        .iter()
        .map(|label| classes.partition_point(|c| c < label))
        .collect();
    (classes, encoded)
}

pub(crate) fn check_training(x: &[Vec<f64>], y: &[i64]) -> Result<usize, MlError> {
    if x.is_empty() {
        return Err(MlError::invalid_input("cannot fit a model on zero samples"));
    }
    if x.len() != y.len() {
        return Err(MlError::invalid_input(format!(
            "{} samples but {} labels",
            x.len(),
            y.len()
        )));
    }
    let dims = x[0].len();
    check_width(x, dims)?;
    Ok(dims)
}

pub(crate) fn check_width(x: &[Vec<f64>], dims: usize) -> Result<(), MlError> {
    match x.iter().position(|row| row.len() != dims) {
        Some(i) => Err(MlError::invalid_input(format!(
            "sample {i} has {} features, expected {dims}",
            x[i].len()
        ))),
        None => Ok(()),
    }
}

/// Index of the largest value; the first one wins ties.
pub(crate) fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

pub(crate) fn labels_from_scores(classes: &[i64], scores: &[Vec<f64>]) -> Vec<i64> {
    scores.iter().map(|s| classes[argmax(s)]).collect()
}

pub(crate) fn softmax_in_place(values: &mut [f64]) {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    values.iter_mut().for_each(|v| *v /= sum);
}

/// Per-class weights `n / (k * count)`, as used by class-balanced variants.
pub(crate) fn balanced_weights(encoded: &[usize], n_classes: usize) -> Vec<f64> {
    let mut counts = vec![0usize; n_classes];
    for &c in encoded {
        counts[c] += 1;
    }
    let n = encoded.len() as f64;
    encoded
        .iter()
        .map(|&c| n / (n_classes as f64 * counts[c] as f64))
        .collect()
}

/// Per-feature standardisation fitted on training data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl Standardizer {
    /// Features with zero spread are left unscaled.
    pub fn fit(x: &[Vec<f64>]) -> Self {
        let dims = x.first().map(Vec::len).unwrap_or(0);
        let n = x.len().max(1) as f64;
        let mut mean = vec![0.0; dims];
        for row in x {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v / n;
            }
        }
        let mut std = vec![0.0; dims];
        for row in x {
            for ((s, v), m) in std.iter_mut().zip(row).zip(&mean) {
                *s += (v - m).powi(2) / n;
            }
        }
        let std = std
            .into_iter()
            .map(|v| if v > 0.0 { v.sqrt() } else { 1.0 })
            .collect();
        Self { mean, std }
    }

    pub fn apply(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(&self.mean)
            .zip(&self.std)
            .map(|((v, m), s)| (v - m) / s)
            .collect()
    }

    pub fn apply_all(&self, x: &[Vec<f64>]) -> Vec<Vec<f64>> {
        x.iter().map(|row| self.apply(row)).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{accuracy, blobs};
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_aliases_resolve() {
        assert_eq!("rf".parse::<ModelKind>().unwrap(), ModelKind::RandomForest);
        assert_eq!("random_forrest".parse::<ModelKind>().unwrap(), ModelKind::RandomForest);
        assert_eq!("gradient_boosting".parse::<ModelKind>().unwrap(), ModelKind::Xgboost);
        assert_eq!("neighbours".parse::<ModelKind>().unwrap(), ModelKind::Knn);
        assert_eq!("b_tree".parse::<ModelKind>().unwrap(), ModelKind::BDecisionTree);
        for kind in ModelKind::ALL {
            assert_eq!(kind.name().parse::<ModelKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_model_names_type() {
        let options = ConcreteConfig::new().with("clf_type", "quantum_forest");
        match ModelConfig::from_options(&options) {
            Err(MlError::UnknownModel(name)) => assert_eq!(name, "quantum_forest"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_options_flow_into_payload() {
        let options = ConcreteConfig::new()
            .with("clf_type", "xgboost")
            .with("n_estimators", 10)
            .with("learning_rate", 0.3);
        let config = ModelConfig::from_options(&options).unwrap();
        assert_eq!(
            config,
            ModelConfig::Xgboost(BoostParams {
                n_estimators: 10,
                learning_rate: 0.3,
                max_depth: 3,
                seed: 0
            })
        );
        let default = ModelConfig::from_options(&ConcreteConfig::new()).unwrap();
        assert_eq!(default.kind(), ModelKind::RandomForest);
        let mlp = ModelConfig::from_options(
            &ConcreteConfig::new()
                .with("clf_type", "mlp")
                .with("layer_structure", json!([8, 4])),
        )
        .unwrap();
        assert!(matches!(mlp, ModelConfig::Mlp(p) if p.layer_structure == vec![8, 4]));
    }

    #[test]
    fn test_probability_capability_per_family() {
        let (x, y) = blobs(10);
        let opts: ModelOptions = ConcreteConfig::new()
            .with("n_estimators", 5)
            .with("max_iter", 20)
            .with("layer_structure", json!([8]))
            .extract()
            .unwrap();
        for kind in ModelKind::ALL {
            let model = Model::fit(&ModelConfig::new(kind, &opts), &x, &y).unwrap();
            let has_proba = model.as_proba().is_some();
            assert_eq!(has_proba, !matches!(kind, ModelKind::Svm | ModelKind::Sgd), "{kind}");
            assert_eq!(model.classes(), &[0, 1, 2]);
            if let Some(p) = model.as_proba() {
                for row in p.predict_proba(&x).unwrap() {
                    assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-6, "{kind}");
                }
            }
        }
    }

    #[test]
    fn test_every_family_learns_separable_blobs() {
        let (x, y) = blobs(20);
        let opts: ModelOptions = ConcreteConfig::new()
            .with("n_estimators", 20)
            .with("layer_structure", json!([16]))
            .extract()
            .unwrap();
        for kind in ModelKind::ALL {
            let config = ModelConfig::new(kind, &opts);
            let model = Model::fit(&config, &x, &y).unwrap();
            let acc = accuracy(&model.predict(&x).unwrap(), &y);
            assert!(acc >= 0.9, "{kind} accuracy {acc}");
        }
    }

    #[test]
    fn test_serde_roundtrip_preserves_predictions() {
        let (x, y) = blobs(10);
        let config = ModelConfig::from_options(
            &ConcreteConfig::new().with("clf_type", "rf").with("n_estimators", 5),
        )
        .unwrap();
        let model = Model::fit(&config, &x, &y).unwrap();
        let json = serde_json::to_string(&model).unwrap();
        let restored: Model = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.predict(&x).unwrap(), model.predict(&x).unwrap());
    }

    #[test]
    fn test_rejects_ragged_input() {
        let x = vec![vec![1.0, 2.0], vec![1.0]];
        let result = Model::fit(&ModelConfig::GaussianNb, &x, &[0, 1]);
        assert!(matches!(result, Err(MlError::InvalidInput(_))));
    }

    #[test]
    fn test_encode_labels() {
        let (classes, encoded) = encode_labels(&[5, -1, 5, 2]);
        assert_eq!(classes, vec![-1, 2, 5]);
        assert_eq!(encoded, vec![2, 0, 2, 1]);
    }
}
