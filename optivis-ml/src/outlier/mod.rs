//! Outlier candidate: interchangeable scorers sharing one contract.
//!
//! Every scorer fits on aggregated features with optional labels and scores
//! samples so that higher means more nominal. Labels other than the outlier
//! sentinel count as nominal.

pub mod detector;
pub mod distance;
pub mod isolation;
pub mod kernel;

pub use detector::{OutlierDetector, OutlierEvaluation};
pub use distance::DistanceScorer;
pub use isolation::IsolationForest;
pub use kernel::KernelDensityScorer;

use crate::dataset::OUTLIER_LABEL;
use crate::error::MlError;
use crate::grid::ConcreteConfig;
use crate::models::{
    Estimator, Forest, ForestKind, ForestParams, ModelOptions, ProbabilityEstimator,
    check_training,
};
use crate::persistence::{atomic_write_json, require_json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Label of nominal samples in binary outlier decisions.
pub const NOMINAL_LABEL: i64 = 1;

/// File of serialized scorer state (every method but `by_distance`).
pub const OUTLIER_MODEL_FILE: &str = "outlier_model.json";

/// The four-operation outlier scoring contract.
pub trait OutlierScorer: Send + Sync {
    /// Fit on `x`; `y`, when given, separates nominal rows from known outliers.
    fn fit(&mut self, x: &[Vec<f64>], y: Option<&[i64]>) -> Result<(), MlError>;

    /// One score per row; higher is more nominal.
    fn score_samples(&self, x: &[Vec<f64>]) -> Result<Vec<f64>, MlError>;

    /// Write the scorer's state into `dir`.
    fn save(&self, dir: &Path) -> Result<(), MlError>;
}

/// Outlier scoring strategy, keyed by the `method` option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierMethod {
    #[default]
    ByDistance,
    ByClassifier,
    ByIsolationForest,
    ByRandomForest,
}

impl OutlierMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ByDistance => "by_distance",
            Self::ByClassifier => "by_classifier",
            Self::ByIsolationForest => "by_isolation_forest",
            Self::ByRandomForest => "by_random_forest",
        }
    }

    /// `method` of `options`, `by_distance` when absent.
    pub fn from_options(options: &ConcreteConfig) -> Result<Self, MlError> {
        match options.get("method") {
            None => Ok(Self::default()),
            Some(Value::String(name)) => name.parse(),
            Some(other) => Err(MlError::config(format!(
                "option 'method' must name one outlier method, got {other}"
            ))),
        }
    }
}

impl fmt::Display for OutlierMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutlierMethod {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "by_distance" => Ok(Self::ByDistance),
            "by_classifier" => Ok(Self::ByClassifier),
            "by_isolation_forest" => Ok(Self::ByIsolationForest),
            "by_random_forest" => Ok(Self::ByRandomForest),
            other => Err(MlError::UnknownOutlierMethod(other.to_string())),
        }
    }
}

/// Rows of `x` that are not labelled as known outliers.
pub(crate) fn nominal_rows(x: &[Vec<f64>], y: Option<&[i64]>) -> Result<Vec<Vec<f64>>, MlError> {
    let rows: Vec<Vec<f64>> = match y {
        Some(y) => {
            check_training(x, y)?;
            x.iter()
                .zip(y)
                .filter(|(_, l)| **l != OUTLIER_LABEL)
                .map(|(row, _)| row.clone())
                .collect()
        }
        None => x.to_vec(),
    };
    if rows.is_empty() {
        return Err(MlError::invalid_input("no nominal samples to fit on"));
    }
    Ok(rows)
}

/// Map every label but the outlier sentinel to [`NOMINAL_LABEL`].
pub fn binarize(labels: &[i64]) -> Vec<i64> {
    labels
        .iter()
        .map(|l| if *l == OUTLIER_LABEL { OUTLIER_LABEL } else { NOMINAL_LABEL })
        .collect()
}

pub(crate) fn save_model<T: Serialize>(dir: &Path, model: &T) -> Result<(), MlError> {
    atomic_write_json(&dir.join(OUTLIER_MODEL_FILE), model)?;
    Ok(())
}

/// Supervised forest over the given labels.
///
/// Known outliers, when present, form their own class. A sample scores the
/// highest probability the forest assigns to any nominal class, so both
/// unfamiliar and outlier-like samples score low.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestScorer {
    params: ForestParams,
    forest: Option<Forest>,
}

impl ForestScorer {
    pub fn new(params: ForestParams) -> Self {
        Self {
            params,
            forest: None,
        }
    }
}

impl OutlierScorer for ForestScorer {
    fn fit(&mut self, x: &[Vec<f64>], y: Option<&[i64]>) -> Result<(), MlError> {
        let y = y.ok_or_else(|| {
            MlError::invalid_input("by_random_forest needs labelled training data")
        })?;
        if y.iter().all(|l| *l == OUTLIER_LABEL) {
            return Err(MlError::invalid_input("no nominal samples to fit on"));
        }
        self.forest = Some(Forest::fit(ForestKind::Random, &self.params, x, y)?);
        Ok(())
    }

    fn score_samples(&self, x: &[Vec<f64>]) -> Result<Vec<f64>, MlError> {
        let forest = self
            .forest
            .as_ref()
            .ok_or_else(|| MlError::not_fitted("random forest outlier scorer"))?;
        let nominal: Vec<usize> = forest
            .classes()
            .iter()
            .enumerate()
            .filter(|(_, c)| **c != OUTLIER_LABEL)
            .map(|(i, _)| i)
            .collect();
        Ok(forest
            .predict_proba(x)?
            .into_iter()
            .map(|p| nominal.iter().map(|&i| p[i]).fold(0.0, f64::max))
            .collect())
    }

    fn save(&self, dir: &Path) -> Result<(), MlError> {
        save_model(dir, self)
    }
}

/// A scorer of any supported method.
#[derive(Debug, Clone)]
pub enum OutlierModel {
    Distance(DistanceScorer),
    Kernel(KernelDensityScorer),
    Isolation(IsolationForest),
    Forest(ForestScorer),
}

impl OutlierModel {
    /// Unfitted scorer for `method`, parameterised by the model options.
    pub fn new(method: OutlierMethod, options: &ConcreteConfig) -> Result<Self, MlError> {
        let opts: ModelOptions = options.extract()?;
        Ok(match method {
            OutlierMethod::ByDistance => Self::Distance(DistanceScorer::new()),
            OutlierMethod::ByClassifier => Self::Kernel(KernelDensityScorer::new()),
            OutlierMethod::ByIsolationForest => {
                Self::Isolation(IsolationForest::new(opts.n_estimators, opts.seed))
            }
            OutlierMethod::ByRandomForest => Self::Forest(ForestScorer::new(ForestParams {
                n_estimators: opts.n_estimators.max(1),
                max_depth: opts.max_depth,
                seed: opts.seed,
            })),
        })
    }

    pub fn method(&self) -> OutlierMethod {
        match self {
            Self::Distance(_) => OutlierMethod::ByDistance,
            Self::Kernel(_) => OutlierMethod::ByClassifier,
            Self::Isolation(_) => OutlierMethod::ByIsolationForest,
            Self::Forest(_) => OutlierMethod::ByRandomForest,
        }
    }

    pub fn as_scorer(&self) -> &dyn OutlierScorer {
        match self {
            Self::Distance(s) => s,
            Self::Kernel(s) => s,
            Self::Isolation(s) => s,
            Self::Forest(s) => s,
        }
    }

    pub fn as_scorer_mut(&mut self) -> &mut dyn OutlierScorer {
        match self {
            Self::Distance(s) => s,
            Self::Kernel(s) => s,
            Self::Isolation(s) => s,
            Self::Forest(s) => s,
        }
    }

    pub fn load(method: OutlierMethod, dir: &Path) -> Result<Self, MlError> {
        let path = dir.join(OUTLIER_MODEL_FILE);
        Ok(match method {
            OutlierMethod::ByDistance => Self::Distance(DistanceScorer::load(dir)?),
            OutlierMethod::ByClassifier => Self::Kernel(require_json(&path)?),
            OutlierMethod::ByIsolationForest => Self::Isolation(require_json(&path)?),
            OutlierMethod::ByRandomForest => Self::Forest(require_json(&path)?),
        })
    }
}
