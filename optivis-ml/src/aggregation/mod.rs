//! Aggregation stage.
//!
//! Reduces the variable number of descriptor rows of each tag to one
//! fixed-length vector. Learned aggregators fit a visual-word codebook on the
//! training split only; global aggregators pool without any learned state.

pub mod codebook;

pub use codebook::Codebook;

use crate::error::MlError;
use crate::features::FeatureMatrix;
use crate::grid::ConcreteConfig;
use crate::persistence::{atomic_write_json, require_json};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// File holding the aggregator configuration and learned state.
pub const AGGREGATOR_FILE: &str = "aggregator.json";

const DEFAULT_COMPLEXITY: usize = 128;

/// Seed of the codebook fit, fixed so refits on the same data agree.
const CODEBOOK_SEED: u64 = 0x0b0e;

/// One aggregated vector per tag; `None` when the tag had no features.
pub type Representations = Vec<Option<Vec<f64>>>;

/// Aggregator kind with its typed parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "aggregator", rename_all = "snake_case")]
pub enum AggregatorConfig {
    /// Normalised histogram over `complexity` visual words.
    BagOfWords { complexity: usize },
    /// Per-word residual sums, power and L2 normalised.
    Vlad { complexity: usize },
    GlobalAvg,
    GlobalMax,
}

impl AggregatorConfig {
    /// Read `aggregator` and `complexity` from a concrete configuration.
    pub fn from_options(options: &ConcreteConfig) -> Result<Self, MlError> {
        let name = options.get_str("aggregator").unwrap_or("bag_of_words");
        let complexity = match options.get("complexity") {
            None => DEFAULT_COMPLEXITY,
            Some(value) => value
                .as_u64()
                .filter(|c| *c > 0)
                .map(|c| c as usize)
                .ok_or_else(|| {
                    MlError::config(format!("complexity must be a positive integer, got {value}"))
                })?,
        };
        Ok(match name.parse::<AggregatorKind>()? {
            AggregatorKind::BagOfWords => Self::BagOfWords { complexity },
            AggregatorKind::Vlad => Self::Vlad { complexity },
            AggregatorKind::GlobalAvg => Self::GlobalAvg,
            AggregatorKind::GlobalMax => Self::GlobalMax,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BagOfWords { .. } => "bag_of_words",
            Self::Vlad { .. } => "vlad",
            Self::GlobalAvg => "global_avg",
            Self::GlobalMax => "global_max",
        }
    }

    /// Whether this aggregator learns state from the training split.
    pub fn is_learned(&self) -> bool {
        matches!(self, Self::BagOfWords { .. } | Self::Vlad { .. })
    }

    fn complexity(&self) -> Option<usize> {
        match self {
            Self::BagOfWords { complexity } | Self::Vlad { complexity } => Some(*complexity),
            Self::GlobalAvg | Self::GlobalMax => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregatorKind {
    BagOfWords,
    Vlad,
    GlobalAvg,
    GlobalMax,
}

impl FromStr for AggregatorKind {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bag_of_words" | "bow" => Ok(Self::BagOfWords),
            "vlad" => Ok(Self::Vlad),
            "global_avg" => Ok(Self::GlobalAvg),
            "global_max" => Ok(Self::GlobalMax),
            other => Err(MlError::UnknownAggregator(other.to_string())),
        }
    }
}

/// Aggregator instance with its learned state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregator {
    config: AggregatorConfig,
    #[serde(default)]
    codebook: Option<Codebook>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            codebook: None,
        }
    }

    pub fn from_options(options: &ConcreteConfig) -> Result<Self, MlError> {
        Ok(Self::new(AggregatorConfig::from_options(options)?))
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        !self.config.is_learned() || self.codebook.is_some()
    }

    pub fn describe(&self) -> String {
        match self.config.complexity() {
            Some(c) => format!("{}(complexity={c})", self.config.name()),
            None => self.config.name().to_string(),
        }
    }

    /// Learn state from `train` and aggregate it.
    ///
    /// Fails with [`MlError::NoFeatures`] when no tag has any feature rows.
    pub fn fit_transform(
        &mut self,
        train: &[Option<FeatureMatrix>],
    ) -> Result<Representations, MlError> {
        let rows: Vec<&[f64]> = train
            .iter()
            .flatten()
            .flat_map(|m| m.iter().map(|r| r.as_slice()))
            .collect();
        if rows.is_empty() {
            return Err(MlError::NoFeatures(format!(
                "none of the {} training tags has features to aggregate",
                train.len()
            )));
        }
        if let Some(complexity) = self.config.complexity() {
            let codebook = Codebook::fit(&rows, complexity, CODEBOOK_SEED);
            tracing::debug!(
                aggregator = self.config.name(),
                words = codebook.len(),
                rows = rows.len(),
                "Fitted codebook"
            );
            self.codebook = Some(codebook);
        }
        self.transform(train)
    }

    /// Aggregate `features` with the learned state, leaving it untouched.
    pub fn transform(&self, features: &[Option<FeatureMatrix>]) -> Result<Representations, MlError> {
        features
            .iter()
            .map(|f| match f {
                Some(rows) if !rows.is_empty() => self.aggregate(rows).map(Some),
                _ => Ok(None),
            })
            .collect()
    }

    /// Aggregate the rows of a single tag.
    pub fn aggregate(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, MlError> {
        match self.config {
            AggregatorConfig::GlobalAvg => Ok(global_avg(rows)),
            AggregatorConfig::GlobalMax => Ok(global_max(rows)),
            AggregatorConfig::BagOfWords { .. } => Ok(bag_of_words(self.codebook()?, rows)),
            AggregatorConfig::Vlad { .. } => vlad(self.codebook()?, rows),
        }
    }

    fn codebook(&self) -> Result<&Codebook, MlError> {
        self.codebook
            .as_ref()
            .ok_or_else(|| MlError::not_fitted(format!("{} has no codebook", self.config.name())))
    }

    pub fn save(&self, dir: &Path) -> Result<(), MlError> {
        atomic_write_json(&dir.join(AGGREGATOR_FILE), self)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self, MlError> {
        require_json(&dir.join(AGGREGATOR_FILE))
    }
}

fn global_avg(rows: &[Vec<f64>]) -> Vec<f64> {
    let dims = rows[0].len();
    let mut out = vec![0.0; dims];
    for row in rows {
        for (o, v) in out.iter_mut().zip(row) {
            *o += v;
        }
    }
    let n = rows.len() as f64;
    out.iter_mut().for_each(|o| *o /= n);
    out
}

fn global_max(rows: &[Vec<f64>]) -> Vec<f64> {
    let mut out = rows[0].clone();
    for row in &rows[1..] {
        for (o, v) in out.iter_mut().zip(row) {
            *o = o.max(*v);
        }
    }
    out
}

fn bag_of_words(codebook: &Codebook, rows: &[Vec<f64>]) -> Vec<f64> {
    let mut histogram = vec![0.0; codebook.len()];
    for row in rows {
        histogram[codebook.nearest(row).0] += 1.0;
    }
    let n = rows.len() as f64;
    histogram.iter_mut().for_each(|h| *h /= n);
    histogram
}

fn vlad(codebook: &Codebook, rows: &[Vec<f64>]) -> Result<Vec<f64>, MlError> {
    let dims = codebook.centers.first().map(Vec::len).unwrap_or(0);
    let mut out = vec![0.0; codebook.len() * dims];
    for row in rows {
        if row.len() != dims {
            return Err(MlError::aggregation(format!(
                "feature width {} does not match codebook width {dims}",
                row.len()
            )));
        }
        let (word, _) = codebook.nearest(row);
        let center = &codebook.centers[word];
        for (d, (v, c)) in row.iter().zip(center).enumerate() {
            out[word * dims + d] += v - c;
        }
    }
    out.iter_mut().for_each(|v| *v = v.signum() * v.abs().sqrt());
    let norm = out.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        out.iter_mut().for_each(|v| *v /= norm);
    }
    Ok(out)
}

/// Rows and labels of the tags that have a representation.
///
/// Fails with [`MlError::NoFeatures`] when every tag is missing one.
pub fn stack_present(
    representations: &[Option<Vec<f64>>],
    labels: &[i64],
) -> Result<(Vec<Vec<f64>>, Vec<i64>), MlError> {
    let (x, y): (Vec<Vec<f64>>, Vec<i64>) = representations
        .iter()
        .zip(labels)
        .filter_map(|(r, y)| r.as_ref().map(|r| (r.clone(), *y)))
        .unzip();
    if x.is_empty() && !labels.is_empty() {
        return Err(MlError::NoFeatures(format!(
            "all {} tags yielded no representation",
            labels.len()
        )));
    }
    let dropped = labels.len() - x.len();
    if dropped > 0 {
        tracing::debug!(dropped, "Dropped tags without representation");
    }
    Ok((x, y))
}
