//! Feature extraction stage: resize, sample key regions, describe them.

use super::FeatureMatrix;
use super::cache::FeatureCache;
use super::descriptors::{DescriptorCapability, DescriptorSpec};
use super::plane::gray;
use super::resize::ImageSize;
use super::sampling::{KeyPointSet, SamplingMethod, validate_sampling};
use crate::dataset::TagRef;
use crate::error::MlError;
use crate::grid::ConcreteConfig;
use crate::persistence::{atomic_write_json, require_json};
use image::DynamicImage;
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

/// Resolved feature configuration inside a model folder.
pub const FEATURE_EXTRACTOR_FILE: &str = "feature_extractor.json";

/// Resolved feature options, as persisted in `feature_extractor.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Descriptor names; several are concatenated column-wise.
    #[serde(default, deserialize_with = "one_or_many")]
    pub feature: Vec<String>,
    #[serde(default = "default_sampling_method")]
    pub sampling_method: String,
    #[serde(default = "default_sampling_size")]
    pub sampling_step: u32,
    #[serde(default = "default_sampling_size")]
    pub sampling_window: u32,
    #[serde(default)]
    pub image_size: ImageSize,
    #[serde(default = "default_normalize")]
    pub normalize: bool,
}

fn default_sampling_method() -> String {
    "dense".to_string()
}

fn default_sampling_size() -> u32 {
    20
}

fn default_normalize() -> bool {
    true
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl FeatureConfig {
    pub fn from_options(options: &ConcreteConfig) -> Result<Self, MlError> {
        options.extract()
    }
}

/// Raw features and labels of a tag batch, index-aligned with the tags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabeledFeatures {
    pub features: Vec<Option<FeatureMatrix>>,
    pub labels: Vec<i64>,
}

impl LabeledFeatures {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of tags without any feature rows.
    pub fn missing(&self) -> usize {
        self.features.iter().filter(|f| f.is_none()).count()
    }
}

/// Extracts raw per-tag feature matrices for one feature configuration.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    config: FeatureConfig,
    descriptors: Vec<DescriptorSpec>,
    keypoints: KeyPointSet,
    cache: Option<FeatureCache>,
}

impl FeatureExtractor {
    /// Validate `config`, coercing an incompatible sampling method.
    pub fn new(mut config: FeatureConfig) -> Result<Self, MlError> {
        if config.feature.is_empty() {
            return Err(MlError::config("option 'feature' names no descriptor"));
        }
        let descriptors = config
            .feature
            .iter()
            .map(|name| name.parse::<DescriptorSpec>())
            .collect::<Result<Vec<_>, _>>()?;
        let requested: SamplingMethod = config.sampling_method.parse()?;
        let method = validate_sampling(requested, &descriptors);
        config.sampling_method = method.name().to_string();

        Ok(Self {
            keypoints: KeyPointSet::new(method, config.sampling_step, config.sampling_window),
            config,
            descriptors,
            cache: None,
        })
    }

    pub fn from_options(options: &ConcreteConfig) -> Result<Self, MlError> {
        Self::new(FeatureConfig::from_options(options)?)
    }

    pub fn with_cache(mut self, cache: FeatureCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The resolved configuration, with any sampling coercion applied.
    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Persist the resolved configuration; the cache location is not saved.
    pub fn save(&self, dir: &Path) -> Result<(), MlError> {
        atomic_write_json(&dir.join(FEATURE_EXTRACTOR_FILE), &self.config)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self, MlError> {
        Self::new(require_json(&dir.join(FEATURE_EXTRACTOR_FILE))?)
    }

    pub fn sampling_method(&self) -> SamplingMethod {
        self.keypoints.method
    }

    pub fn describe_sampling(&self) -> String {
        let features = self.config.feature.join(",");
        let size = self.config.image_size.describe();
        match self.keypoints.method {
            SamplingMethod::Dense => format!(
                "[{features}] - IMG:{size} DENSE: W:{}/S:{}",
                self.keypoints.window, self.keypoints.step
            ),
            method => format!("[{features}] - IMG:{size} - {method}"),
        }
    }

    /// Features of one decoded image, `None` when no descriptor yields rows.
    pub fn extract_x(&self, image: &DynamicImage) -> Result<Option<FeatureMatrix>, MlError> {
        let image = self.config.image_size.apply(image);
        let keypoints = self.keypoints.sample(&gray(&image));

        let mut blocks: Vec<FeatureMatrix> = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            let Some(mut rows) = descriptor.compute(&image, &keypoints) else {
                continue;
            };
            if self.config.normalize {
                rows.iter_mut().for_each(|r| l2_normalize(r));
            }
            blocks.push(rows);
        }

        let Some(first) = blocks.first() else {
            return Ok(None);
        };
        let n_rows = first.len();
        if blocks.iter().any(|b| b.len() != n_rows) {
            return Err(MlError::feature(
                "descriptors returned different row counts for the same key points",
            ));
        }
        let mut x: FeatureMatrix = vec![Vec::new(); n_rows];
        for block in blocks {
            for (row, part) in x.iter_mut().zip(block) {
                row.extend(part);
            }
        }
        Ok(Some(x))
    }

    fn extract_tag(&self, tag: &TagRef) -> Result<Option<FeatureMatrix>, MlError> {
        let key = match &self.cache {
            Some(cache) => {
                let key = FeatureCache::key(&self.config, &tag.id())?;
                if let Some(hit) = cache.get(&key)? {
                    return Ok(hit);
                }
                Some(key)
            }
            None => None,
        };

        let x = self.extract_x(&tag.load_data()?)?;
        if x.is_none() {
            tracing::debug!(tag = %tag.id(), "No features for tag");
        }
        if let (Some(cache), Some(key)) = (&self.cache, key) {
            cache.put(&key, &x)?;
        }
        Ok(x)
    }

    /// Features and labels for every tag, in tag order.
    ///
    /// Tags are processed on `pool`; results are reassembled by tag index.
    pub fn extract_trainings_data(
        &self,
        tags: &[TagRef],
        pool: &ThreadPool,
    ) -> Result<LabeledFeatures, MlError> {
        tracing::info!(
            tags = tags.len(),
            "Extracting features: {}",
            self.describe_sampling()
        );
        let features = pool.install(|| {
            tags.par_iter()
                .map(|tag| self.extract_tag(tag))
                .collect::<Result<Vec<_>, MlError>>()
        })?;
        let labels = tags.iter().map(|t| t.load_y()).collect();

        let out = LabeledFeatures { features, labels };
        if out.missing() > 0 {
            tracing::warn!(
                missing = out.missing(),
                total = out.len(),
                "Some tags produced no features"
            );
        }
        Ok(out)
    }
}

fn l2_normalize(row: &mut [f64]) {
    let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        row.iter_mut().for_each(|v| *v /= norm);
    }
}
