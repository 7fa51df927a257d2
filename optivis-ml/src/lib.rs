//! # optivis-ml
//!
//! Automated search over hand-crafted image-classification and
//! outlier-detection pipelines.
//!
//! A search expands a declarative [`Configuration`] tier by tier:
//!
//! 1. **Features**: descriptors sampled on key regions of each tag, extracted
//!    once per feature-tier point.
//! 2. **Aggregation**: a fixed-length representation per tag, learned on the
//!    training split only.
//! 3. **Model**: a classifier ranked by macro-F1, or an outlier scorer ranked
//!    by AUROC.
//!
//! The best pipeline found so far is checkpointed atomically after every
//! improvement, so an interrupted search always leaves a loadable model
//! folder behind.

pub mod aggregation;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod grid;
pub mod hyper_search;
pub mod metrics;
pub mod models;
pub mod outlier;
pub mod persistence;
pub mod pipeline;
pub mod search;

pub use aggregation::{Aggregator, AggregatorConfig};
pub use classifier::{Classifier, Evaluation};
pub use config::{RunConfig, Settings, load_settings};
pub use dataset::{
    ClassFilter, ClassMapping, ImageFolderDataset, MemoryTag, OUTLIER_LABEL, SplitMode,
    SplitPolicy, Tag, TagRef, TagType,
};
pub use error::MlError;
pub use features::{FeatureCache, FeatureConfig, FeatureExtractor};
pub use grid::{ConcreteConfig, Configuration, Tier};
pub use models::{Model, ModelConfig, ModelKind};
pub use outlier::{OutlierDetector, OutlierEvaluation, OutlierMethod};
pub use pipeline::ImagePipeline;
pub use search::{OutlierSearch, SearchSummary, SupervisedSearch, TieBreak};
