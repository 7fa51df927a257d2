//! Feature extraction stage and its built-in descriptor capability.

pub mod cache;
pub mod descriptors;
pub mod extractor;
pub mod plane;
pub mod resize;
pub mod sampling;

/// Raw features of one tag: one row per sampled region.
pub type FeatureMatrix = Vec<Vec<f64>>;

pub use cache::{CACHE_DIR, FeatureCache};
pub use descriptors::{DescriptorCapability, DescriptorKind, DescriptorSpec};
pub use extractor::{FEATURE_EXTRACTOR_FILE, FeatureConfig, FeatureExtractor, LabeledFeatures};
pub use plane::ColorSpace;
pub use resize::ImageSize;
pub use sampling::{KeyPoint, KeyPointSet, SamplingMethod, validate_sampling};
