//! Error types for the optivis-ml crate.

use thiserror::Error;

/// Top-level error type for pipeline search operations.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Feature extraction error: {0}")]
    Feature(String),

    #[error("Aggregation error: {0}")]
    Aggregation(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown model type: {0}")]
    UnknownModel(String),

    #[error("Unknown aggregator: {0}")]
    UnknownAggregator(String),

    #[error("Unknown descriptor: {0}")]
    UnknownDescriptor(String),

    #[error("Unknown sampling method: {0}")]
    UnknownSamplingMethod(String),

    #[error("Unknown split mode: {0}")]
    UnknownSplitMode(String),

    #[error("Unknown outlier method: {0}")]
    UnknownOutlierMethod(String),

    #[error("Not fitted: {0}")]
    NotFitted(String),

    #[error("No features: {0}")]
    NoFeatures(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),
}

impl MlError {
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn feature(msg: impl Into<String>) -> Self {
        Self::Feature(msg.into())
    }

    pub fn aggregation(msg: impl Into<String>) -> Self {
        Self::Aggregation(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn search(msg: impl Into<String>) -> Self {
        Self::Search(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_fitted(msg: impl Into<String>) -> Self {
        Self::NotFitted(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
