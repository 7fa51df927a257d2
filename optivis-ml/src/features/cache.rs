//! On-disk cache of raw per-tag features.
//!
//! Entries are keyed by a SHA-256 over the resolved feature configuration and
//! the tag id, so changing any extraction option invalidates the entry.

use super::FeatureMatrix;
use crate::error::MlError;
use crate::persistence::{atomic_write_json, load_json};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Default cache folder name inside the working directory.
pub const CACHE_DIR: &str = "_cache";

/// Feature cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct FeatureCache {
    dir: PathBuf,
}

impl FeatureCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache key for `tag_id` under `config`.
    pub fn key<C: Serialize>(config: &C, tag_id: &str) -> Result<String, MlError> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(config)?);
        hasher.update(b"\n");
        hasher.update(tag_id.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Cached features, `Some(None)` for a cached empty result.
    pub fn get(&self, key: &str) -> Result<Option<Option<FeatureMatrix>>, MlError> {
        Ok(load_json(&self.path(key))?)
    }

    pub fn put(&self, key: &str, features: &Option<FeatureMatrix>) -> Result<(), MlError> {
        atomic_write_json(&self.path(key), features)?;
        Ok(())
    }
}
