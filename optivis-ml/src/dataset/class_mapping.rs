//! Bijection between class names and integer label ids.

use crate::error::MlError;
use crate::persistence::{atomic_write_json, require_json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Reserved label for known anomalous samples.
pub const OUTLIER_LABEL: i64 = -1;

/// Class name to label id mapping, persisted as `class_mapping.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassMapping(BTreeMap<String, i64>);

impl ClassMapping {
    /// Build a mapping, rejecting duplicate ids and the outlier sentinel.
    pub fn new<I, S>(pairs: I) -> Result<Self, MlError>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let map: BTreeMap<String, i64> = pairs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let mapping = Self(map);
        mapping.validate()?;
        Ok(mapping)
    }

    fn validate(&self) -> Result<(), MlError> {
        let mut seen = std::collections::BTreeSet::new();
        for (name, id) in &self.0 {
            if *id == OUTLIER_LABEL {
                return Err(MlError::config(format!(
                    "class '{name}' uses the reserved outlier id {OUTLIER_LABEL}"
                )));
            }
            if !seen.insert(*id) {
                return Err(MlError::config(format!("class id {id} is assigned twice")));
            }
        }
        Ok(())
    }

    pub fn id(&self, name: &str) -> Option<i64> {
        self.0.get(name).copied()
    }

    pub fn name(&self, id: i64) -> Option<&str> {
        self.0
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.as_str())
    }

    /// Label ids in ascending order.
    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.0.values().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `label` is a class id or the outlier sentinel.
    pub fn accepts(&self, label: i64) -> bool {
        label == OUTLIER_LABEL || self.0.values().any(|v| *v == label)
    }

    /// Display name of a label, falling back to the numeric id.
    pub fn display(&self, label: i64) -> String {
        match self.name(label) {
            Some(name) => name.to_string(),
            None if label == OUTLIER_LABEL => "outlier".to_string(),
            None => label.to_string(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, MlError> {
        let mapping: Self = require_json(path)?;
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn save(&self, path: &Path) -> Result<(), MlError> {
        atomic_write_json(path, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lookup_both_directions() {
        let mapping = ClassMapping::new([("cat", 0), ("dog", 1)]).unwrap();
        assert_eq!(mapping.id("dog"), Some(1));
        assert_eq!(mapping.name(0), Some("cat"));
        assert!(mapping.accepts(OUTLIER_LABEL));
        assert!(!mapping.accepts(7));
        assert_eq!(mapping.display(-1), "outlier");
    }

    #[test]
    fn test_rejects_duplicate_and_reserved_ids() {
        assert!(ClassMapping::new([("a", 0), ("b", 0)]).is_err());
        assert!(ClassMapping::new([("a", OUTLIER_LABEL)]).is_err());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("class_mapping.json");
        let mapping = ClassMapping::new([("cat", 0), ("dog", 1)]).unwrap();
        mapping.save(&path).unwrap();
        assert_eq!(ClassMapping::load(&path).unwrap(), mapping);
    }
}
