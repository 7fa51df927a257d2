//! Configuration grid expansion.
//!
//! A [`Configuration`] maps option names to either a single value or a list of
//! candidate values. Expansion wraps scalars of the searchable options into
//! one-element lists and takes the cartesian product over those options only;
//! every other option is copied unchanged into each [`ConcreteConfig`].
//!
//! Expansion is tiered. The feature tier is expanded first and the aggregator
//! and model tiers are expanded per outer point, so the full space is never
//! materialized flat and raw features can be reused across inner tiers.
//!
//! Values are not validated here; the stage consuming an option rejects
//! values it does not understand.

use crate::error::MlError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Options that select how raw features are extracted.
pub const FEATURE_OPTIONS: &[&str] = &[
    "feature",
    "sampling_method",
    "sampling_step",
    "sampling_window",
    "image_size",
];

/// Options that select the aggregation of raw features.
pub const AGGREGATOR_OPTIONS: &[&str] = &["aggregator", "complexity"];

/// Options that select the statistical model.
pub const MODEL_OPTIONS: &[&str] = &["clf_type"];

/// Aggregators with this prefix pool globally and have no hyperparameters.
pub const GLOBAL_AGGREGATOR_PREFIX: &str = "global_";

/// One tier of the nested search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Feature,
    Aggregator,
    Model,
}

impl Tier {
    pub fn options(&self) -> &'static [&'static str] {
        match self {
            Self::Feature => FEATURE_OPTIONS,
            Self::Aggregator => AGGREGATOR_OPTIONS,
            Self::Model => MODEL_OPTIONS,
        }
    }
}

/// Declarative search configuration: option name to scalar or candidate list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(BTreeMap<String, Value>);

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Insert `value` only when `key` is absent.
    pub fn set_default(&mut self, key: &str, value: impl Into<Value>) {
        self.0.entry(key.to_string()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Candidate values of `key`: a list as-is, a scalar wrapped, absent empty.
    pub fn candidates(&self, key: &str) -> Vec<Value> {
        match self.0.get(key) {
            Some(Value::Array(values)) => values.clone(),
            Some(value) => vec![value.clone()],
            None => Vec::new(),
        }
    }

    /// Wrap every scalar among `searchable` into a one-element list.
    pub fn normalized(&self, searchable: &[&str]) -> Self {
        let mut out = self.clone();
        for key in searchable {
            if let Some(value) = out.0.get_mut(*key) {
                if !value.is_array() {
                    *value = Value::Array(vec![value.clone()]);
                }
            }
        }
        out
    }

    /// Number of points the cartesian product over `searchable` yields.
    pub fn grid_size(&self, searchable: &[&str]) -> usize {
        searchable
            .iter()
            .filter(|k| self.contains(k))
            .map(|k| self.candidates(k).len())
            .product()
    }

    /// Cartesian product over the `searchable` options present.
    ///
    /// The first searchable option varies slowest. Options outside the
    /// product are copied unchanged.
    pub fn expand(&self, searchable: &[&str]) -> Vec<ConcreteConfig> {
        let mut configs = vec![ConcreteConfig(self.0.clone())];
        for key in searchable {
            if !self.contains(key) {
                continue;
            }
            let values = self.candidates(key);
            let mut next = Vec::with_capacity(configs.len() * values.len());
            for config in &configs {
                for value in &values {
                    let mut c = config.clone();
                    c.insert(key, value.clone());
                    next.push(c);
                }
            }
            configs = next;
        }
        configs
    }

    /// Expand only the options of `tier`.
    pub fn expand_tier(&self, tier: Tier) -> Vec<ConcreteConfig> {
        self.expand(tier.options())
    }

    /// Aggregator-tier expansion that keeps global pooling out of the sweep.
    ///
    /// Learned aggregators are crossed with every `complexity` candidate;
    /// each global aggregator contributes exactly one config without a
    /// complexity value.
    pub fn expand_aggregators(&self) -> Vec<ConcreteConfig> {
        if !self.contains("aggregator") {
            return self.expand(AGGREGATOR_OPTIONS);
        }
        let (global, learned): (Vec<Value>, Vec<Value>) = self
            .candidates("aggregator")
            .into_iter()
            .partition(is_global_aggregator);

        let mut configs = Vec::new();
        if !learned.is_empty() {
            let mut sweep = self.clone();
            sweep.insert("aggregator", Value::Array(learned));
            configs.extend(sweep.expand(AGGREGATOR_OPTIONS));
        }
        for aggregator in global {
            let mut c = ConcreteConfig(self.0.clone());
            c.insert("aggregator", aggregator);
            c.remove("complexity");
            configs.push(c);
        }
        configs
    }
}

impl From<BTreeMap<String, Value>> for Configuration {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl From<ConcreteConfig> for Configuration {
    fn from(config: ConcreteConfig) -> Self {
        Self(config.0)
    }
}

fn is_global_aggregator(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.starts_with(GLOBAL_AGGREGATOR_PREFIX))
}

/// One point of the search space: every option holds exactly one value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcreteConfig(BTreeMap<String, Value>);

impl ConcreteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Copy the `keys` of `other` over this config.
    pub fn overlay(&mut self, other: &ConcreteConfig, keys: &[&str]) {
        for key in keys {
            match other.get(key) {
                Some(value) => self.insert(key, value.clone()),
                None => {
                    self.remove(key);
                }
            }
        }
    }

    /// Deserialize a typed view of this config.
    ///
    /// Unknown options are ignored, so each stage picks out only its fields.
    pub fn extract<T: DeserializeOwned>(&self) -> Result<T, MlError> {
        let map: serde_json::Map<String, Value> =
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::from_value(Value::Object(map)).map_err(|e| MlError::config(e.to_string()))
    }

    /// Options whose chosen value differs from the initial configuration.
    ///
    /// Returns `(option, initial, chosen)` for every `key` the initial
    /// configuration declared.
    pub fn deltas(&self, initial: &Configuration, keys: &[&str]) -> Vec<(String, Value, Value)> {
        keys.iter()
            .filter_map(|key| {
                let before = initial.get(key)?;
                let after = self.get(key)?;
                Some((key.to_string(), before.clone(), after.clone()))
            })
            .collect()
    }

    /// Compact `k=v` rendering of the selected keys, for log lines.
    pub fn describe(&self, keys: &[&str]) -> String {
        keys.iter()
            .filter_map(|k| self.get(k).map(|v| format!("{k}={v}")))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for ConcreteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> Configuration {
        Configuration::new()
            .with("feature", json!(["hsv-sift", "gray-sift"]))
            .with("sampling_method", "dense")
            .with("aggregator", json!(["bag_of_words", "vlad"]))
            .with("complexity", json!([64, 128]))
            .with("clf_type", json!(["rf", "svm"]))
            .with("n_estimators", 50)
    }

    #[test]
    fn test_tiered_expansion_size() {
        let config = sample();
        let mut total = 0;
        for feature in config.expand_tier(Tier::Feature) {
            let inner = Configuration::from(feature);
            for aggregator in inner.expand_aggregators() {
                total += Configuration::from(aggregator).expand_tier(Tier::Model).len();
            }
        }
        assert_eq!(total, 16);
    }

    #[test]
    fn test_scalar_wrapped_and_passthrough_kept() {
        let config = sample();
        let normalized = config.normalized(FEATURE_OPTIONS);
        assert_eq!(normalized.get("sampling_method"), Some(&json!(["dense"])));
        // Non-searchable options pass through unchanged.
        assert_eq!(normalized.get("n_estimators"), Some(&json!(50)));

        let points = config.expand(FEATURE_OPTIONS);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].get_str("feature"), Some("hsv-sift"));
        assert_eq!(points[1].get_str("feature"), Some("gray-sift"));
        assert!(points.iter().all(|p| p.get("n_estimators") == Some(&json!(50))));
        // Lists of non-searched options are copied, not expanded.
        assert_eq!(points[0].get("clf_type"), Some(&json!(["rf", "svm"])));
    }

    #[test]
    fn test_first_option_varies_slowest() {
        let config = Configuration::new()
            .with("aggregator", json!(["a", "b"]))
            .with("complexity", json!([1, 2]));
        let points: Vec<String> = config
            .expand(AGGREGATOR_OPTIONS)
            .iter()
            .map(|c| c.describe(AGGREGATOR_OPTIONS))
            .collect();
        assert_eq!(
            points,
            vec![
                "aggregator=\"a\" complexity=1",
                "aggregator=\"a\" complexity=2",
                "aggregator=\"b\" complexity=1",
                "aggregator=\"b\" complexity=2",
            ]
        );
    }

    #[test]
    fn test_global_aggregators_are_singletons() {
        let config = Configuration::new()
            .with("aggregator", json!(["bag_of_words", "global_avg", "global_max"]))
            .with("complexity", json!([32, 64, 128]));
        let points = config.expand_aggregators();
        assert_eq!(points.len(), 3 + 2);
        let globals: Vec<_> = points
            .iter()
            .filter(|p| p.get_str("aggregator").unwrap().starts_with("global_"))
            .collect();
        assert_eq!(globals.len(), 2);
        assert!(globals.iter().all(|p| p.get("complexity").is_none()));
    }

    #[test]
    fn test_grid_size_matches_expansion() {
        let config = sample();
        assert_eq!(config.grid_size(FEATURE_OPTIONS), 2);
        assert_eq!(config.grid_size(AGGREGATOR_OPTIONS), 4);
        assert_eq!(config.expand(AGGREGATOR_OPTIONS).len(), 4);
    }

    #[test]
    fn test_missing_options_yield_single_point() {
        let config = Configuration::new().with("n_estimators", 10);
        let points = config.expand(FEATURE_OPTIONS);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].get("n_estimators"), Some(&json!(10)));
    }

    #[test]
    fn test_extract_ignores_unrelated_options() {
        #[derive(Deserialize)]
        struct Part {
            complexity: usize,
        }
        let c = ConcreteConfig::new()
            .with("complexity", 64)
            .with("image_size", json!({"width": 32}));
        let part: Part = c.extract().unwrap();
        assert_eq!(part.complexity, 64);
    }

    #[test]
    fn test_deltas_report_initial_and_chosen() {
        let initial = Configuration::new().with("complexity", json!([64, 128]));
        let chosen = ConcreteConfig::new().with("complexity", 128);
        let deltas = chosen.deltas(&initial, AGGREGATOR_OPTIONS);
        assert_eq!(
            deltas,
            vec![("complexity".to_string(), json!([64, 128]), json!(128))]
        );
    }
}
