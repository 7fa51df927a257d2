//! Run settings and search options.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment. The user file lives at
//! `~/.config/optivis/config.toml`; the explicit file may be TOML or JSON.

use crate::dataset::{SplitMode, SplitPolicy};
use crate::error::MlError;
use crate::features::{CACHE_DIR, FeatureCache};
use crate::grid::Configuration;
use crate::search::TieBreak;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides, e.g. `OPTIVIS_RUN__SEARCH_WORKERS=4`.
pub const ENV_PREFIX: &str = "OPTIVIS_";

/// Everything a search run reads from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub run: RunConfig,
    /// Option name to scalar or candidate list.
    #[serde(default)]
    pub options: Configuration,
}

/// How a search run is executed, as opposed to what it searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub split_mode: SplitMode,
    /// Fraction of tags held out for testing.
    #[serde(default = "default_split_ratio")]
    pub split_ratio: f64,
    /// Seed of the random split; unseeded when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Feature extraction threads, 0 for one per core.
    #[serde(default)]
    pub extraction_workers: usize,
    /// Concurrent candidates within a tier.
    #[serde(default = "default_search_workers")]
    pub search_workers: usize,
    #[serde(default)]
    pub candidate_timeout_secs: Option<u64>,
    #[serde(default = "default_supervised_tie_break")]
    pub supervised_tie_break: TieBreak,
    #[serde(default = "default_outlier_tie_break")]
    pub outlier_tie_break: TieBreak,
    #[serde(default)]
    pub use_cache: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            split_mode: SplitMode::default(),
            split_ratio: default_split_ratio(),
            seed: None,
            extraction_workers: 0,
            search_workers: default_search_workers(),
            candidate_timeout_secs: None,
            supervised_tie_break: default_supervised_tie_break(),
            outlier_tie_break: default_outlier_tie_break(),
            use_cache: false,
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_split_ratio() -> f64 {
    0.2
}

fn default_search_workers() -> usize {
    1
}

fn default_supervised_tie_break() -> TieBreak {
    TieBreak::PreferLatest
}

fn default_outlier_tie_break() -> TieBreak {
    TieBreak::PreferEarliest
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(CACHE_DIR)
}

impl RunConfig {
    pub fn split_policy(&self) -> SplitPolicy {
        SplitPolicy {
            mode: self.split_mode,
            ratio: self.split_ratio,
            seed: self.seed,
        }
    }

    pub fn candidate_timeout(&self) -> Option<Duration> {
        self.candidate_timeout_secs.map(Duration::from_secs)
    }

    pub fn feature_cache(&self) -> Option<FeatureCache> {
        self.use_cache.then(|| FeatureCache::new(&self.cache_dir))
    }

    pub fn extraction_pool(&self) -> Result<ThreadPool, MlError> {
        build_pool("optivis-extract", self.extraction_workers)
    }

    pub fn search_pool(&self) -> Result<ThreadPool, MlError> {
        build_pool("optivis-search", self.search_workers.max(1))
    }

    /// Reject values no search can run with.
    pub fn validate(&self) -> Result<(), MlError> {
        if !(0.0..=1.0).contains(&self.split_ratio) {
            return Err(MlError::config(format!(
                "split_ratio must lie in [0, 1], got {}",
                self.split_ratio
            )));
        }
        if self.candidate_timeout_secs == Some(0) {
            return Err(MlError::config("candidate_timeout_secs must be positive"));
        }
        Ok(())
    }
}

fn build_pool(name: &'static str, threads: usize) -> Result<ThreadPool, MlError> {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("{name}-{i}"))
        .build()
        .map_err(|e| MlError::config(format!("cannot start {name} pool: {e}")))
}

/// Fill in the option defaults shared by both searches.
///
/// Only keys the configuration leaves out are set, so declared candidate
/// lists are never touched.
pub fn apply_option_defaults(options: &mut Configuration) {
    options.set_default("sampling_method", "dense");
    options.set_default("sampling_step", 20);
    options.set_default("sampling_window", 20);
    options.set_default("normalize", true);
    options.set_default("aggregator", "bag_of_words");
    options.set_default("complexity", 128);
    options.set_default("clf_type", "random_forest");
}

/// Load settings from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `OPTIVIS_`, nested with `__`)
/// 2. `config_file`, parsed as JSON for `.json` and TOML otherwise
/// 3. User config (`~/.config/optivis/config.toml`)
/// 4. Built-in defaults
pub fn load_settings(config_file: Option<&Path>) -> Result<Settings, MlError> {
    let mut figment = Figment::from(Serialized::defaults(Settings::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "optivis", "optivis") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(MlError::config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        figment = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => figment.merge(Json::file(path)),
            _ => figment.merge(Toml::file(path)),
        };
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    let mut settings: Settings = figment.extract().map_err(Box::new)?;
    settings.run.validate()?;
    apply_option_defaults(&mut settings.options);
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_run_defaults() {
        let run = RunConfig::default();
        assert_eq!(run.split_policy(), SplitPolicy::default());
        assert_eq!(run.search_workers, 1);
        assert_eq!(run.supervised_tie_break, TieBreak::PreferLatest);
        assert_eq!(run.outlier_tie_break, TieBreak::PreferEarliest);
        assert!(run.feature_cache().is_none());
        assert!(run.candidate_timeout().is_none());
    }

    #[test]
    fn test_option_defaults_keep_declared_values() {
        let mut options = Configuration::new().with("complexity", json!([32, 64]));
        apply_option_defaults(&mut options);
        assert_eq!(options.get("complexity"), Some(&json!([32, 64])));
        assert_eq!(options.get("clf_type"), Some(&json!("random_forest")));
        assert_eq!(options.get("sampling_step"), Some(&json!(20)));
    }

    #[test]
    fn test_load_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("search.toml");
        std::fs::write(
            &path,
            r#"
[run]
split_mode = "fixed"
split_ratio = 0.3
search_workers = 2
outlier_tie_break = "prefer_latest"

[options]
feature = ["hsv-sift", "gray-hog"]
aggregator = "vlad"
complexity = [16, 32]
clf_type = ["rf", "svm"]
"#,
        )
        .unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.run.split_policy(), SplitPolicy::fixed(0.3));
        assert_eq!(settings.run.search_workers, 2);
        assert_eq!(settings.run.outlier_tie_break, TieBreak::PreferLatest);
        assert_eq!(settings.options.get("feature"), Some(&json!(["hsv-sift", "gray-hog"])));
        assert_eq!(settings.options.get("complexity"), Some(&json!([16, 32])));
        assert_eq!(settings.options.get("sampling_method"), Some(&json!("dense")));
    }

    #[test]
    fn test_load_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("search.json");
        std::fs::write(
            &path,
            r#"{"run": {"candidate_timeout_secs": 30}, "options": {"method": "by_classifier"}}"#,
        )
        .unwrap();
        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.run.candidate_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(settings.options.get("method"), Some(&json!("by_classifier")));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = load_settings(Some(Path::new("/nonexistent/optivis.toml")));
        assert!(matches!(result, Err(MlError::Config(_))));
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[run]\nsplit_ratio = 1.5\n").unwrap();
        assert!(matches!(load_settings(Some(&path)), Err(MlError::Config(_))));
    }
}
