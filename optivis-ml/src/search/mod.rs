//! Search drivers.
//!
//! Both drivers walk the tiers of a [`Configuration`] as nested scopes: raw
//! features are extracted once per feature-tier point and handed read-only
//! to every inner candidate. Candidates of one tier run on a bounded pool and
//! only the compare-and-checkpoint step is serialized.

pub mod best;
pub mod outlier;
pub mod supervised;
pub mod timeout;

pub use best::{BestTracker, CandidateRecord, TieBreak};
pub use outlier::{OutlierSearch, VERSION_PREFIX};
pub use supervised::SupervisedSearch;
pub use timeout::run_with_timeout;

use crate::error::MlError;
use crate::grid::{AGGREGATOR_OPTIONS, ConcreteConfig, Configuration, FEATURE_OPTIONS, MODEL_OPTIONS};
use chrono::{DateTime, Utc};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Run `work` for every candidate of a tier on `pool`.
///
/// A single-threaded pool visits candidates in grid order, which makes tie
/// resolution reproducible.
pub(crate) fn for_each_candidate<T, F>(pool: &ThreadPool, candidates: &[T], work: F) -> Result<(), MlError>
where
    T: Sync,
    F: Fn(&T) -> Result<(), MlError> + Sync + Send,
{
    if pool.current_num_threads() <= 1 {
        return candidates.iter().try_for_each(work);
    }
    pool.install(|| candidates.par_iter().try_for_each(work))
}

/// Options shown when naming a candidate in progress logs.
const CANDIDATE_KEYS: &[&str] = &[
    "feature",
    "sampling_method",
    "aggregator",
    "complexity",
    "clf_type",
    "method",
];

/// One option whose chosen value is reported against its declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionDelta {
    pub option: String,
    pub initial: Value,
    pub chosen: Value,
}

/// Outcome of a finished search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSummary {
    /// `macro_f1` or `auroc`.
    pub metric: String,
    pub best_score: f64,
    pub best_options: ConcreteConfig,
    pub deltas: Vec<OptionDelta>,
    pub history: Vec<CandidateRecord>,
    /// Candidates dropped after exceeding the time limit.
    pub skipped: usize,
    /// Winning `version_<i>` folder of an outlier search.
    #[serde(default)]
    pub best_version: Option<usize>,
    pub model_folder: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SearchSummary {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Log the best score and every `initial --> chosen` option.
    pub fn log_report(&self) {
        tracing::info!(
            metric = %self.metric,
            evaluated = self.history.len(),
            skipped = self.skipped,
            elapsed_secs = self.elapsed().num_seconds(),
            "[RESULT] Best {}: {}",
            self.metric,
            self.best_score
        );
        for delta in &self.deltas {
            tracing::info!("[RESULT] {}: {} --> {}", delta.option, delta.initial, delta.chosen);
        }
    }
}

pub(crate) struct Finished<'a> {
    pub metric: &'static str,
    pub initial: &'a Configuration,
    pub best: Option<CandidateRecord>,
    pub history: Vec<CandidateRecord>,
    pub skipped: usize,
    pub best_version: Option<usize>,
    pub model_folder: &'a Path,
    pub started_at: DateTime<Utc>,
}

impl Finished<'_> {
    pub fn into_summary(self) -> Result<SearchSummary, MlError> {
        let best = self.best.ok_or_else(|| {
            MlError::search(format!(
                "no candidate finished ({} skipped); nothing was saved",
                self.skipped
            ))
        })?;
        let keys: Vec<&str> = FEATURE_OPTIONS
            .iter()
            .chain(AGGREGATOR_OPTIONS)
            .chain(MODEL_OPTIONS)
            .chain(&["method"])
            .copied()
            .collect();
        let deltas = best
            .options
            .deltas(self.initial, &keys)
            .into_iter()
            .map(|(option, initial, chosen)| OptionDelta {
                option,
                initial,
                chosen,
            })
            .collect();
        let summary = SearchSummary {
            metric: self.metric.to_string(),
            best_score: best.score,
            best_options: best.options,
            deltas,
            history: self.history,
            skipped: self.skipped,
            best_version: self.best_version,
            model_folder: self.model_folder.to_path_buf(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        summary.log_report();
        Ok(summary)
    }
}

pub(crate) fn candidate_label(options: &ConcreteConfig) -> String {
    options.describe(CANDIDATE_KEYS)
}
