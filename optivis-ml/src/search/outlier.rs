//! Outlier search: every feature-tier point runs its own aggregator search
//! into a `version_<i>` folder, ranked by AUROC on the test tags.

use super::best::{BestTracker, CandidateRecord, lock};
use super::timeout::run_with_timeout;
use super::{Finished, SearchSummary, candidate_label, for_each_candidate};
use crate::aggregation::{Aggregator, stack_present};
use crate::config::RunConfig;
use crate::dataset::{ClassMapping, OUTLIER_LABEL, TagRef};
use crate::error::MlError;
use crate::features::{FeatureExtractor, LabeledFeatures};
use crate::grid::{ConcreteConfig, Configuration, Tier};
use crate::metrics::auroc;
use crate::outlier::{NOMINAL_LABEL, OutlierDetector, OutlierMethod, OutlierModel, binarize};
use crate::persistence::copy_files;
use chrono::Utc;
use rayon::ThreadPool;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Folder name prefix of per-feature-config candidates.
pub const VERSION_PREFIX: &str = "version_";

/// Raw features of one feature-tier point, shared by its aggregators.
struct AggregatorScope<'a> {
    extractor: &'a FeatureExtractor,
    known: Arc<LabeledFeatures>,
    test: Arc<LabeledFeatures>,
    tracker: &'a Mutex<BestTracker>,
    skipped: &'a AtomicUsize,
    version_dir: &'a Path,
}

/// Result of one version's aggregator search.
struct VersionOutcome {
    best: Option<CandidateRecord>,
    history: Vec<CandidateRecord>,
    skipped: usize,
}

/// Searches outlier-detection pipelines for the best AUROC.
#[derive(Debug, Clone)]
pub struct OutlierSearch {
    options: Configuration,
    class_mapping: ClassMapping,
    run: RunConfig,
}

impl OutlierSearch {
    pub fn new(options: Configuration, class_mapping: ClassMapping, run: RunConfig) -> Self {
        Self {
            options,
            class_mapping,
            run,
        }
    }

    pub fn options(&self) -> &Configuration {
        &self.options
    }

    /// Fit on the `known` tags and rank candidates on the `test` tags.
    ///
    /// `test` must hold both nominal tags and known outliers. On completion
    /// the files of the best version are copied to the model folder root.
    pub fn fit(
        &self,
        model_folder: &Path,
        known: &[TagRef],
        test: &[TagRef],
    ) -> Result<SearchSummary, MlError> {
        if known.is_empty() {
            return Err(MlError::search("no known tags to fit on"));
        }
        let has_outliers = test.iter().any(|t| t.load_y() == OUTLIER_LABEL);
        let has_nominal = test.iter().any(|t| t.load_y() != OUTLIER_LABEL);
        if !(has_outliers && has_nominal) {
            return Err(MlError::search(
                "the test tags need both nominal samples and known outliers",
            ));
        }

        let started_at = Utc::now();
        let extraction_pool = self.run.extraction_pool()?;
        let search_pool = self.run.search_pool()?;
        std::fs::create_dir_all(model_folder)?;

        let feature_configs = self.options.expand_tier(Tier::Feature);
        tracing::info!(
            feature_configs = feature_configs.len(),
            known = known.len(),
            test = test.len(),
            model_folder = %model_folder.display(),
            "Starting outlier search"
        );

        let mut overall = BestTracker::new(self.run.outlier_tie_break);
        let mut versions = Vec::new();
        let mut history = Vec::new();
        let mut skipped = 0;
        for (i, feature_options) in feature_configs.into_iter().enumerate() {
            let version_dir = model_folder.join(format!("{VERSION_PREFIX}{i}"));
            let outcome = self.search_aggregators(
                feature_options,
                known,
                test,
                &version_dir,
                &extraction_pool,
                &search_pool,
            )?;
            skipped += outcome.skipped;
            for mut record in outcome.history {
                record.index = history.len();
                history.push(record);
            }
            let Some(best) = outcome.best else {
                tracing::warn!(version = i, "No candidate of this version finished");
                continue;
            };
            tracing::info!(version = i, auroc = best.score, "Version finished");
            versions.push(i);
            overall.offer(&best.options, best.score, || Ok(()))?;
        }

        let best = overall.best().cloned();
        let best_version = best.as_ref().map(|b| versions[b.index]);
        if let Some(version) = best_version {
            let from = model_folder.join(format!("{VERSION_PREFIX}{version}"));
            let copied = copy_files(&from, model_folder)?;
            tracing::info!(version, copied, "[FINAL-RESULT] Best model copied to the model folder");
        }

        Finished {
            metric: "auroc",
            initial: &self.options,
            best,
            history,
            skipped,
            best_version,
            model_folder,
            started_at,
        }
        .into_summary()
    }

    fn search_aggregators(
        &self,
        feature_options: ConcreteConfig,
        known: &[TagRef],
        test: &[TagRef],
        version_dir: &Path,
        extraction_pool: &ThreadPool,
        search_pool: &ThreadPool,
    ) -> Result<VersionOutcome, MlError> {
        let mut extractor = FeatureExtractor::from_options(&feature_options)?;
        if let Some(cache) = self.run.feature_cache() {
            extractor = extractor.with_cache(cache);
        }
        let known_features = extractor.extract_trainings_data(known, extraction_pool)?;
        let test_features = extractor.extract_trainings_data(test, extraction_pool)?;
        let mut feature_options = feature_options;
        feature_options.insert("sampling_method", extractor.sampling_method().name());

        let tracker = Mutex::new(BestTracker::new(self.run.outlier_tie_break));
        let skipped = AtomicUsize::new(0);
        let scope = AggregatorScope {
            extractor: &extractor,
            known: Arc::new(known_features),
            test: Arc::new(test_features),
            tracker: &tracker,
            skipped: &skipped,
            version_dir,
        };
        let aggregator_configs = Configuration::from(feature_options).expand_aggregators();
        for_each_candidate(search_pool, &aggregator_configs, |options| {
            self.run_candidate(&scope, options)
        })?;

        let tracker = tracker
            .into_inner()
            .map_err(|_| MlError::search("best-result record poisoned by a panicking candidate"))?;
        Ok(VersionOutcome {
            best: tracker.best().cloned(),
            history: tracker.into_history(),
            skipped: skipped.into_inner(),
        })
    }

    fn run_candidate(
        &self,
        scope: &AggregatorScope<'_>,
        options: &ConcreteConfig,
    ) -> Result<(), MlError> {
        let label = candidate_label(options);
        let known = Arc::clone(&scope.known);
        let test = Arc::clone(&scope.test);
        let owned = options.clone();
        let outcome = run_with_timeout(self.run.candidate_timeout(), &label, move || {
            let method = OutlierMethod::from_options(&owned)?;
            let mut aggregator = Aggregator::from_options(&owned)?;
            let known_reps = aggregator.fit_transform(&known.features)?;
            let test_reps = aggregator.transform(&test.features)?;
            let (x, y) = stack_present(&known_reps, &known.labels)?;
            let (x_test, y_test) = stack_present(&test_reps, &test.labels)?;

            let mut model = OutlierModel::new(method, &owned)?;
            model.as_scorer_mut().fit(&x, Some(&y))?;
            let scores = model.as_scorer().score_samples(&x_test)?;
            let score = auroc(&binarize(&y_test), &scores, NOMINAL_LABEL)?;
            Ok((aggregator, model, score))
        });
        let (aggregator, model, score) = match outcome {
            Ok(done) => done,
            Err(MlError::Timeout(reason)) => {
                tracing::warn!(candidate = %label, %reason, "Skipping candidate");
                scope.skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut tracker = lock(scope.tracker)?;
        let method = model.method();
        let accepted = tracker.offer(options, score, || {
            OutlierDetector::new(
                options.clone(),
                scope.extractor.clone(),
                aggregator,
                model,
                self.class_mapping.clone(),
            )
            .save(scope.version_dir)
        })?;
        tracing::info!(
            candidate = %label,
            auroc = score,
            accepted,
            "RUN: {label} / {method} - AUROC: {score:.3}"
        );
        Ok(())
    }
}
