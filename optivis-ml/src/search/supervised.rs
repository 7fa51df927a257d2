//! Supervised search: feature tier -> aggregator tier -> model tier, ranked
//! by macro-F1 on a held-out split.

use super::best::{BestTracker, lock};
use super::timeout::run_with_timeout;
use super::{Finished, SearchSummary, candidate_label, for_each_candidate};
use crate::aggregation::{Aggregator, stack_present};
use crate::classifier::Classifier;
use crate::config::RunConfig;
use crate::dataset::{ClassMapping, TagRef, split_tags};
use crate::error::MlError;
use crate::features::FeatureExtractor;
use crate::grid::{ConcreteConfig, Configuration, Tier};
use crate::pipeline::ImagePipeline;
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Aggregated train and test data shared by the models of one aggregator.
struct TierData {
    x_train: Vec<Vec<f64>>,
    y_train: Vec<i64>,
    x_test: Vec<Vec<f64>>,
    y_test: Vec<i64>,
}

/// Read-only outputs of the outer tiers plus the shared best record.
struct ModelScope<'a> {
    extractor: &'a FeatureExtractor,
    aggregator: &'a Aggregator,
    data: Arc<TierData>,
    tracker: &'a Mutex<BestTracker>,
    skipped: &'a AtomicUsize,
    model_folder: &'a Path,
}

/// Searches image-classification pipelines for the best macro-F1.
///
/// Every improvement is checkpointed to the model folder as a complete
/// [`ImagePipeline`] before it is recorded as the best.
#[derive(Debug, Clone)]
pub struct SupervisedSearch {
    options: Configuration,
    class_mapping: ClassMapping,
    run: RunConfig,
}

impl SupervisedSearch {
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

    /// Split `tags` once with the run's split policy, then search.
    pub fn fit(&self, model_folder: &Path, tags: &[TagRef]) -> Result<SearchSummary, MlError> {
        let (train, test) = split_tags(tags, &self.run.split_policy());
        self.fit_split(model_folder, &train, &test)
    }

    /// Search with a given train/test split shared by every candidate.
    pub fn fit_split(
        &self,
        model_folder: &Path,
        train: &[TagRef],
        test: &[TagRef],
    ) -> Result<SearchSummary, MlError> {
        if train.is_empty() || test.is_empty() {
            return Err(MlError::search(format!(
                "need both train and test tags, got {} and {}",
                train.len(),
                test.len()
            )));
        }
        let started_at = Utc::now();
        let extraction_pool = self.run.extraction_pool()?;
        let search_pool = self.run.search_pool()?;
        let tracker = Mutex::new(BestTracker::new(self.run.supervised_tie_break));
        let skipped = AtomicUsize::new(0);

        let feature_configs = self.options.expand_tier(Tier::Feature);
        tracing::info!(
            feature_configs = feature_configs.len(),
            train = train.len(),
            test = test.len(),
            model_folder = %model_folder.display(),
            "Starting supervised search"
        );

        for feature_options in feature_configs {
            let mut extractor = FeatureExtractor::from_options(&feature_options)?;
            if let Some(cache) = self.run.feature_cache() {
                extractor = extractor.with_cache(cache);
            }
            let train_features = extractor.extract_trainings_data(train, &extraction_pool)?;
            let test_features = extractor.extract_trainings_data(test, &extraction_pool)?;
            let mut feature_options = feature_options;
            feature_options.insert("sampling_method", extractor.sampling_method().name());

            for aggregator_options in Configuration::from(feature_options).expand_aggregators() {
                let mut aggregator = Aggregator::from_options(&aggregator_options)?;
                let train_reps = aggregator.fit_transform(&train_features.features)?;
                let test_reps = aggregator.transform(&test_features.features)?;
                let (x_train, y_train) = stack_present(&train_reps, &train_features.labels)?;
                let (x_test, y_test) = stack_present(&test_reps, &test_features.labels)?;
                tracing::info!(
                    aggregator = %aggregator.describe(),
                    train = x_train.len(),
                    test = x_test.len(),
                    "Aggregated features"
                );

                let scope = ModelScope {
                    extractor: &extractor,
                    aggregator: &aggregator,
                    data: Arc::new(TierData {
                        x_train,
                        y_train,
                        x_test,
                        y_test,
                    }),
                    tracker: &tracker,
                    skipped: &skipped,
                    model_folder,
                };
                let model_configs = Configuration::from(aggregator_options).expand_tier(Tier::Model);
                for_each_candidate(&search_pool, &model_configs, |options| {
                    self.run_candidate(&scope, options)
                })?;
            }
        }

        let tracker = tracker
            .into_inner()
            .map_err(|_| MlError::search("best-result record poisoned by a panicking candidate"))?;
        Finished {
            metric: "macro_f1",
            initial: &self.options,
            best: tracker.best().cloned(),
            history: tracker.into_history(),
            skipped: skipped.into_inner(),
            best_version: None,
            model_folder,
            started_at,
        }
        .into_summary()
    }

    fn run_candidate(&self, scope: &ModelScope<'_>, options: &ConcreteConfig) -> Result<(), MlError> {
        let label = candidate_label(options);
        let data = Arc::clone(&scope.data);
        let mapping = self.class_mapping.clone();
        let owned = options.clone();
        let outcome = run_with_timeout(self.run.candidate_timeout(), &label, move || {
            let mut classifier = Classifier::new(&owned, mapping)?;
            classifier.fit(&data.x_train, &data.y_train)?;
            let evaluation = classifier.evaluate(&data.x_test, &data.y_test)?;
            Ok((classifier, evaluation))
        });
        let (classifier, evaluation) = match outcome {
            Ok(done) => done,
            Err(MlError::Timeout(reason)) => {
                tracing::warn!(candidate = %label, %reason, "Skipping candidate");
                scope.skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let score = evaluation.macro_f1();
        let mut tracker = lock(scope.tracker)?;
        let accepted = tracker.offer(classifier.options(), score, || {
            ImagePipeline::new(scope.extractor.clone(), scope.aggregator.clone(), classifier.clone())
                .save(scope.model_folder)
        })?;
        tracing::info!(
            candidate = %label,
            macro_f1 = score,
            best = tracker.best_score().unwrap_or(score),
            accepted,
            "RUN: {label} - F1: {score:.3}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MemoryTag;
    use crate::persistence::load_json;
    use crate::classifier::PIPELINE_OPT_FILE;
    use image::{DynamicImage, Rgb, RgbImage};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn tag(i: usize, label: i64) -> TagRef {
        let image = RgbImage::from_fn(32, 32, |x, y| {
            let v = ((x + 2 * y + i as u32) % 30) as u8;
            match label {
                0 => Rgb([210 + v, v, v]),
                _ => Rgb([v, 210 + v, v]),
            }
        });
        MemoryTag::new(format!("t{i}"), DynamicImage::ImageRgb8(image), label).into_ref()
    }

    fn search(options: Configuration) -> SupervisedSearch {
        let mapping = ClassMapping::new([("red", 0), ("green", 1)]).unwrap();
        let run = RunConfig {
            search_workers: 2,
            extraction_workers: 2,
            ..RunConfig::default()
        };
        SupervisedSearch::new(options, mapping, run)
    }

    fn options() -> Configuration {
        Configuration::new()
            .with("feature", "rgb")
            .with("sampling_step", 8)
            .with("sampling_window", 16)
            .with("aggregator", json!(["global_avg", "global_max"]))
            .with("clf_type", json!(["knn", "gaussian_nb"]))
    }

    fn tags(range: std::ops::Range<usize>) -> Vec<TagRef> {
        range.map(|i| tag(i, (i % 2) as i64)).collect()
    }

    #[test]
    fn test_search_checkpoints_best_pipeline() {
        let dir = TempDir::new().unwrap();
        let model_folder = dir.path().join("model");
        let summary = search(options())
            .fit_split(&model_folder, &tags(0..12), &tags(12..18))
            .unwrap();

        assert_eq!(summary.metric, "macro_f1");
        assert_eq!(summary.history.len(), 4);
        assert_eq!(summary.best_score, 1.0);
        let saved: ConcreteConfig = load_json(&model_folder.join(PIPELINE_OPT_FILE))
            .unwrap()
            .unwrap();
        assert_eq!(saved, summary.best_options);

        let pipeline = ImagePipeline::load(&model_folder).unwrap();
        let evaluation = pipeline
            .evaluate(&tags(30..36), &rayon::ThreadPoolBuilder::new().build().unwrap(), None)
            .unwrap();
        assert_eq!(evaluation.macro_f1(), 1.0);
    }

    #[test]
    fn test_unknown_model_fails_fast() {
        let dir = TempDir::new().unwrap();
        let options = options().with("clf_type", "perceptron_9000");
        let result = search(options).fit_split(dir.path(), &tags(0..8), &tags(8..12));
        assert!(matches!(result, Err(MlError::UnknownModel(_))));
    }

    #[test]
    fn test_empty_split_rejected() {
        let dir = TempDir::new().unwrap();
        let result = search(options()).fit_split(dir.path(), &tags(0..8), &[]);
        assert!(matches!(result, Err(MlError::Search(_))));
    }

    #[test]
    fn test_deltas_report_chosen_values() {
        let dir = TempDir::new().unwrap();
        let summary = search(options())
            .fit_split(&dir.path().join("m"), &tags(0..12), &tags(12..18))
            .unwrap();
        let options: Vec<&str> = summary.deltas.iter().map(|d| d.option.as_str()).collect();
        assert!(options.contains(&"aggregator"));
        assert!(options.contains(&"clf_type"));
        let clf = summary.deltas.iter().find(|d| d.option == "clf_type").unwrap();
        assert_eq!(clf.initial, json!(["knn", "gaussian_nb"]));
        assert_eq!(Some(&clf.chosen), summary.best_options.get("clf_type"));
    }

    #[test]
    fn test_single_worker_ties_go_to_the_last_grid_candidate() {
        let dir = TempDir::new().unwrap();
        let options = options()
            .with("aggregator", "global_avg")
            .with("clf_type", json!(["knn", "neighbours"]));
        let run = RunConfig {
            search_workers: 1,
            ..RunConfig::default()
        };
        let mapping = ClassMapping::new([("red", 0), ("green", 1)]).unwrap();
        let summary = SupervisedSearch::new(options, mapping, run)
            .fit_split(&dir.path().join("m"), &tags(0..12), &tags(12..18))
            .unwrap();

        let order: Vec<_> = summary
            .history
            .iter()
            .map(|r| r.options.get_str("clf_type"))
            .collect();
        assert_eq!(order, vec![Some("knn"), Some("neighbours")]);
        assert!(summary.history.iter().all(|r| r.score == 1.0 && r.accepted));
        assert_eq!(summary.best_options.get_str("clf_type"), Some("neighbours"));
    }
}
