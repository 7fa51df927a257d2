//! A resolved outlier-detection pipeline: feature extraction, aggregation
//! and one fitted scorer, saved and evaluated as a unit.

use super::{NOMINAL_LABEL, OutlierMethod, OutlierModel, binarize};
use crate::aggregation::Aggregator;
use crate::classifier::CLASS_MAPPING_FILE;
use crate::dataset::{ClassMapping, OUTLIER_LABEL, TagRef};
use crate::error::MlError;
use crate::features::FeatureExtractor;
use crate::grid::ConcreteConfig;
use crate::metrics::{ClassificationReport, apply_threshold, auroc, best_threshold};
use crate::persistence::{
    atomic_write, atomic_write_json, replace_dir_atomically, require_json, reset_dir,
};
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const OUTLIER_OPT_FILE: &str = "outlier_detector_opt.json";
pub const OUTLIER_REPORT_FILE: &str = "outlier_report.txt";
pub const WRONGLY_ACCEPTED_DIR: &str = "wrongly_accepted";
pub const WRONGLY_REJECTED_DIR: &str = "wrongly_rejected";

/// Outcome of [`OutlierDetector::evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierEvaluation {
    pub auroc: f64,
    /// Scores at or above this value are accepted as nominal.
    pub threshold: f64,
    pub report: ClassificationReport,
    pub wrongly_accepted: usize,
    pub wrongly_rejected: usize,
}

impl OutlierEvaluation {
    pub fn render(&self) -> String {
        let names = |l: i64| {
            if l == OUTLIER_LABEL { "outlier".to_string() } else { "nominal".to_string() }
        };
        format!(
            "[RESULT]: AUROC {} / THRESHOLD: {}\n\n{}",
            self.auroc,
            self.threshold,
            self.report.render(names)
        )
    }
}

/// Feature extractor, aggregator and scorer of one outlier candidate.
#[derive(Debug, Clone)]
pub struct OutlierDetector {
    options: ConcreteConfig,
    extractor: FeatureExtractor,
    aggregator: Aggregator,
    model: OutlierModel,
    class_mapping: ClassMapping,
}

impl OutlierDetector {
    /// Assemble a detector from already fitted stages.
    ///
    /// The scorer's method is recorded in the options so that `load` restores
    /// the same scorer.
    pub fn new(
        mut options: ConcreteConfig,
        extractor: FeatureExtractor,
        aggregator: Aggregator,
        model: OutlierModel,
        class_mapping: ClassMapping,
    ) -> Self {
        options.insert("method", model.method().name());
        Self {
            options,
            extractor,
            aggregator,
            model,
            class_mapping,
        }
    }

    pub fn options(&self) -> &ConcreteConfig {
        &self.options
    }

    pub fn method(&self) -> OutlierMethod {
        self.model.method()
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn model(&self) -> &OutlierModel {
        &self.model
    }

    pub fn class_mapping(&self) -> &ClassMapping {
        &self.class_mapping
    }

    /// Scores of the tags that yield a representation, with their indices.
    pub fn score_tags(
        &self,
        tags: &[TagRef],
        pool: &ThreadPool,
    ) -> Result<(Vec<usize>, Vec<f64>), MlError> {
        let features = self.extractor.extract_trainings_data(tags, pool)?;
        let representations = self.aggregator.transform(&features.features)?;
        let (indices, rows): (Vec<usize>, Vec<Vec<f64>>) = representations
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| r.map(|r| (i, r)))
            .unzip();
        if rows.is_empty() {
            return Err(MlError::NoFeatures(format!(
                "none of the {} tags yielded a representation",
                tags.len()
            )));
        }
        let scores = self.model.as_scorer().score_samples(&rows)?;
        Ok((indices, scores))
    }

    /// Score `tags`, pick the best nominal/outlier cut-off and write the
    /// report and misclassified tags into `results_folder`.
    ///
    /// Every label other than the outlier sentinel counts as nominal. Tags
    /// without a representation are left out.
    pub fn evaluate(
        &self,
        tags: &[TagRef],
        results_folder: &Path,
        pool: &ThreadPool,
    ) -> Result<OutlierEvaluation, MlError> {
        tracing::info!(tags = tags.len(), method = %self.method(), "Evaluating outlier detector");
        let (indices, scores) = self.score_tags(tags, pool)?;
        let labels: Vec<i64> = indices.iter().map(|&i| tags[i].load_y()).collect();
        let truth = binarize(&labels);

        let auroc = auroc(&truth, &scores, NOMINAL_LABEL)?;
        let choice = best_threshold(&truth, &scores, NOMINAL_LABEL, OUTLIER_LABEL)?;
        let decisions = apply_threshold(&scores, choice.threshold, NOMINAL_LABEL, OUTLIER_LABEL);

        let accepted_dir = results_folder.join(WRONGLY_ACCEPTED_DIR);
        let rejected_dir = results_folder.join(WRONGLY_REJECTED_DIR);
        reset_dir(&accepted_dir)?;
        reset_dir(&rejected_dir)?;
        let (mut wrongly_accepted, mut wrongly_rejected) = (0, 0);
        for ((&i, &t), &d) in indices.iter().zip(&truth).zip(&decisions) {
            if d == NOMINAL_LABEL && t == OUTLIER_LABEL {
                tags[i].export_box(&accepted_dir)?;
                wrongly_accepted += 1;
            } else if d == OUTLIER_LABEL && t == NOMINAL_LABEL {
                tags[i].export_box(&rejected_dir)?;
                wrongly_rejected += 1;
            }
        }

        let evaluation = OutlierEvaluation {
            auroc,
            threshold: choice.threshold,
            report: choice.report,
            wrongly_accepted,
            wrongly_rejected,
        };
        let text = evaluation.render();
        atomic_write(&results_folder.join(OUTLIER_REPORT_FILE), text.as_bytes())?;
        tracing::info!(
            auroc,
            threshold = evaluation.threshold,
            wrongly_accepted,
            wrongly_rejected,
            "Outlier evaluation finished"
        );
        Ok(evaluation)
    }

    pub(crate) fn write_into(&self, dir: &Path) -> Result<(), MlError> {
        atomic_write_json(&dir.join(OUTLIER_OPT_FILE), &self.options)?;
        self.class_mapping.save(&dir.join(CLASS_MAPPING_FILE))?;
        self.extractor.save(dir)?;
        self.aggregator.save(dir)?;
        self.model.as_scorer().save(dir)
    }

    /// Replace `dir` with this detector's artifacts.
    pub fn save(&self, dir: &Path) -> Result<(), MlError> {
        replace_dir_atomically(dir, |staging| self.write_into(staging))
    }

    pub fn load(dir: &Path) -> Result<Self, MlError> {
        let options: ConcreteConfig = require_json(&dir.join(OUTLIER_OPT_FILE))?;
        let method = OutlierMethod::from_options(&options)?;
        Ok(Self {
            extractor: FeatureExtractor::load(dir)?,
            aggregator: Aggregator::load(dir)?,
            model: OutlierModel::load(method, dir)?,
            class_mapping: ClassMapping::load(&dir.join(CLASS_MAPPING_FILE))?,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MemoryTag;
    use image::{DynamicImage, GrayImage, Luma};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    /// Dark gradients are nominal, bright ones are outliers.
    fn tag(i: usize, bright: bool, label: i64) -> TagRef {
        let base = if bright { 200 } else { 0 };
        let image = GrayImage::from_fn(32, 32, |x, y| {
            Luma([base + ((x + y + i as u32) % 48) as u8])
        });
        MemoryTag::new(format!("tag-{i}"), DynamicImage::ImageLuma8(image), label).into_ref()
    }

    fn options() -> ConcreteConfig {
        ConcreteConfig::new()
            .with("feature", "gray")
            .with("sampling_step", 8)
            .with("sampling_window", 16)
            .with("aggregator", "global_avg")
            .with("method", "by_distance")
    }

    fn fitted(pool: &ThreadPool) -> OutlierDetector {
        let options = options();
        let extractor = FeatureExtractor::from_options(&options).unwrap();
        let mut aggregator = Aggregator::from_options(&options).unwrap();
        let train: Vec<TagRef> = (0..12).map(|i| tag(i, false, (i % 2) as i64)).collect();
        let features = extractor.extract_trainings_data(&train, pool).unwrap();
        let x: Vec<Vec<f64>> = aggregator
            .fit_transform(&features.features)
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        let mut model = OutlierModel::new(OutlierMethod::ByDistance, &options).unwrap();
        model.as_scorer_mut().fit(&x, Some(&features.labels)).unwrap();
        let mapping = ClassMapping::new([("a", 0), ("b", 1)]).unwrap();
        OutlierDetector::new(options, extractor, aggregator, model, mapping)
    }

    fn test_tags() -> Vec<TagRef> {
        let mut tags: Vec<TagRef> = (20..26).map(|i| tag(i, false, 0)).collect();
        tags.extend((0..4).map(|i| tag(i, true, OUTLIER_LABEL)));
        tags
    }

    #[test]
    fn test_evaluate_separates_bright_outliers() {
        let pool = pool();
        let detector = fitted(&pool);
        let results = TempDir::new().unwrap();
        let evaluation = detector.evaluate(&test_tags(), results.path(), &pool).unwrap();

        assert_eq!(evaluation.auroc, 1.0);
        assert_eq!(evaluation.report.macro_f1(), 1.0);
        assert_eq!((evaluation.wrongly_accepted, evaluation.wrongly_rejected), (0, 0));
        let report = std::fs::read_to_string(results.path().join(OUTLIER_REPORT_FILE)).unwrap();
        assert!(report.starts_with("[RESULT]: AUROC 1"));
        assert!(report.contains("outlier"));
        assert!(results.path().join(WRONGLY_ACCEPTED_DIR).is_dir());
        assert!(results.path().join(WRONGLY_REJECTED_DIR).is_dir());
    }

    #[test]
    fn test_save_load_reproduces_scores() {
        let pool = pool();
        let detector = fitted(&pool);
        let dir = TempDir::new().unwrap();
        let model_dir = dir.path().join("model");
        detector.save(&model_dir).unwrap();
        for file in [OUTLIER_OPT_FILE, CLASS_MAPPING_FILE, "feature_extractor.json", "aggregator.json"] {
            assert!(model_dir.join(file).exists(), "{file}");
        }

        let loaded = OutlierDetector::load(&model_dir).unwrap();
        assert_eq!(loaded.method(), OutlierMethod::ByDistance);
        assert_eq!(loaded.options(), detector.options());
        let tags = test_tags();
        assert_eq!(
            loaded.score_tags(&tags, &pool).unwrap(),
            detector.score_tags(&tags, &pool).unwrap()
        );
    }

    #[test]
    fn test_tags_without_features_are_skipped() {
        let pool = pool();
        let detector = fitted(&pool);
        let tiny = MemoryTag::new("tiny", DynamicImage::ImageLuma8(GrayImage::new(4, 4)), 0);
        let tags = vec![tiny.into_ref(), tag(30, false, 0)];
        let (indices, scores) = detector.score_tags(&tags, &pool).unwrap();
        assert_eq!(indices, vec![1]);
        assert_eq!(scores.len(), 1);
        assert!(matches!(
            detector.score_tags(&tags[..1], &pool),
            Err(MlError::NoFeatures(_))
        ));
    }
}
