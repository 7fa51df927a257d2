//! The resolved image-classification pipeline a supervised search produces.

use crate::aggregation::{Aggregator, stack_present};
use crate::classifier::{Classifier, Evaluation};
use crate::dataset::{ClassMapping, TagRef};
use crate::error::MlError;
use crate::features::FeatureExtractor;
use crate::persistence::{atomic_write, replace_dir_atomically};
use image::DynamicImage;
use rayon::ThreadPool;
use std::path::Path;

/// Feature extractor, fitted aggregator and fitted classifier.
#[derive(Debug, Clone)]
pub struct ImagePipeline {
    extractor: FeatureExtractor,
    aggregator: Aggregator,
    classifier: Classifier,
}

impl ImagePipeline {
    pub fn new(extractor: FeatureExtractor, aggregator: Aggregator, classifier: Classifier) -> Self {
        Self {
            extractor,
            aggregator,
            classifier,
        }
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn class_mapping(&self) -> &ClassMapping {
        self.classifier.class_mapping()
    }

    /// Label and confidence for one image, `None` when it has no features.
    pub fn predict_image(&self, image: &DynamicImage) -> Result<Option<(i64, f64)>, MlError> {
        let Some(rows) = self.extractor.extract_x(image)? else {
            return Ok(None);
        };
        let representation = self.aggregator.aggregate(&rows)?;
        let mut predictions = self.classifier.predict_with_confidence(&[representation])?;
        Ok(predictions.pop())
    }

    /// Evaluate on `tags`, optionally writing the report to `report_path`.
    ///
    /// Tags without a representation are left out of the report.
    pub fn evaluate(
        &self,
        tags: &[TagRef],
        pool: &ThreadPool,
        report_path: Option<&Path>,
    ) -> Result<Evaluation, MlError> {
        let features = self.extractor.extract_trainings_data(tags, pool)?;
        let representations = self.aggregator.transform(&features.features)?;
        let (x, y) = stack_present(&representations, &features.labels)?;
        let evaluation = self.classifier.evaluate(&x, &y)?;
        tracing::info!(
            tags = tags.len(),
            scored = y.len(),
            macro_f1 = evaluation.macro_f1(),
            "Evaluated pipeline"
        );
        if let Some(path) = report_path {
            let text = evaluation.render(self.class_mapping());
            atomic_write(path, text.as_bytes())?;
        }
        Ok(evaluation)
    }

    pub(crate) fn write_into(&self, dir: &Path) -> Result<(), MlError> {
        self.classifier.write_into(dir)?;
        self.aggregator.save(dir)?;
        self.extractor.save(dir)
    }

    /// Replace `dir` with this pipeline's artifacts.
    pub fn save(&self, dir: &Path) -> Result<(), MlError> {
        replace_dir_atomically(dir, |staging| self.write_into(staging))
    }

    pub fn load(dir: &Path) -> Result<Self, MlError> {
        Ok(Self {
            extractor: FeatureExtractor::load(dir)?,
            aggregator: Aggregator::load(dir)?,
            classifier: Classifier::load(dir)?,
        })
    }
}
