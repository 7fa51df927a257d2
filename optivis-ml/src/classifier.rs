//! Classification candidate: one model fitted on aggregated features.

use crate::dataset::ClassMapping;
use crate::error::MlError;
use crate::grid::ConcreteConfig;
use crate::hyper_search::{HyperSearchResult, HyperSearchSpec, merged};
use crate::metrics::{ClassificationReport, ConfusionMatrix};
use crate::models::{Model, ModelConfig, argmax};
use crate::persistence::{atomic_write_json, replace_dir_atomically, require_json};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CLASSIFIER_FILE: &str = "classifier.json";
pub const CLASS_MAPPING_FILE: &str = "class_mapping.json";
pub const PIPELINE_OPT_FILE: &str = "pipeline_opt.json";

/// Result of [`Classifier::evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub report: ClassificationReport,
    pub confusion: ConfusionMatrix,
}

impl Evaluation {
    /// The ranking metric of supervised search.
    pub fn macro_f1(&self) -> f64 {
        self.report.macro_f1()
    }

    pub fn render(&self, mapping: &ClassMapping) -> String {
        format!(
            "{}\n{}",
            self.report.render(|l| mapping.display(l)),
            self.confusion.render(|l| mapping.display(l))
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClassifierState {
    config: ModelConfig,
    model: Model,
    #[serde(default)]
    hyper_search: Option<HyperSearchResult>,
}

/// A model family selected by `clf_type`, its fitted state and class mapping.
#[derive(Debug, Clone)]
pub struct Classifier {
    options: ConcreteConfig,
    config: ModelConfig,
    class_mapping: ClassMapping,
    model: Option<Model>,
    supports_proba: bool,
    hyper_search: Option<HyperSearchResult>,
}

impl Classifier {
    /// Resolve the model family; unknown `clf_type` values fail here.
    pub fn new(options: &ConcreteConfig, class_mapping: ClassMapping) -> Result<Self, MlError> {
        Ok(Self {
            config: ModelConfig::from_options(options)?,
            options: options.clone(),
            class_mapping,
            model: None,
            supports_proba: false,
            hyper_search: None,
        })
    }

    pub fn options(&self) -> &ConcreteConfig {
        &self.options
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn class_mapping(&self) -> &ClassMapping {
        &self.class_mapping
    }

    pub fn hyper_search(&self) -> Option<&HyperSearchResult> {
        self.hyper_search.as_ref()
    }

    /// Whether confidences come from class probabilities.
    pub fn supports_proba(&self) -> bool {
        self.supports_proba
    }

    fn install(&mut self, model: Model) {
        self.supports_proba = model.as_proba().is_some();
        self.model = Some(model);
    }

    /// Fit on `x`/`y`, running the hyperparameter search when configured.
    pub fn fit(&mut self, x: &[Vec<f64>], y: &[i64]) -> Result<(), MlError> {
        if let Some(unknown) = y.iter().find(|l| !self.class_mapping.accepts(**l)) {
            return Err(MlError::invalid_input(format!(
                "label {unknown} is not in the class mapping"
            )));
        }
        match HyperSearchSpec::from_options(&self.options)? {
            Some(spec) => {
                let (result, config, model) = spec.run(&self.options, x, y)?;
                self.options = merged(&self.options, &result.best_params);
                self.config = config;
                self.hyper_search = Some(result);
                self.install(model);
            }
            None => {
                let model = Model::fit(&self.config, x, y)?;
                self.install(model);
            }
        }
        Ok(())
    }

    fn model(&self) -> Result<&Model, MlError> {
        self.model
            .as_ref()
            .ok_or_else(|| MlError::not_fitted(format!("{} classifier", self.config.kind())))
    }

    pub fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i64>, MlError> {
        self.model()?.predict(x)
    }

    /// Labels with the maximum class probability as confidence.
    ///
    /// Models without probability estimates report full confidence.
    pub fn predict_with_confidence(&self, x: &[Vec<f64>]) -> Result<Vec<(i64, f64)>, MlError> {
        let model = self.model()?;
        match model.as_proba() {
            Some(proba) => {
                let classes = proba.classes();
                Ok(proba
                    .predict_proba(x)?
                    .iter()
                    .map(|p| {
                        let best = argmax(p);
                        (classes[best], p[best])
                    })
                    .collect())
            }
            None => Ok(model.predict(x)?.into_iter().map(|l| (l, 1.0)).collect()),
        }
    }

    pub fn evaluate(&self, x: &[Vec<f64>], y: &[i64]) -> Result<Evaluation, MlError> {
        let predicted = self.predict(x)?;
        Ok(Evaluation {
            report: ClassificationReport::compute(y, &predicted)?,
            confusion: ConfusionMatrix::compute(y, &predicted)?,
        })
    }

    /// Write mapping, options and model state into an existing directory.
    pub(crate) fn write_into(&self, dir: &Path) -> Result<(), MlError> {
        let state = ClassifierState {
            config: self.config.clone(),
            model: self.model()?.clone(),
            hyper_search: self.hyper_search.clone(),
        };
        self.class_mapping.save(&dir.join(CLASS_MAPPING_FILE))?;
        atomic_write_json(&dir.join(PIPELINE_OPT_FILE), &self.options)?;
        atomic_write_json(&dir.join(CLASSIFIER_FILE), &state)?;
        Ok(())
    }

    /// Replace `dir` with this classifier's artifacts.
    pub fn save(&self, dir: &Path) -> Result<(), MlError> {
        replace_dir_atomically(dir, |staging| self.write_into(staging))
    }

    pub fn load(dir: &Path) -> Result<Self, MlError> {
        let state: ClassifierState = require_json(&dir.join(CLASSIFIER_FILE))?;
        let mut classifier = Self {
            options: require_json(&dir.join(PIPELINE_OPT_FILE))?,
            config: state.config,
            class_mapping: ClassMapping::load(&dir.join(CLASS_MAPPING_FILE))?,
            model: None,
            supports_proba: false,
            hyper_search: state.hyper_search,
        };
        classifier.install(state.model);
        Ok(classifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::blobs;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn mapping() -> ClassMapping {
        ClassMapping::new([("a", 0), ("b", 1), ("c", 2)]).unwrap()
    }

    fn fitted(clf_type: &str) -> (Classifier, Vec<Vec<f64>>, Vec<i64>) {
        let (x, y) = blobs(10);
        let options = ConcreteConfig::new()
            .with("clf_type", clf_type)
            .with("n_estimators", 10);
        let mut clf = Classifier::new(&options, mapping()).unwrap();
        clf.fit(&x, &y).unwrap();
        (clf, x, y)
    }

    #[test]
    fn test_unknown_type_fails_at_construction() {
        let options = ConcreteConfig::new().with("clf_type", "perceptron_3000");
        assert!(matches!(
            Classifier::new(&options, mapping()),
            Err(MlError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_confidence_from_probabilities() {
        let (clf, x, _) = fitted("rf");
        assert!(clf.supports_proba());
        let out = clf.predict_with_confidence(&x).unwrap();
        assert!(out.iter().all(|(_, c)| *c > 0.0 && *c <= 1.0));
        let labels: Vec<i64> = out.iter().map(|(l, _)| *l).collect();
        assert_eq!(labels, clf.predict(&x).unwrap());
    }

    #[test]
    fn test_full_confidence_without_probabilities() {
        let (clf, x, _) = fitted("svm");
        assert!(!clf.supports_proba());
        assert!(clf.predict_with_confidence(&x).unwrap().iter().all(|(_, c)| *c == 1.0));
    }

    #[test]
    fn test_evaluate_scores_macro_f1() {
        let (clf, x, y) = fitted("gaussian_nb");
        let evaluation = clf.evaluate(&x, &y).unwrap();
        assert_eq!(evaluation.macro_f1(), 1.0);
        assert!(evaluation.render(&mapping()).contains("macro avg"));
    }

    #[test]
    fn test_save_load_reproduces_predictions() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("model");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale.txt"), "old").unwrap();

        let (clf, x, _) = fitted("xgboost");
        clf.save(&target).unwrap();
        assert!(!target.join("stale.txt").exists());

        let loaded = Classifier::load(&target).unwrap();
        assert_eq!(loaded.predict(&x).unwrap(), clf.predict(&x).unwrap());
        assert_eq!(
            loaded.predict_with_confidence(&x).unwrap(),
            clf.predict_with_confidence(&x).unwrap()
        );
        assert_eq!(loaded.options(), clf.options());
    }

    #[test]
    fn test_hyper_search_records_winner() {
        let (x, y) = blobs(9);
        let options = ConcreteConfig::new()
            .with("clf_type", "decision_tree")
            .with(crate::hyper_search::PARAM_GRID, json!({"max_depth": [1, 4]}));
        let mut clf = Classifier::new(&options, mapping()).unwrap();
        clf.fit(&x, &y).unwrap();
        let result = clf.hyper_search().unwrap();
        assert_eq!(result.best_params.get("max_depth"), Some(&json!(4)));
        assert_eq!(clf.options().get("max_depth"), Some(&json!(4)));
    }

    #[test]
    fn test_rejects_labels_outside_mapping() {
        let options = ConcreteConfig::new().with("clf_type", "knn");
        let mut clf = Classifier::new(&options, mapping()).unwrap();
        assert!(matches!(
            clf.fit(&[vec![0.0]], &[9]),
            Err(MlError::InvalidInput(_))
        ));
        assert!(matches!(clf.predict(&[vec![0.0]]), Err(MlError::NotFitted(_))));
    }
}
