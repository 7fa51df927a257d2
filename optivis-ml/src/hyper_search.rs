//! Cross-validated hyperparameter search for a single model family.
//!
//! The `param_grid` option maps model option names to candidate lists. Each
//! grid point overrides those options, the model config is rebuilt from the
//! merged options and scored by stratified k-fold macro-F1. The winner is
//! refit on all data.

use crate::error::MlError;
use crate::grid::{ConcreteConfig, Configuration};
use crate::metrics::macro_f1;
use crate::models::{Model, ModelConfig};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Option naming the hyperparameter grid.
pub const PARAM_GRID: &str = "param_grid";

/// Seed of randomised search sampling.
const RANDOM_SEARCH_SEED: u64 = 42;

fn default_cv() -> usize {
    3
}

/// The hyperparameter-search block of a concrete configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperSearchSpec {
    pub param_grid: Configuration,
    /// Sample this many grid points instead of trying all of them.
    #[serde(default)]
    pub n_iter: Option<usize>,
    #[serde(default = "default_cv")]
    pub cv: usize,
}

/// Winner of a hyperparameter search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperSearchResult {
    pub best_params: ConcreteConfig,
    pub best_score: f64,
}

impl HyperSearchSpec {
    /// The search block of `options`, if it declares a `param_grid`.
    pub fn from_options(options: &ConcreteConfig) -> Result<Option<Self>, MlError> {
        if options.get(PARAM_GRID).is_none() {
            return Ok(None);
        }
        options.extract().map(Some)
    }

    /// Grid points to try, in grid order or as a seeded random sample.
    pub fn candidates(&self) -> Vec<ConcreteConfig> {
        let keys: Vec<&str> = self.param_grid.keys().map(String::as_str).collect();
        let all = self.param_grid.expand(&keys);
        match self.n_iter {
            Some(n) if n < all.len() => {
                let mut rng = StdRng::seed_from_u64(RANDOM_SEARCH_SEED);
                sample(&mut rng, all.len(), n)
                    .into_iter()
                    .map(|i| all[i].clone())
                    .collect()
            }
            _ => all,
        }
    }

    /// Score every candidate on `x`/`y`, then refit the best on all data.
    pub fn run(
        &self,
        base: &ConcreteConfig,
        x: &[Vec<f64>],
        y: &[i64],
    ) -> Result<(HyperSearchResult, ModelConfig, Model), MlError> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(MlError::config("param_grid yields no candidates"));
        }
        let folds = stratified_folds(y, self.cv.max(2).min(y.len()));
        tracing::info!(
            candidates = candidates.len(),
            folds = folds.len(),
            "Running hyperparameter search"
        );

        let scored: Vec<(ConcreteConfig, f64)> = candidates
            .into_par_iter()
            .map(|params| -> Result<(ConcreteConfig, f64), MlError> {
                let config = ModelConfig::from_options(&merged(base, &params))?;
                let score = cross_validate(&config, x, y, &folds)?;
                tracing::debug!(params = %params, score, "Scored hyperparameters");
                Ok((params, score))
            })
            .collect::<Result<_, MlError>>()?;

        let mut best = &scored[0];
        for entry in &scored[1..] {
            if entry.1 > best.1 {
                best = entry;
            }
        }
        let (best_params, best_score) = best.clone();
        let config = ModelConfig::from_options(&merged(base, &best_params))?;
        let model = Model::fit(&config, x, y)?;
        tracing::info!(params = %best_params, score = best_score, "Best hyperparameters");
        Ok((
            HyperSearchResult {
                best_params,
                best_score,
            },
            config,
            model,
        ))
    }
}

/// `base` with the `params` overrides applied.
pub fn merged(base: &ConcreteConfig, params: &ConcreteConfig) -> ConcreteConfig {
    let mut out = base.clone();
    for (key, value) in params.iter() {
        out.insert(key, value.clone());
    }
    out
}

/// Test-fold indices; each class is dealt round-robin over the folds.
fn stratified_folds(y: &[i64], k: usize) -> Vec<Vec<usize>> {
    let mut folds = vec![Vec::new(); k.max(1)];
    let mut labels = y.to_vec();
    labels.sort_unstable();
    labels.dedup();
    let mut next = 0;
    for label in labels {
        for (i, _) in y.iter().enumerate().filter(|(_, l)| **l == label) {
            folds[next % k.max(1)].push(i);
            next += 1;
        }
    }
    folds.iter_mut().for_each(|f| f.sort_unstable());
    folds.retain(|f| !f.is_empty());
    folds
}

fn cross_validate(
    config: &ModelConfig,
    x: &[Vec<f64>],
    y: &[i64],
    folds: &[Vec<usize>],
) -> Result<f64, MlError> {
    let mut total = 0.0;
    for test in folds {
        let mut in_test = vec![false; y.len()];
        test.iter().for_each(|&i| in_test[i] = true);
        let train: Vec<usize> = (0..y.len()).filter(|&i| !in_test[i]).collect();
        if train.is_empty() {
            return Err(MlError::config("cross-validation fold leaves no training data"));
        }
        let pick_x = |idx: &[usize]| idx.iter().map(|&i| x[i].clone()).collect::<Vec<_>>();
        let pick_y = |idx: &[usize]| idx.iter().map(|&i| y[i]).collect::<Vec<_>>();
        let model = Model::fit(config, &pick_x(&train), &pick_y(&train))?;
        total += macro_f1(&pick_y(test), &model.predict(&pick_x(test))?)?;
    }
    Ok(total / folds.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::blobs;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn base() -> ConcreteConfig {
        ConcreteConfig::new().with("clf_type", "knn").with(
            PARAM_GRID,
            json!({"n_neighbours": [1, 3, 5], "seed": [0, 1]}),
        )
    }

    #[test]
    fn test_spec_absent_without_grid() {
        assert_eq!(HyperSearchSpec::from_options(&ConcreteConfig::new()).unwrap(), None);
        let spec = HyperSearchSpec::from_options(&base()).unwrap().unwrap();
        assert_eq!(spec.cv, 3);
        assert_eq!(spec.candidates().len(), 6);
    }

    #[test]
    fn test_randomised_search_is_seeded() {
        let mut options = base();
        options.insert("n_iter", 2);
        let spec = HyperSearchSpec::from_options(&options).unwrap().unwrap();
        let first = spec.candidates();
        assert_eq!(first.len(), 2);
        assert_eq!(first, spec.candidates());
    }

    #[test]
    fn test_stratified_folds_cover_all_rows() {
        let y = vec![0, 0, 0, 1, 1, 1];
        let folds = stratified_folds(&y, 3);
        assert_eq!(folds.len(), 3);
        let mut all: Vec<usize> = folds.concat();
        all.sort_unstable();
        assert_eq!(all, (0..6).collect::<Vec<_>>());
        assert!(folds.iter().all(|f| f.len() == 2));
    }

    #[test]
    fn test_run_refits_best() {
        let (x, y) = blobs(9);
        let spec = HyperSearchSpec::from_options(&base()).unwrap().unwrap();
        let (result, config, model) = spec.run(&base(), &x, &y).unwrap();
        assert_eq!(result.best_score, 1.0);
        // The first perfect grid point wins.
        assert_eq!(result.best_params.get("n_neighbours"), Some(&json!(1)));
        assert_eq!(config.kind(), crate::models::ModelKind::Knn);
        assert_eq!(model.predict(&x).unwrap(), y);
    }
}
