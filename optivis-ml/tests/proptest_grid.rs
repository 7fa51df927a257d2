//! Property-based tests for grid expansion and the train/test split.

use proptest::prelude::*;
use serde_json::{Value, json};

use optivis_ml::dataset::split_tags;
use optivis_ml::grid::{FEATURE_OPTIONS, MODEL_OPTIONS};
use optivis_ml::{Configuration, SplitPolicy, Tier};

fn candidate_list(len: usize, tag: &str) -> Value {
    Value::Array((0..len).map(|i| json!(format!("{tag}{i}"))).collect())
}

// --- Grid expansion properties ---

proptest! {
    #[test]
    fn feature_grid_size_is_product_of_list_lengths(
        features in 1usize..5,
        steps in 1usize..4,
        windows in 1usize..4,
    ) {
        let options = Configuration::new()
            .with("feature", candidate_list(features, "f"))
            .with("sampling_step", candidate_list(steps, "s"))
            .with("sampling_window", candidate_list(windows, "w"))
            .with("clf_type", json!(["knn", "svm"]));
        let configs = options.expand_tier(Tier::Feature);
        prop_assert_eq!(configs.len(), features * steps * windows);
        prop_assert_eq!(options.grid_size(FEATURE_OPTIONS), configs.len());
    }

    #[test]
    fn expansion_leaves_other_tiers_untouched(
        features in 1usize..4,
        models in 1usize..4,
    ) {
        let models_value = candidate_list(models, "m");
        let options = Configuration::new()
            .with("feature", candidate_list(features, "f"))
            .with("clf_type", models_value.clone())
            .with("seed", 42);
        for config in options.expand_tier(Tier::Feature) {
            prop_assert_eq!(config.get("clf_type"), Some(&models_value));
            prop_assert_eq!(config.get("seed"), Some(&json!(42)));
            prop_assert!(config.get("feature").is_some_and(|v| v.is_string()));
        }
    }

    #[test]
    fn expanded_points_are_distinct(features in 1usize..5, models in 1usize..5) {
        let options = Configuration::new()
            .with("feature", candidate_list(features, "f"))
            .with("clf_type", candidate_list(models, "m"));
        let mut points = Vec::new();
        for outer in options.expand_tier(Tier::Feature) {
            points.extend(Configuration::from(outer).expand_tier(Tier::Model));
        }
        prop_assert_eq!(points.len(), features * models);
        prop_assert_eq!(options.grid_size(MODEL_OPTIONS), models);
        for (i, a) in points.iter().enumerate() {
            for b in &points[i + 1..] {
                prop_assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn global_aggregators_ignore_complexity(
        learned in 0usize..3,
        complexities in 1usize..4,
    ) {
        let mut aggregators = vec![json!("global_avg"), json!("global_max")];
        aggregators.extend((0..learned).map(|i| json!(format!("learned{i}"))));
        let options = Configuration::new()
            .with("aggregator", Value::Array(aggregators))
            .with("complexity", candidate_list(complexities, "c"));
        let configs = options.expand_aggregators();
        prop_assert_eq!(configs.len(), 2 + learned * complexities);
        for config in &configs {
            let global = config
                .get_str("aggregator")
                .is_some_and(|a| a.starts_with("global_"));
            prop_assert_eq!(config.get("complexity").is_none(), global);
        }
    }
}

// --- Split properties ---

proptest! {
    #[test]
    fn split_partitions_every_tag(
        n in 0usize..300,
        ratio in 0.0f64..=1.0,
        seed in any::<u64>(),
    ) {
        let tags: Vec<usize> = (0..n).collect();
        for policy in [SplitPolicy::fixed(ratio), SplitPolicy::random(ratio, Some(seed))] {
            let (train, test) = split_tags(&tags, &policy);
            let mut all: Vec<usize> = train.iter().chain(&test).copied().collect();
            all.sort_unstable();
            prop_assert_eq!(all, tags.clone());
        }
    }

    #[test]
    fn fixed_split_is_a_prefix(n in 0usize..300, ratio in 0.0f64..=1.0) {
        let tags: Vec<usize> = (0..n).collect();
        let (train, test) = split_tags(&tags, &SplitPolicy::fixed(ratio));
        prop_assert!(test.iter().all(|&i| (i as f64) / 100.0 < ratio));
        prop_assert!(train.iter().all(|&i| (i as f64) / 100.0 >= ratio));
    }

    #[test]
    fn seeded_random_split_is_reproducible(n in 0usize..200, seed in any::<u64>()) {
        let tags: Vec<usize> = (0..n).collect();
        let policy = SplitPolicy::random(0.2, Some(seed));
        prop_assert_eq!(split_tags(&tags, &policy), split_tags(&tags, &policy));
    }
}

#[test]
fn fixed_split_of_one_hundred_tags() {
    let tags: Vec<usize> = (0..100).collect();
    let (train, test) = split_tags(&tags, &SplitPolicy::fixed(0.2));
    assert_eq!(test, (0..20).collect::<Vec<_>>());
    assert_eq!(train, (20..100).collect::<Vec<_>>());
}
