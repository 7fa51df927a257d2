//! CLI subcommand handlers.

use crate::{Commands, EvaluateArgs, EvaluateOutlierArgs, OutlierArgs, SearchArgs, TrainArgs};
use anyhow::Context;
use optivis_ml::{
    ClassFilter, ClassMapping, ImageFolderDataset, ImagePipeline, OutlierDetector, OutlierSearch,
    RunConfig, SearchSummary, Settings, SupervisedSearch, TagRef, TagType, load_settings,
};
use optivis_ml::persistence::atomic_write_json;
use std::path::Path;

/// Written next to the checkpoint once a search finishes.
pub const SUMMARY_FILE: &str = "search_summary.json";
/// Report of the held-out evaluation that follows `train`.
pub const TEST_REPORT_FILE: &str = "test_report.txt";

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Train(args) => handle_train(args),
        Commands::Outlier(args) => handle_outlier(args),
        Commands::Evaluate(args) => handle_evaluate(args),
        Commands::EvaluateOutlier(args) => handle_evaluate_outlier(args),
    }
}

fn handle_train(args: TrainArgs) -> anyhow::Result<()> {
    let (settings, mapping) = prepare(&args.search)?;
    let tags = open_tags(&args.dataset_folder, args.search.dataset_type, &mapping, ClassFilter::Known)?;

    let pool = settings.run.extraction_pool()?;
    let search = SupervisedSearch::new(settings.options, mapping.clone(), settings.run);
    let summary = search
        .fit(&args.search.model_folder, &tags)
        .context("Supervised search failed")?;
    write_summary(&summary)?;
    println!(
        "Best macro-F1 {:.3} over {} candidates, saved to {}",
        summary.best_score,
        summary.history.len(),
        summary.model_folder.display()
    );

    if let Some(test_folder) = &args.test_folder {
        let test = open_tags(test_folder, args.search.dataset_type, &mapping, ClassFilter::Known)?;
        let report_path = args.search.model_folder.join(TEST_REPORT_FILE);
        let pipeline = ImagePipeline::load(&args.search.model_folder)
            .context("Failed to reload the best pipeline")?;
        let evaluation = pipeline.evaluate(&test, &pool, Some(&report_path))?;
        println!(
            "Held-out macro-F1 {:.3}, report at {}",
            evaluation.macro_f1(),
            report_path.display()
        );
    }
    Ok(())
}

fn handle_outlier(args: OutlierArgs) -> anyhow::Result<()> {
    let (settings, mapping) = prepare(&args.search)?;
    let dataset_type = args.search.dataset_type;
    let known = open_tags(&args.known_folder, dataset_type, &mapping, ClassFilter::Known)?;
    let test = open_tags(&args.test_folder, dataset_type, &mapping, ClassFilter::All)?;

    let search = OutlierSearch::new(settings.options, mapping, settings.run);
    let summary = search
        .fit(&args.search.model_folder, &known, &test)
        .context("Outlier search failed")?;
    write_summary(&summary)?;
    println!(
        "Best AUROC {:.3} from version {}, saved to {}",
        summary.best_score,
        summary
            .best_version
            .map_or_else(|| "-".to_string(), |v| v.to_string()),
        summary.model_folder.display()
    );
    Ok(())
}

fn handle_evaluate(args: EvaluateArgs) -> anyhow::Result<()> {
    let pipeline = ImagePipeline::load(&args.model_folder)
        .with_context(|| format!("Failed to load pipeline from {}", args.model_folder.display()))?;
    let tags = open_tags(
        &args.test_folder,
        args.dataset_type,
        pipeline.class_mapping(),
        ClassFilter::Known,
    )?;
    let pool = run_config(args.config.as_deref())?.extraction_pool()?;
    let evaluation = pipeline.evaluate(&tags, &pool, args.report_path.as_deref())?;
    println!("{}", evaluation.render(pipeline.class_mapping()));
    Ok(())
}

fn handle_evaluate_outlier(args: EvaluateOutlierArgs) -> anyhow::Result<()> {
    let detector = OutlierDetector::load(&args.model_folder)
        .with_context(|| format!("Failed to load detector from {}", args.model_folder.display()))?;
    let tags = open_tags(
        &args.test_folder,
        args.dataset_type,
        detector.class_mapping(),
        ClassFilter::All,
    )?;
    let pool = run_config(args.config.as_deref())?.extraction_pool()?;
    let evaluation = detector.evaluate(&tags, &args.results_folder, &pool)?;
    println!("{}", evaluation.render());
    Ok(())
}

/// Run options of the layered settings; evaluation ignores the search grid.
fn run_config(config: Option<&Path>) -> anyhow::Result<RunConfig> {
    let settings = load_settings(config).context("Configuration error")?;
    Ok(settings.run)
}

/// Settings with the CLI overrides applied, plus the class mapping.
fn prepare(args: &SearchArgs) -> anyhow::Result<(Settings, ClassMapping)> {
    let mut settings = load_settings(args.config.as_deref()).context("Configuration error")?;
    if args.use_cache {
        settings.run.use_cache = true;
    }
    let mapping = ClassMapping::load(&args.class_mapping).with_context(|| {
        format!("Failed to read class mapping {}", args.class_mapping.display())
    })?;
    tracing::debug!(
        config = ?args.config,
        classes = mapping.len(),
        options = ?settings.options,
        "Loaded search settings"
    );
    Ok((settings, mapping))
}

fn open_tags(
    folder: &Path,
    tag_type: TagType,
    mapping: &ClassMapping,
    filter: ClassFilter,
) -> anyhow::Result<Vec<TagRef>> {
    let dataset = ImageFolderDataset::open(folder, tag_type, mapping, filter)
        .with_context(|| format!("Failed to open dataset {}", folder.display()))?;
    anyhow::ensure!(!dataset.is_empty(), "No tags found in {}", folder.display());
    Ok(dataset.tags())
}

fn write_summary(summary: &SearchSummary) -> anyhow::Result<()> {
    let path = summary.model_folder.join(SUMMARY_FILE);
    atomic_write_json(&path, summary).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use optivis_ml::outlier::detector::OUTLIER_REPORT_FILE;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_class(root: &Path, class: &str, color: [u8; 3], count: usize) {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            let image = RgbImage::from_fn(24, 24, |x, y| {
                let v = ((x + y + i as u32) % 20) as u8;
                Rgb([color[0].saturating_add(v), color[1].saturating_add(v), color[2]])
            });
            image.save(dir.join(format!("{class}_{i}.png"))).unwrap();
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().to_path_buf();
            write_class(&root.join("train"), "red", [200, 0, 0], 10);
            write_class(&root.join("train"), "green", [0, 200, 0], 10);
            write_class(&root.join("test"), "red", [200, 0, 0], 4);
            write_class(&root.join("test"), "green", [0, 200, 0], 4);
            write_class(&root.join("test"), "blue", [0, 0, 200], 4);
            std::fs::write(root.join("mapping.json"), r#"{"red": 0, "green": 1}"#).unwrap();
            std::fs::write(
                root.join("search.toml"),
                r#"
[run]
split_mode = "random"
split_ratio = 0.3
seed = 3

[options]
feature = "rgb"
sampling_step = 8
sampling_window = 12
aggregator = "global_avg"
clf_type = "knn"
n_neighbours = 3
"#,
            )
            .unwrap();
            Self { _dir: dir, root }
        }

        fn search_args(&self) -> SearchArgs {
            SearchArgs {
                dataset_type: TagType::Cls,
                model_folder: self.root.join("model"),
                class_mapping: self.root.join("mapping.json"),
                config: Some(self.root.join("search.toml")),
                use_cache: false,
            }
        }
    }

    #[test]
    fn test_train_then_evaluate() {
        let fx = Fixture::new();
        handle_train(TrainArgs {
            dataset_folder: fx.root.join("train"),
            test_folder: Some(fx.root.join("test")),
            search: fx.search_args(),
        })
        .unwrap();

        let model = fx.root.join("model");
        assert!(model.join(SUMMARY_FILE).exists());
        let report = std::fs::read_to_string(model.join(TEST_REPORT_FILE)).unwrap();
        assert!(report.contains("red"));

        let report_path = fx.root.join("eval.txt");
        handle_evaluate(EvaluateArgs {
            model_folder: model,
            test_folder: fx.root.join("test"),
            dataset_type: TagType::Cls,
            config: Some(fx.root.join("search.toml")),
            report_path: Some(report_path.clone()),
        })
        .unwrap();
        assert!(report_path.exists());
    }

    #[test]
    fn test_outlier_then_evaluate() {
        let fx = Fixture::new();
        handle_outlier(OutlierArgs {
            known_folder: fx.root.join("train"),
            test_folder: fx.root.join("test"),
            search: fx.search_args(),
        })
        .unwrap();

        let summary: SearchSummary = serde_json::from_str(
            &std::fs::read_to_string(fx.root.join("model").join(SUMMARY_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(summary.metric, "auroc");
        assert_eq!(summary.best_version, Some(0));

        let results = fx.root.join("results");
        handle_evaluate_outlier(EvaluateOutlierArgs {
            model_folder: fx.root.join("model"),
            test_folder: fx.root.join("test"),
            dataset_type: TagType::Cls,
            config: None,
            results_folder: results.clone(),
        })
        .unwrap();
        assert!(results.join(OUTLIER_REPORT_FILE).exists());
    }

    #[test]
    fn test_evaluation_reads_run_settings_from_config() {
        let fx = Fixture::new();
        let path = fx.root.join("eval.toml");
        std::fs::write(&path, "[run]\nextraction_workers = 3\n").unwrap();
        let run = run_config(Some(&path)).unwrap();
        assert_eq!(run.extraction_workers, 3);
        assert_eq!(run.extraction_pool().unwrap().current_num_threads(), 3);
    }

    #[test]
    fn test_missing_mapping_is_reported() {
        let fx = Fixture::new();
        let mut search = fx.search_args();
        search.class_mapping = fx.root.join("absent.json");
        let err = handle_train(TrainArgs {
            dataset_folder: fx.root.join("train"),
            test_folder: None,
            search,
        })
        .unwrap_err();
        assert!(err.to_string().contains("class mapping"));
    }

    #[test]
    fn test_empty_dataset_is_an_error() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.root.join("empty")).unwrap();
        let err = open_tags(
            &fx.root.join("empty"),
            TagType::Cls,
            &ClassMapping::new([("red", 0)]).unwrap(),
            ClassFilter::Known,
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("No tags"));
    }
}
