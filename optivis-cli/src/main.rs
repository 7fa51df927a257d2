//! Optivis CLI: search, train and evaluate hand-crafted image pipelines.

mod commands;

use clap::{Args, Parser, Subcommand};
use optivis_ml::TagType;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Optivis: pipeline search for image classification and outlier detection
#[derive(Parser, Debug)]
#[command(name = "optivis", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Also write JSON logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Search image-classification pipelines and save the best one
    Train(TrainArgs),
    /// Search outlier-detection pipelines and save the best one
    Outlier(OutlierArgs),
    /// Evaluate a saved classification pipeline on a labeled folder
    Evaluate(EvaluateArgs),
    /// Evaluate a saved outlier detector on a folder with known outliers
    EvaluateOutlier(EvaluateOutlierArgs),
}

/// Options shared by both searches.
#[derive(Args, Debug)]
pub(crate) struct SearchArgs {
    /// Annotation layout of the datasets: image labels [cls] or bounding boxes [box]
    #[arg(long, default_value = "cls", value_parser = parse_tag_type)]
    dataset_type: TagType,

    /// Folder the best model is checkpointed into
    #[arg(short, long)]
    model_folder: PathBuf,

    /// Class mapping JSON (class name -> label id)
    #[arg(short, long)]
    class_mapping: PathBuf,

    /// Search configuration file (.toml or .json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cache calculated features between runs
    #[arg(long)]
    use_cache: bool,
}

#[derive(Args, Debug)]
pub(crate) struct TrainArgs {
    /// Dataset to search on; split into train and test by the run settings
    #[arg(short, long)]
    dataset_folder: PathBuf,

    /// Held-out dataset the best pipeline is evaluated on afterwards
    #[arg(short, long)]
    test_folder: Option<PathBuf>,

    #[command(flatten)]
    search: SearchArgs,
}

#[derive(Args, Debug)]
pub(crate) struct OutlierArgs {
    /// Nominal classes to fit on; classes outside the mapping are ignored
    #[arg(short, long)]
    known_folder: PathBuf,

    /// Tags to rank candidates on; classes outside the mapping are outliers
    #[arg(short, long)]
    test_folder: PathBuf,

    #[command(flatten)]
    search: SearchArgs,
}

#[derive(Args, Debug)]
pub(crate) struct EvaluateArgs {
    #[arg(short, long)]
    model_folder: PathBuf,

    #[arg(short, long)]
    test_folder: PathBuf,

    #[arg(long, default_value = "cls", value_parser = parse_tag_type)]
    dataset_type: TagType,

    /// Settings file for the run options, e.g. extraction workers
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where to write the classification report
    #[arg(long)]
    report_path: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub(crate) struct EvaluateOutlierArgs {
    #[arg(short, long)]
    model_folder: PathBuf,

    #[arg(short, long)]
    test_folder: PathBuf,

    #[arg(long, default_value = "cls", value_parser = parse_tag_type)]
    dataset_type: TagType,

    /// Settings file for the run options, e.g. extraction workers
    #[arg(long)]
    config: Option<PathBuf>,

    /// Folder for the report and the wrongly accepted/rejected tags
    #[arg(long)]
    results_folder: PathBuf,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(env_filter(filter));

    // The guard flushes the file writer on drop and must outlive the run.
    let (json_layer, _guard) = match &cli.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "optivis.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command)
}

fn parse_tag_type(value: &str) -> Result<TagType, String> {
    value.parse().map_err(|e: optivis_ml::MlError| e.to_string())
}

/// `RUST_LOG` wins over the verbosity flags.
fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_train() {
        let cli = Cli::try_parse_from([
            "optivis", "-vv", "train", "-d", "data", "-t", "holdout", "--dataset-type", "box",
            "-m", "model", "-c", "mapping.json", "--use-cache",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        assert_eq!(args.dataset_folder, PathBuf::from("data"));
        assert_eq!(args.test_folder, Some(PathBuf::from("holdout")));
        assert_eq!(args.search.dataset_type, TagType::Box);
        assert!(args.search.use_cache);
        assert!(args.search.config.is_none());
    }

    #[test]
    fn test_parse_outlier_defaults_to_cls() {
        let cli = Cli::try_parse_from([
            "optivis", "outlier", "--known-folder", "known", "--test-folder", "test",
            "--model-folder", "model", "--class-mapping", "mapping.json", "--config", "search.toml",
        ])
        .unwrap();
        let Commands::Outlier(args) = cli.command else {
            panic!("expected outlier");
        };
        assert_eq!(args.search.dataset_type, TagType::Cls);
        assert_eq!(args.search.config, Some(PathBuf::from("search.toml")));
        assert!(!args.search.use_cache);
    }

    #[test]
    fn test_parse_evaluate_outlier_needs_results_folder() {
        let result = Cli::try_parse_from([
            "optivis", "evaluate-outlier", "-m", "model", "-t", "test",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_dataset_type_rejected() {
        let result = Cli::try_parse_from([
            "optivis", "evaluate", "-m", "model", "-t", "test", "--dataset-type", "polygon",
        ]);
        assert!(result.is_err());
    }
}
