//! graphtune command line.
//!
//! Subcommands over the core library: launch trainer runs, build and verify
//! scene datasets, and debug the reward shape offline.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use graphtune_core::config::LaunchConfig;
use graphtune_core::dataset;
use graphtune_core::launch::{self, TrainerCommand};
use graphtune_core::reward::{self, RewardInput};
use graphtune_core::RewardKwargs;

#[derive(Parser)]
#[command(
    name = "graphtune",
    about = "Launch and support DAPO fine-tuning runs for scene-graph VLMs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the external trainer from a TOML launch config
    Train {
        /// Launch config file
        #[arg(long)]
        config: PathBuf,

        /// Typed config overrides, validated against the config namespace
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Raw trainer overrides appended after the config-derived tokens
        #[arg(value_name = "KEY=VALUE")]
        extra: Vec<String>,

        /// Print the assembled command without spawning
        #[arg(long)]
        dry_run: bool,

        /// Skip existence checks for referenced files
        #[arg(long)]
        skip_file_checks: bool,
    },

    /// Build train/val JSONL manifests from raw scene folders
    BuildData {
        /// Base folders to scan for scene directories
        #[arg(long, required = true, num_args = 1..)]
        scenes: Vec<PathBuf>,

        /// Output directory for train.jsonl and val.jsonl
        #[arg(long)]
        out: PathBuf,

        #[arg(long, default_value_t = 0.95)]
        train_ratio: f64,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Only process the first N scenes
        #[arg(long)]
        max_scenes: Option<usize>,
    },

    /// Verify a JSONL manifest
    CheckData {
        /// Manifest file to verify
        manifest: PathBuf,
    },

    /// Report the structure of a raw scene tree
    InspectData {
        /// Root of the raw scene tree
        root: PathBuf,
    },

    /// Score a JSONL file of response/ground_truth pairs offline
    Score {
        /// JSONL file of {"response": ..., "ground_truth": ...} objects
        input: PathBuf,

        #[arg(long, default_value_t = 2048)]
        max_response_length: u32,

        #[arg(long, default_value_t = 512)]
        overlong_buffer_length: u32,

        #[arg(long, default_value_t = 1.0)]
        overlong_penalty_factor: f64,

        #[arg(long, default_value_t = 0.2)]
        format_weight: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train {
            config,
            set,
            extra,
            dry_run,
            skip_file_checks,
        } => run_train(config, set, extra, dry_run, skip_file_checks).await,
        Commands::BuildData {
            scenes,
            out,
            train_ratio,
            seed,
            max_scenes,
        } => run_build_data(scenes, out, train_ratio, seed, max_scenes),
        Commands::CheckData { manifest } => run_check_data(manifest),
        Commands::InspectData { root } => run_inspect_data(root),
        Commands::Score {
            input,
            max_response_length,
            overlong_buffer_length,
            overlong_penalty_factor,
            format_weight,
        } => run_score(
            input,
            RewardKwargs {
                max_response_length,
                overlong_buffer_length,
                overlong_penalty_factor,
                format_weight,
            },
        ),
    }
}

async fn run_train(
    config_path: PathBuf,
    set: Vec<String>,
    extra: Vec<String>,
    dry_run: bool,
    skip_file_checks: bool,
) -> Result<()> {
    let config = LaunchConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let config = config.apply_overrides(&set)?;
    config.validate(!skip_file_checks && !dry_run)?;

    let command = TrainerCommand::from_config(&config)?.with_extra_overrides(&extra);

    if dry_run {
        println!("{}", command.rendered());
        return Ok(());
    }

    let outcome = launch::launch(&command, &config.trainer.experiment_name).await?;
    if outcome.exit_code != 0 {
        std::process::exit(outcome.exit_code);
    }
    Ok(())
}

fn run_build_data(
    scenes: Vec<PathBuf>,
    out: PathBuf,
    train_ratio: f64,
    seed: u64,
    max_scenes: Option<usize>,
) -> Result<()> {
    let report = dataset::build_manifests(&scenes, &out, train_ratio, seed, max_scenes)?;
    info!(
        scanned = report.scanned,
        built = report.built,
        skipped = report.skipped,
        "dataset build finished"
    );
    println!(
        "{} train -> {}\n{} val -> {}",
        report.train, report.train_manifest, report.val, report.val_manifest
    );
    if report.skipped > 0 {
        println!("{} scenes skipped (see warnings above)", report.skipped);
    }
    Ok(())
}

fn run_check_data(manifest: PathBuf) -> Result<()> {
    let report = dataset::check_manifest(&manifest)?;
    println!("records: {}", report.records);
    println!("expected columns: {}", dataset::MANIFEST_COLUMNS.join(", "));
    if let Some(preview) = &report.preview {
        println!("first record: {}", preview);
    }
    for finding in &report.column_errors {
        println!("column error: {}", finding);
    }
    if !report.missing_images.is_empty() {
        println!("missing images ({}):", report.missing_images.len());
        for image in &report.missing_images {
            println!("  {}", image);
        }
    }
    if !report.is_clean() {
        bail!(
            "manifest has {} findings",
            report.column_errors.len() + report.missing_images.len()
        );
    }
    println!("manifest ok");
    Ok(())
}

fn run_inspect_data(root: PathBuf) -> Result<()> {
    let report = dataset::inspect_tree(&root)?;
    println!("json files: {}", report.json_files);
    for sample in &report.samples {
        println!("file: {}", sample.path);
        println!(
            "  rgb: {} ({} files)",
            if sample.has_rgb { "yes" } else { "no" },
            sample.rgb_files
        );
        if let Some(len) = sample.list_len {
            println!("  list of {} entries", len);
        }
        if !sample.keys.is_empty() {
            println!("  keys: {}", sample.keys.join(", "));
        }
        if let Some(task) = &sample.task_preview {
            println!("  task: {}", task);
        }
    }
    println!("directory patterns:");
    for pattern in report.patterns.iter().take(10) {
        println!("  {}/", pattern);
    }
    Ok(())
}

fn run_score(input: PathBuf, kwargs: RewardKwargs) -> Result<()> {
    let raw =
        fs::read_to_string(&input).with_context(|| format!("reading {}", input.display()))?;
    let mut inputs = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let item: RewardInput = serde_json::from_str(line)
            .with_context(|| format!("line {}: expected {{response, ground_truth}}", idx + 1))?;
        inputs.push(item);
    }
    if inputs.is_empty() {
        bail!("no reward inputs in {}", input.display());
    }

    let scores = reward::compute_score(&inputs, &kwargs);
    for (idx, score) in scores.iter().enumerate() {
        println!(
            "[{}] overall={:.3} format={:.1} accuracy={:.2} overlong={:.3}",
            idx, score.overall, score.format, score.accuracy, score.overlong
        );
    }

    let n = scores.len() as f64;
    let mean_overall: f64 = scores.iter().map(|s| s.overall).sum::<f64>() / n;
    let mean_accuracy: f64 = scores.iter().map(|s| s.accuracy_normalized).sum::<f64>() / n;
    println!(
        "scored {} responses: mean overall={:.3} mean normalized accuracy={:.3}",
        scores.len(),
        mean_overall,
        mean_accuracy
    );
    Ok(())
}
