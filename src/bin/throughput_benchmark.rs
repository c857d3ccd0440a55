//! Throughput Benchmark
//!
//! Runs every test image of the requested categories through the asynchronous
//! inference queue, first with bare inference and then while writing the
//! anomaly-map and overlay images, and reports latency and throughput.
//!
//! Usage:
//!   cargo run --release --bin throughput_benchmark -- -c bottle cable -t fp16

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use clap::Parser;
use colored::Colorize;

use anomaly_bench::export::Precision;
use anomaly_bench::inference::{run_benchmark, BenchmarkOptions, BenchmarkOutcome, BenchmarkReport};
use anomaly_bench::utils::logging::{init_logging, LogConfig};
use anomaly_bench::{dispatch, parse_categories, BackendTask, Device, PipelineConfig};

/// Performance test for the anomaly detection inference pipeline
#[derive(Parser, Debug)]
#[command(name = "throughput_benchmark")]
#[command(version)]
#[command(about = "Benchmark exported PatchCore models with an asynchronous inference queue", long_about = None)]
struct Args {
    /// Root of the exported models
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Precision of the exported models to load
    #[arg(short = 't', long, default_value = "fp16")]
    precision: Precision,

    /// Device to run inference on (CPU, GPU[.n], CUDA[.n])
    #[arg(short, long, default_value = "CPU")]
    device: Device,

    /// MVTec AD categories to benchmark
    #[arg(short = 'c', long = "class-name", num_args = 1.., default_value = "bottle")]
    class_name: Vec<String>,

    /// Root of the MVTec AD dataset
    #[arg(long)]
    dataset_root: Option<PathBuf>,

    /// Directory for anomaly-map and overlay images
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Inference workers (default: one per core)
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Skip the result-writing pass
    #[arg(long, default_value = "false")]
    no_save: bool,

    /// Write the measured statistics as JSON
    #[arg(long)]
    report: Option<PathBuf>,

    /// Pipeline configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

struct BenchmarkTask {
    options: BenchmarkOptions,
}

impl BackendTask for BenchmarkTask {
    type Output = anomaly_bench::Result<BenchmarkOutcome>;

    fn run<B: Backend>(self, device: B::Device) -> Self::Output {
        run_benchmark::<B>(&self.options, &device)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&LogConfig::from_verbose(args.verbose)).map_err(anyhow::Error::msg)?;

    let categories = parse_categories(&args.class_name)?;
    let mut config =
        PipelineConfig::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(model) = args.model {
        config.paths.model_root = model;
    }
    if let Some(root) = args.dataset_root {
        config.paths.dataset_root = root;
    }
    if let Some(dir) = args.results_dir {
        config.paths.results_dir = dir;
    }
    if let Some(workers) = args.workers {
        config.runtime.num_workers = Some(workers);
    }
    let save_results = !args.no_save;
    if save_results {
        config
            .ensure_output_dirs()
            .context("Failed to create result directories")?;
    }

    let num_workers = config.runtime.resolve_workers();
    println!("{}", "Initializing Benchmark...".green().bold());
    println!("  Device: {}", args.device);
    println!("  Precision: {}", args.precision);
    println!("  Workers: {}", num_workers);
    println!("  Categories: {}", args.class_name.join(", "));

    let options = BenchmarkOptions {
        categories,
        precision: args.precision,
        model_root: config.paths.model_root.clone(),
        dataset_root: config.paths.dataset_root.clone(),
        anomaly_map_dir: config.anomaly_map_dir(),
        overlay_dir: config.overlay_dir(),
        num_workers,
        queue_depth_per_worker: config.runtime.queue_depth_per_worker,
        save_results,
    };

    let outcome = dispatch(args.device, BenchmarkTask { options })?.context("Benchmark failed")?;

    if let Some(path) = args.report {
        let report = BenchmarkReport::new(
            args.device.to_string(),
            args.precision.to_string(),
            num_workers,
            outcome.runs,
            &outcome.aggregate,
        );
        report
            .save(&path)
            .with_context(|| format!("Failed to write report {:?}", path))?;
        println!("  Saved results to: {:?}", path);
    }

    Ok(())
}
