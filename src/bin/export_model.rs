//! Model Export Tool
//!
//! Fits a PatchCore model on the MVTec AD training images of each requested
//! category and writes the IR to `<output>/<category>/<precision>/`.
//!
//! Usage:
//!   cargo run --release --bin export_model -- -c bottle cable -t int8_ptq -e

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use clap::Parser;
use colored::Colorize;

use anomaly_bench::export::{export_category, ExportOptions, ExportReport, Precision};
use anomaly_bench::utils::format_duration;
use anomaly_bench::utils::logging::{init_logging, LogConfig};
use anomaly_bench::{dispatch, parse_categories, BackendTask, Device, PipelineConfig};

/// Export PatchCore models for MVTec AD categories
#[derive(Parser, Debug)]
#[command(name = "export_model")]
#[command(version)]
#[command(about = "Fit PatchCore on MVTec AD and export the inference IR", long_about = None)]
struct Args {
    /// Reference images for the memory bank (0 = all training images)
    #[arg(short, long, default_value = "0")]
    k_shot: usize,

    /// MVTec AD categories to export
    #[arg(short = 'c', long = "class-name", num_args = 1.., default_value = "bottle")]
    class_name: Vec<String>,

    /// Export precision: fp32, fp16, int8, int8_ptq or int8_acq
    #[arg(short = 't', long = "export-type", default_value = "fp16")]
    export_type: Precision,

    /// Output root for exported models
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Fit image and pixel thresholds on the test split
    #[arg(short = 'e', long, default_value = "false")]
    export_threshold: bool,

    /// Batch size for embedding extraction
    #[arg(short, long, default_value = "32")]
    batch_size: usize,

    /// Device used to fit the model (CPU, GPU[.n], CUDA[.n])
    #[arg(short, long, default_value = "CPU")]
    device: Device,

    /// Root of the MVTec AD dataset
    #[arg(long)]
    dataset_root: Option<PathBuf>,

    /// Pipeline configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fraction of patch embeddings kept in the memory bank
    #[arg(long)]
    coreset_ratio: Option<f64>,

    /// Burn record with pretrained backbone weights
    #[arg(long)]
    backbone_weights: Option<PathBuf>,

    /// Random seed for coreset selection
    #[arg(long)]
    seed: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

struct ExportTask {
    jobs: Vec<ExportOptions>,
}

impl BackendTask for ExportTask {
    type Output = anomaly_bench::Result<Vec<ExportReport>>;

    fn run<B: Backend>(self, device: B::Device) -> Self::Output {
        let mut reports = Vec::with_capacity(self.jobs.len());
        for options in &self.jobs {
            println!(
                "\n{} {} {}-shot at {}",
                "Starting export IR for".green().bold(),
                options.category.to_string().bold(),
                options.k_shot,
                options.precision
            );
            let report = export_category::<B>(options, &device)?;
            print_report(&report);
            reports.push(report);
        }
        Ok(reports)
    }
}

fn print_report(report: &ExportReport) {
    println!("  Exported IR path: {}", report.path.display().to_string().cyan());
    if report.effective_precision != report.precision {
        println!("  Selected precision: {}", report.effective_precision.to_string().yellow());
    }
    println!("  Memory bank rows: {}", report.bank_rows);
    if let Some(auroc) = report.metrics.reference_auroc {
        println!("  Image AUROC (fp32): {:.4}", auroc);
    }
    if let Some(auroc) = report.metrics.exported_auroc {
        println!("  Image AUROC (exported): {:.4}", auroc);
    }
    println!("  Took {}", format_duration(report.elapsed_secs));
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&LogConfig::from_verbose(args.verbose)).map_err(anyhow::Error::msg)?;

    let categories = parse_categories(&args.class_name)?;
    let mut config =
        PipelineConfig::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(root) = args.dataset_root {
        config.paths.dataset_root = root;
    }
    if let Some(output) = args.output {
        config.paths.model_root = output;
    }
    if let Some(ratio) = args.coreset_ratio {
        config.model.coreset_ratio = ratio;
    }
    if let Some(weights) = args.backbone_weights {
        config.model.backbone_weights = Some(weights);
    }
    if let Some(seed) = args.seed {
        config.model.seed = seed;
    }
    config.validate().context("Invalid configuration")?;

    println!("{}", "PatchCore IR Export".green().bold());
    println!("  Device: {}", args.device);
    println!("  Categories: {}", args.class_name.join(", "));
    println!("  Precision: {}", args.export_type);
    println!("  Dataset: {:?}", config.paths.dataset_root);

    let jobs = categories
        .into_iter()
        .map(|category| ExportOptions {
            category,
            precision: args.export_type,
            k_shot: args.k_shot,
            batch_size: args.batch_size,
            dataset_root: config.paths.dataset_root.clone(),
            output_root: config.paths.model_root.clone(),
            export_threshold: args.export_threshold,
            model: config.model.clone(),
        })
        .collect();

    let reports = dispatch(args.device, ExportTask { jobs })?.context("Export failed")?;

    let total: f64 = reports.iter().map(|r| r.elapsed_secs).sum();
    println!(
        "\n{} {} model(s) in {}",
        "✓ Exported".green().bold(),
        reports.len(),
        format_duration(total)
    );
    Ok(())
}
