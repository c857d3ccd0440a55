//! Interactive Anomaly Detection Demo
//!
//! Shows random test images of one category next to the predicted defect
//! overlay until Esc is pressed.
//!
//! Usage:
//!   cargo run --release --bin demo
//!   cargo run --release --bin demo -- -c screw --headless --frames 20 --seed 1

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use clap::Parser;
use colored::Colorize;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use anomaly_bench::config::DisplayConfig;
use anomaly_bench::demo::{prompt_category, DemoRunner, FrameSink, HeadlessSink};
use anomaly_bench::export::Precision;
use anomaly_bench::utils::logging::{init_logging, LogConfig};
use anomaly_bench::{
    dispatch, BackendTask, Category, CompiledModel, Device, MvtecDataset, PipelineConfig, Split,
};

/// Live anomaly detection demo on MVTec AD
#[derive(Parser, Debug)]
#[command(name = "demo")]
#[command(version)]
#[command(about = "Interactive PatchCore demo on random MVTec AD test images", long_about = None)]
struct Args {
    /// Root of the exported models
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Precision of the exported model to load
    #[arg(short = 't', long, default_value = "fp16")]
    precision: Precision,

    /// Device to run inference on (CPU, GPU[.n], CUDA[.n])
    #[arg(short, long, default_value = "CPU")]
    device: Device,

    /// Category to show; prompts with a numbered menu when omitted
    #[arg(short = 'c', long = "class-name")]
    class_name: Option<Category>,

    /// Root of the MVTec AD dataset
    #[arg(long)]
    dataset_root: Option<PathBuf>,

    /// Seed for the sample order
    #[arg(long)]
    seed: Option<u64>,

    /// Write frames to disk instead of opening a window
    #[arg(long, default_value = "false")]
    headless: bool,

    /// Frames to render in headless mode
    #[arg(long, default_value = "10")]
    frames: usize,

    /// Pipeline configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

struct DemoTask {
    category: Category,
    precision: Precision,
    config: PipelineConfig,
    seed: Option<u64>,
    headless: bool,
    frames: usize,
}

impl BackendTask for DemoTask {
    type Output = anomaly_bench::Result<usize>;

    fn run<B: Backend>(self, device: B::Device) -> Self::Output {
        let model = CompiledModel::<B>::load(&self.config.paths.model_root, self.category, self.precision, &device)?;
        let image_size = model.image_size();
        let dataset = MvtecDataset::open(&self.config.paths.dataset_root, self.category, Split::Test)?;

        let rng = match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let display = self.config.display.clone();
        let mut runner = DemoRunner::new(model, image_size, dataset, display.clone(), rng);

        let mut sink = open_sink(&self.config, &display, self.headless, self.frames)?;
        runner.run(sink.as_mut())
    }
}

fn open_sink(
    config: &PipelineConfig,
    display: &DisplayConfig,
    headless: bool,
    frames: usize,
) -> anomaly_bench::Result<Box<dyn FrameSink>> {
    if headless {
        return Ok(Box::new(HeadlessSink::new(config.demo_frames_dir(), frames)?));
    }

    #[cfg(feature = "display")]
    {
        Ok(Box::new(anomaly_bench::demo::WindowSink::open("Anomaly Detection Demo", display)?))
    }
    #[cfg(not(feature = "display"))]
    {
        let _ = display;
        Err(anomaly_bench::AnomalyError::Display(
            "built without the 'display' feature, run with --headless".to_string(),
        ))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&LogConfig::from_verbose(args.verbose)).map_err(anyhow::Error::msg)?;

    let mut config =
        PipelineConfig::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(model) = args.model {
        config.paths.model_root = model;
    }
    if let Some(root) = args.dataset_root {
        config.paths.dataset_root = root;
    }

    let category = match args.class_name {
        Some(category) => category,
        None => prompt_category(&mut io::stdin().lock(), &mut io::stdout()).context("Invalid input")?,
    };

    println!("{}", "Anomaly Detection Demo".green().bold());
    println!("  Category: {}", category.to_string().bold());
    println!("  Device: {}", args.device);
    println!("  Precision: {}", args.precision);
    if !args.headless {
        println!("  Press {} to quit", "Esc".yellow());
    }

    let task = DemoTask {
        category,
        precision: args.precision,
        config,
        seed: args.seed,
        headless: args.headless,
        frames: args.frames,
    };
    let frames = dispatch(args.device, task)?.context("Demo failed")?;
    println!("Stopped after {} frames", frames);
    Ok(())
}
