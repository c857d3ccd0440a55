//! Throughput benchmark runner
//!
//! For every category the test split is pushed through an [`InferQueue`]
//! twice: once with a no-op callback (bare inference) and once with a
//! callback that writes the anomaly-map and overlay images. Image decoding
//! and resizing happen on the submitting thread and are part of the timing.

use std::path::PathBuf;
use std::sync::Arc;

use burn::tensor::backend::Backend;
use colored::Colorize;
use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::{debug, info};

use super::benchmark::{AggregateStats, PassKind, RunStats, Timer};
use super::compiled::CompiledModel;
use super::queue::InferQueue;
use super::result::InferenceResult;
use crate::dataset::mvtec::{load_rgb, to_chw};
use crate::dataset::{Category, DatasetSample, MvtecDataset, Split};
use crate::export::Precision;
use crate::utils::error::Result;
use crate::utils::logging::progress_bar;
use crate::visualize;

/// Settings of one benchmark run
#[derive(Debug, Clone)]
pub struct BenchmarkOptions {
    pub categories: Vec<Category>,
    pub precision: Precision,
    pub model_root: PathBuf,
    pub dataset_root: PathBuf,
    pub anomaly_map_dir: PathBuf,
    pub overlay_dir: PathBuf,
    pub num_workers: usize,
    pub queue_depth_per_worker: usize,
    /// Run the second, result-writing pass
    pub save_results: bool,
}

/// Statistics of a whole run
#[derive(Debug, Clone, Default)]
pub struct BenchmarkOutcome {
    /// Every pass in execution order
    pub runs: Vec<RunStats>,
    /// Averages over the bare-inference passes
    pub aggregate: AggregateStats,
}

/// Job payload: the sample and the resized image the callback draws on
pub struct BenchItem {
    pub sample: DatasetSample,
    pub image: RgbImage,
}

/// Where the save-results callback writes
#[derive(Debug, Clone)]
pub struct ResultWriter {
    anomaly_map_dir: PathBuf,
    overlay_dir: PathBuf,
}

impl ResultWriter {
    pub fn new(anomaly_map_dir: impl Into<PathBuf>, overlay_dir: impl Into<PathBuf>) -> Self {
        Self {
            anomaly_map_dir: anomaly_map_dir.into(),
            overlay_dir: overlay_dir.into(),
        }
    }

    /// Write `<image | heatmap>` and the contour overlay for one result
    pub fn write(&self, result: &InferenceResult, item: &BenchItem) -> Result<()> {
        let name = visualize::result_file_name(&item.sample.path);
        let (width, height) = item.image.dimensions();

        let panel = visualize::anomaly_map_panel(&item.image, result);
        visualize::save_rgb(&panel, &self.anomaly_map_dir.join(&name))?;

        let gt_mask = visualize::mask_from_gray(&item.sample.load_mask(width, height)?);
        let overlay = visualize::overlay_panel(&item.image, &gt_mask, result);
        visualize::save_rgb(&overlay, &self.overlay_dir.join(&name))?;

        debug!("Saved results for {}", name);
        Ok(())
    }
}

/// Benchmark every requested category on `device`
pub fn run_benchmark<B: Backend>(options: &BenchmarkOptions, device: &B::Device) -> Result<BenchmarkOutcome> {
    let writer = Arc::new(ResultWriter::new(
        options.anomaly_map_dir.clone(),
        options.overlay_dir.clone(),
    ));
    let mut outcome = BenchmarkOutcome::default();

    for &category in &options.categories {
        let model = CompiledModel::<B>::load(&options.model_root, category, options.precision, device)?;
        let image_size = model.image_size();
        let dataset = MvtecDataset::open(&options.dataset_root, category, Split::Test)?;

        let queue = InferQueue::<BenchItem>::new(model, options.num_workers, options.queue_depth_per_worker)?;
        info!(
            "Benchmarking {} ({} images, {} workers)",
            category,
            dataset.len(),
            queue.len()
        );

        println!("\n{}", "Starting Performance Testing...".green().bold());
        let stats = run_pass(&queue, &dataset, image_size, PassKind::Inference)?;
        print_run(&stats);
        outcome.aggregate.record(&stats);
        outcome.runs.push(stats);

        if options.save_results {
            println!("\n{}", "Saving the results...".cyan());
            let writer = Arc::clone(&writer);
            queue.set_callback(move |result, item: &BenchItem| writer.write(result, item));

            let stats = run_pass(&queue, &dataset, image_size, PassKind::SaveResults)?;
            print_run(&stats);
            outcome.runs.push(stats);
        }
    }

    print_average(&outcome.aggregate);
    Ok(outcome)
}

/// Submit every sample of `dataset` and wait for the queue to drain
pub fn run_pass(
    queue: &InferQueue<BenchItem>,
    dataset: &MvtecDataset,
    image_size: usize,
    pass: PassKind,
) -> Result<RunStats> {
    let size = image_size as u32;
    let pb = progress_bar(dataset.len(), dataset.category.as_str());
    let mut timer = Timer::new();

    timer.start();
    for sample in &dataset.samples {
        let image = imageops::resize(&load_rgb(&sample.path)?, size, size, FilterType::Triangle);
        let input = to_chw(&image, image_size);
        queue.start_async(
            input,
            BenchItem {
                sample: sample.clone(),
                image,
            },
        )?;
        pb.inc(1);
    }
    queue.wait_all()?;
    let elapsed = timer.stop();
    pb.finish_and_clear();

    RunStats::new(dataset.category, pass, dataset.len(), elapsed)
}

fn print_run(stats: &RunStats) {
    println!(
        "\n{} for {}:\n{}",
        stats.pass,
        stats.category.to_string().bold(),
        stats.summary()
    );
}

fn print_average(aggregate: &AggregateStats) {
    let (Some(latency), Some(throughput)) = (aggregate.mean_latency(), aggregate.mean_throughput()) else {
        return;
    };
    println!("\n\n--------------------------------");
    println!("\n{}\n", "Average Performance for mvtec:".cyan().bold());
    println!(
        " - {} {} sec",
        "Average Latency:".green(),
        format!("{:.3}", latency).bold()
    );
    println!(
        " - {} {} FPS\n",
        "Average Throughput:".green(),
        format!("{:.2}", throughput).bold()
    );
}
