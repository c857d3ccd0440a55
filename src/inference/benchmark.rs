//! Benchmark statistics
//!
//! Wall-clock timing of a queue run and the derived latency/throughput
//! figures, per category and averaged over the whole run.
//!
//! ## Key Metrics
//!
//! - **Latency**: seconds per image (`elapsed / images`)
//! - **Throughput**: images per second (`images / elapsed`)

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::dataset::{Category, Split};
use crate::utils::error::{AnomalyError, Result};

/// Timer utility for benchmarking
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Create a new timer
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    /// Start timing
    pub fn start(&mut self) {
        self.start = Instant::now();
    }

    /// Time since the last `start`
    pub fn stop(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// What a queue pass did besides inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    /// No-op completion callback
    Inference,
    /// Callback writes the anomaly-map and overlay images
    SaveResults,
}

impl std::fmt::Display for PassKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassKind::Inference => write!(f, "Performance"),
            PassKind::SaveResults => write!(f, "Saving Results Performance"),
        }
    }
}

/// Timing of one pass over a category's test split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub category: Category,
    pub pass: PassKind,
    pub images: usize,
    pub elapsed_secs: f64,
}

impl RunStats {
    /// Fails on an empty pass rather than dividing by zero
    pub fn new(category: Category, pass: PassKind, images: usize, elapsed: Duration) -> Result<Self> {
        if images == 0 {
            return Err(AnomalyError::EmptyDataset {
                category: category.to_string(),
                split: Split::Test.to_string(),
            });
        }
        Ok(Self {
            category,
            pass,
            images,
            elapsed_secs: elapsed.as_secs_f64(),
        })
    }

    /// Seconds per image
    pub fn latency(&self) -> f64 {
        self.elapsed_secs / self.images as f64
    }

    /// Images per second
    pub fn throughput(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            return f64::INFINITY;
        }
        self.images as f64 / self.elapsed_secs
    }

    pub fn summary(&self) -> String {
        format!(
            " - {} images task {:.2} sec, {:.3} sec/image\n - throughput {:.2} FPS",
            self.images,
            self.elapsed_secs,
            self.latency(),
            self.throughput()
        )
    }
}

/// Per-category latency and throughput reduced to means
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateStats {
    pub latencies: Vec<f64>,
    pub throughputs: Vec<f64>,
}

impl AggregateStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stats: &RunStats) {
        self.latencies.push(stats.latency());
        self.throughputs.push(stats.throughput());
    }

    pub fn len(&self) -> usize {
        self.latencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latencies.is_empty()
    }

    /// Average seconds per image, `None` before any category ran
    pub fn mean_latency(&self) -> Option<f64> {
        mean(&self.latencies)
    }

    /// Average FPS, `None` before any category ran
    pub fn mean_throughput(&self) -> Option<f64> {
        mean(&self.throughputs)
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Everything a benchmark run measured, written with `--report`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub device: String,
    pub precision: String,
    pub num_workers: usize,
    pub runs: Vec<RunStats>,
    pub average_latency_secs: Option<f64>,
    pub average_throughput_fps: Option<f64>,
    pub timestamp: String,
}

impl BenchmarkReport {
    pub fn new(
        device: String,
        precision: String,
        num_workers: usize,
        runs: Vec<RunStats>,
        aggregate: &AggregateStats,
    ) -> Self {
        Self {
            device,
            precision,
            num_workers,
            runs,
            average_latency_secs: aggregate.mean_latency(),
            average_throughput_fps: aggregate.mean_throughput(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Save results to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stats(images: usize, secs: u64) -> RunStats {
        RunStats::new(Category::Bottle, PassKind::Inference, images, Duration::from_secs(secs)).unwrap()
    }

    #[test]
    fn test_run_stats_derived() {
        let s = stats(50, 10);
        assert!((s.latency() - 0.2).abs() < 1e-12);
        assert!((s.throughput() - 5.0).abs() < 1e-12);
        assert!(s.summary().contains("50 images task 10.00 sec"));
    }

    #[test]
    fn test_empty_pass_is_an_error() {
        let err = RunStats::new(Category::Zipper, PassKind::Inference, 0, Duration::from_secs(1)).unwrap_err();
        match err {
            AnomalyError::EmptyDataset { category, split } => {
                assert_eq!(category, "zipper");
                assert_eq!(split, "test");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_aggregate_means() {
        let mut agg = AggregateStats::new();
        assert!(agg.mean_latency().is_none());

        agg.record(&stats(10, 1));
        agg.record(&stats(10, 4));
        assert_eq!(agg.len(), 2);
        assert!((agg.mean_latency().unwrap() - 0.25).abs() < 1e-12);
        assert!((agg.mean_throughput().unwrap() - 6.25).abs() < 1e-12);
    }

    #[test]
    fn test_report_written_as_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/report.json");

        let mut agg = AggregateStats::new();
        let run = stats(8, 2);
        agg.record(&run);
        let report = BenchmarkReport::new("CPU".into(), "fp16".into(), 4, vec![run], &agg);
        report.save(&path).unwrap();

        let loaded: BenchmarkReport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.runs.len(), 1);
        assert_eq!(loaded.runs[0].category, Category::Bottle);
        assert_eq!(loaded.average_throughput_fps, Some(4.0));
    }

    #[test]
    fn test_timer() {
        let mut timer = Timer::new();
        timer.start();
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = timer.stop();
        assert!(elapsed >= Duration::from_millis(5));
        assert!(timer.stop() >= elapsed);
    }
}
