//! Pipeline configuration
//!
//! Paths, model hyperparameters, queue sizing and display settings shared by
//! the three binaries. Values come from an optional TOML file and are then
//! overridden by command-line flags.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::utils::error::{AnomalyError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    pub model: ModelSettings,
    pub runtime: RuntimeConfig,
    pub display: DisplayConfig,
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the MVTec AD tree (`<root>/<category>/{train,test,ground_truth}`)
    pub dataset_root: PathBuf,
    /// Root of exported models (`<root>/<category>/<precision>/model.json`)
    pub model_root: PathBuf,
    /// Visualization output directory
    pub results_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            dataset_root: PathBuf::from("./datasets/MVTecAD"),
            model_root: PathBuf::from("ovmodels"),
            results_dir: PathBuf::from("res"),
        }
    }
}

/// Model and export hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Square input resolution fed to the model
    pub image_size: usize,
    /// Fraction of patch embeddings kept in the memory bank
    pub coreset_ratio: f64,
    /// Largest AUROC loss accepted by accuracy-controlled quantization
    pub max_auroc_drop: f64,
    /// Seed for weight init, coreset start point and projections
    pub seed: u64,
    /// Optional Burn record with pretrained backbone weights
    pub backbone_weights: Option<PathBuf>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            image_size: crate::IMAGE_SIZE,
            coreset_ratio: 0.1,
            max_auroc_drop: 0.01,
            seed: 42,
            backbone_weights: None,
        }
    }
}

/// Inference queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads; `None` means one per available core (throughput hint)
    pub num_workers: Option<usize>,
    /// Bounded queue slots per worker
    pub queue_depth_per_worker: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_workers: None,
            queue_depth_per_worker: 2,
        }
    }
}

impl RuntimeConfig {
    /// Number of workers to spawn
    pub fn resolve_workers(&self) -> usize {
        self.num_workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

/// Demo window settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    /// Time each frame stays on screen while polling for Esc
    pub frame_interval_ms: u64,
    /// Black separator between the original and the overlay
    pub edge_width: u32,
    /// Opacity of the predicted mask fill
    pub overlay_alpha: f32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_interval_ms: 1000,
            edge_width: 10,
            overlay_alpha: 0.5,
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file; missing sections fall back to defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            AnomalyError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            AnomalyError::Config(format!("Failed to parse config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.model.image_size == 0 {
            return Err(AnomalyError::Config("model.image_size must be positive".to_string()));
        }
        if !(self.model.coreset_ratio > 0.0 && self.model.coreset_ratio <= 1.0) {
            return Err(AnomalyError::Config(format!(
                "model.coreset_ratio must be in (0, 1], got {}",
                self.model.coreset_ratio
            )));
        }
        if self.display.width == 0 || self.display.height == 0 {
            return Err(AnomalyError::Config(format!(
                "display size must be positive, got {}x{}",
                self.display.width, self.display.height
            )));
        }
        Ok(())
    }

    /// Load `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn anomaly_map_dir(&self) -> PathBuf {
        self.paths.results_dir.join("anomaly_map")
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.paths.results_dir.join("overlay")
    }

    pub fn demo_frames_dir(&self) -> PathBuf {
        self.paths.results_dir.join("demo")
    }

    /// Create the visualization output directories
    pub fn ensure_output_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.anomaly_map_dir())?;
        fs::create_dir_all(self.overlay_dir())?;
        Ok(())
    }
}
