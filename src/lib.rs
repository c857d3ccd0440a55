//! # Anomaly Bench
//!
//! PatchCore anomaly detection on MVTec AD with the Burn framework: model
//! export, asynchronous throughput benchmarking and a live visual demo.
//!
//! ## Modules
//!
//! - `dataset`: MVTec AD categories, sample discovery, image loading and batching
//! - `model`: PatchCore (backbone, coreset memory bank, scoring, post-processing)
//! - `export`: IR serialization at fp32/fp16/int8 precisions, quantization
//! - `inference`: compiled model, asynchronous worker queue, benchmark runner
//! - `visualize`: letterboxing, colormaps, overlays, text rendering
//! - `demo`: interactive frame loop and frame sinks
//! - `backend`: device string to Burn backend dispatch
//! - `config`: TOML pipeline configuration
//! - `utils`: logging, errors and threshold metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use anomaly_bench::dataset::{Category, MvtecDataset, Split};
//! use anomaly_bench::inference::CompiledModel;
//! use anomaly_bench::export::Precision;
//!
//! let dataset = MvtecDataset::open("datasets/MVTecAD", Category::Bottle, Split::Test)?;
//! let model = CompiledModel::<NdArray>::load(Path::new("ovmodels"), Category::Bottle, Precision::Fp16, &device)?;
//! let result = model.infer(&dataset.samples[0].load_tensor_data(256)?)?;
//! println!("score = {:.3}", result.pred_score);
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod demo;
pub mod export;
pub mod inference;
pub mod model;
pub mod utils;
pub mod visualize;

// Re-export commonly used items for convenience
pub use backend::{dispatch, BackendTask, Device};
pub use config::PipelineConfig;
pub use dataset::{parse_categories, Category, DatasetSample, Label, MvtecDataset, Split};
pub use export::{export_category, ExportOptions, Precision};
pub use inference::{CompiledModel, InferQueue, InferenceResult, RunStats};
pub use utils::error::{AnomalyError, Result};

/// Square model input resolution
pub const IMAGE_SIZE: usize = 256;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
