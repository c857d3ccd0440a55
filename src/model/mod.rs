//! Model module for PatchCore anomaly detection using the Burn framework
//!
//! This module provides:
//! - A ResNet-18 style backbone truncated after stage 3
//! - Greedy k-center coreset selection for the memory bank
//! - PatchCore embedding, nearest-neighbour scoring and anomaly maps
//! - Min-max normalization and thresholding of raw outputs

pub mod backbone;
pub mod coreset;
pub mod patchcore;
pub mod postprocess;

// Re-export main types for convenience
pub use backbone::{Backbone, BackboneConfig};
pub use coreset::CoresetSampler;
pub use patchcore::{MemoryBank, PatchCore, PatchCoreConfig, RawPrediction};
pub use postprocess::{NormalizationStats, DECISION_BOUNDARY};
