//! Inference module for exported models
//!
//! This module provides:
//! - Loading an exported IR into an inference-ready model
//! - Post-processed predictions (score, label, anomaly map, mask)
//! - An asynchronous worker-pool queue with completion callbacks
//! - The throughput benchmark built on top of the queue

pub mod benchmark;
pub mod compiled;
pub mod queue;
pub mod result;
pub mod runner;

// Re-export main types for convenience
pub use benchmark::{AggregateStats, BenchmarkReport, PassKind, RunStats, Timer};
pub use compiled::CompiledModel;
pub use queue::{Callback, InferQueue, InferenceEngine};
pub use result::InferenceResult;
pub use runner::{run_benchmark, run_pass, BenchItem, BenchmarkOptions, BenchmarkOutcome, ResultWriter};
