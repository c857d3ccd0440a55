//! Utilities module for logging, metrics, and helper functions
//!
//! This module provides:
//! - Structured logging with tracing
//! - Threshold fitting and AUROC over anomaly scores
//! - Error handling types
//! - General helper functions

pub mod error;
pub mod logging;
pub mod metrics;

// Re-export main types for convenience
pub use error::{AnomalyError, Result};
pub use logging::{init_logging, LogConfig};
pub use metrics::{adaptive_f1_threshold, auroc, ThresholdFit};

/// Format a duration in a human-readable way
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let secs = seconds % 60.0;
        format!("{}m {:.0}s", minutes as u32, secs)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours as u32, minutes as u32)
    }
}
