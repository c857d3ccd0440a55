//! Error Handling Module
//!
//! Defines the error type shared by the export, benchmark and demo pipelines.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Archive with prebuilt IR models for every category
pub const PREBUILT_MODELS_URL: &str =
    "https://github.com/junx8/ov_pipeline_benchmark/releases/download/v1.4/ovmodels.tar.gz";

/// Main error type for anomaly pipeline operations
#[derive(Error, Debug)]
pub enum AnomalyError {
    /// Exported model is missing on disk
    #[error(
        "Model file does not exist at {path:?}. Please export the IR for {category} \
         (export_model -c {category}), or download the prebuilt models from {url}",
        url = PREBUILT_MODELS_URL
    )]
    ModelNotFound { path: PathBuf, category: String },

    /// Requested export precision is not one of the supported variants
    #[error("{0} is not a supported export type (expected fp32, fp16, int8, int8_ptq or int8_acq)")]
    UnsupportedExportType(String),

    /// One or more category names are not MVTec AD categories
    #[error("Unknown categories: {}", .0.join(", "))]
    UnknownCategories(Vec<String>),

    /// A dataset split contains no images
    #[error("No images found for category '{category}' in split '{split}'")]
    EmptyDataset { category: String, split: String },

    /// Error with dataset operations
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error loading or processing an image
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Image encoding/processing error
    #[error("Image processing error: {0}")]
    Image(String),

    /// Model construction or record loading error
    #[error("Model error: {0}")]
    Model(String),

    /// Malformed or incompatible model manifest
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Error raised during inference
    #[error("Inference error: {0}")]
    Inference(String),

    /// Asynchronous queue failure
    #[error("Inference queue error: {0}")]
    Queue(String),

    /// Device/hardware error
    #[error("Device error: {0}")]
    Device(String),

    /// Window or display error
    #[error("Display error: {0}")]
    Display(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for AnomalyError {
    fn from(err: serde_json::Error) -> Self {
        AnomalyError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for AnomalyError {
    fn from(err: bincode::Error) -> Self {
        AnomalyError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for AnomalyError {
    fn from(err: image::ImageError) -> Self {
        AnomalyError::Image(err.to_string())
    }
}

/// Convenience Result type for anomaly pipeline operations
pub type Result<T> = std::result::Result<T, AnomalyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AnomalyError::Dataset("test error".to_string());
        assert_eq!(format!("{}", err), "Dataset error: test error");
    }

    #[test]
    fn test_model_not_found_has_hint() {
        let err = AnomalyError::ModelNotFound {
            path: PathBuf::from("ovmodels/bottle/fp16/model.json"),
            category: "bottle".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("model.json"));
        assert!(msg.contains("export_model -c bottle"));
        assert!(msg.contains("ovmodels.tar.gz"));
    }

    #[test]
    fn test_unknown_categories_lists_names() {
        let err = AnomalyError::UnknownCategories(vec!["bottel".into(), "wod".into()]);
        assert_eq!(err.to_string(), "Unknown categories: bottel, wod");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AnomalyError = io_err.into();
        assert!(matches!(err, AnomalyError::Io(_)));
    }
}
