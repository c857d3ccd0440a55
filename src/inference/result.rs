//! Post-processed model output for one image

use crate::dataset::Label;
use crate::model::postprocess::threshold_mask;
use crate::model::{NormalizationStats, RawPrediction, DECISION_BOUNDARY};

/// Prediction handed to queue callbacks and the demo
#[derive(Debug, Clone)]
pub struct InferenceResult {
    /// Normalized image score in [0, 1]
    pub pred_score: f32,
    pub pred_label: Label,
    /// Normalized anomaly map in [0, 1], row-major [height * width]
    pub anomaly_map: Vec<f32>,
    /// Predicted defect mask, row-major [height * width]
    pub pred_mask: Vec<bool>,
    pub width: usize,
    pub height: usize,
}

impl InferenceResult {
    /// Normalize a raw prediction for a square map of side `size`
    pub fn from_raw(raw: RawPrediction, stats: &NormalizationStats, size: usize) -> Self {
        let pred_score = stats.normalize_score(raw.score);
        let mut anomaly_map = raw.anomaly_map;
        stats.normalize_map(&mut anomaly_map);
        let pred_mask = threshold_mask(&anomaly_map);

        Self {
            pred_score,
            pred_label: Label::from_anomalous(pred_score >= DECISION_BOUNDARY),
            anomaly_map,
            pred_mask,
            width: size,
            height: size,
        }
    }
}
