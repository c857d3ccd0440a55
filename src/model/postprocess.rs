//! Min-max normalization and thresholding of raw PatchCore outputs
//!
//! Raw scores are distances with no fixed range. Normalization maps the fitted
//! threshold to 0.5 and the observed score range to unit width, clamped to
//! [0, 1], so that labels and masks are always `normalized >= 0.5`.

use serde::{Deserialize, Serialize};

/// Normalized value at which a score or pixel is considered anomalous
pub const DECISION_BOUNDARY: f32 = 0.5;

/// Statistics fitted at export time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    /// Raw image score threshold
    pub image_threshold: f32,
    /// Raw anomaly map threshold
    pub pixel_threshold: f32,
    /// Smallest raw anomaly map value observed
    pub min: f32,
    /// Largest raw anomaly map value observed
    pub max: f32,
}

impl Default for NormalizationStats {
    /// Post-processing of a model exported without fitted thresholds
    fn default() -> Self {
        Self {
            image_threshold: 0.5,
            pixel_threshold: 0.5,
            min: 0.0,
            max: 1.0,
        }
    }
}

impl NormalizationStats {
    fn normalize(&self, value: f32, threshold: f32) -> f32 {
        let range = self.max - self.min;
        let range = if range > f32::EPSILON { range } else { 1.0 };
        ((value - threshold) / range + 0.5).clamp(0.0, 1.0)
    }

    pub fn normalize_score(&self, score: f32) -> f32 {
        self.normalize(score, self.image_threshold)
    }

    pub fn normalize_map(&self, map: &mut [f32]) {
        for value in map.iter_mut() {
            *value = self.normalize(*value, self.pixel_threshold);
        }
    }

    /// Range of raw values over every anomaly map
    pub fn observed_range<'a, I>(maps: I) -> Option<(f32, f32)>
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        maps.into_iter()
            .flat_map(|m| m.iter().copied())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

/// Binary mask of a normalized anomaly map
pub fn threshold_mask(normalized_map: &[f32]) -> Vec<bool> {
    normalized_map.iter().map(|&v| v >= DECISION_BOUNDARY).collect()
}
