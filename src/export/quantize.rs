//! Quantization of the memory bank and patch embeddings
//!
//! - Per-row symmetric int8 (weight-only compression of the bank)
//! - Per-channel symmetric int8 with scales calibrated on training embeddings
//! - Half precision storage through the `half` crate

use half::f16;

/// Largest magnitude of a symmetric int8 code
pub const INT8_MAX: f32 = 127.0;

fn scale_for(max_abs: f32) -> f32 {
    if max_abs > 0.0 {
        max_abs / INT8_MAX
    } else {
        1.0
    }
}

fn quantize_value(x: f32, scale: f32) -> i8 {
    (x / scale).round().clamp(-INT8_MAX, INT8_MAX) as i8
}

/// Quantize each row of a row-major matrix with its own scale
pub fn quantize_per_row(data: &[f32], dim: usize) -> (Vec<i8>, Vec<f32>) {
    let mut values = Vec::with_capacity(data.len());
    let mut scales = Vec::with_capacity(data.len() / dim.max(1));

    for row in data.chunks(dim.max(1)) {
        let scale = scale_for(row.iter().fold(0.0f32, |m, x| m.max(x.abs())));
        values.extend(row.iter().map(|&x| quantize_value(x, scale)));
        scales.push(scale);
    }
    (values, scales)
}

pub fn dequantize_per_row(values: &[i8], scales: &[f32], dim: usize) -> Vec<f32> {
    values
        .chunks(dim.max(1))
        .zip(scales)
        .flat_map(|(row, &scale)| row.iter().map(move |&q| q as f32 * scale))
        .collect()
}

/// Quantize column `j` of a row-major matrix with `scales[j]`
pub fn quantize_per_channel(data: &[f32], scales: &[f32]) -> Vec<i8> {
    data.chunks(scales.len().max(1))
        .flat_map(|row| row.iter().zip(scales).map(|(&x, &s)| quantize_value(x, s)))
        .collect()
}

pub fn dequantize_per_channel(values: &[i8], scales: &[f32]) -> Vec<f32> {
    values
        .chunks(scales.len().max(1))
        .flat_map(|row| row.iter().zip(scales).map(|(&q, &s)| q as f32 * s))
        .collect()
}

pub fn to_f16_bits(data: &[f32]) -> Vec<u16> {
    data.iter().map(|&x| f16::from_f32(x).to_bits()).collect()
}

pub fn from_f16_bits(bits: &[u16]) -> Vec<f32> {
    bits.iter().map(|&b| f16::from_bits(b).to_f32()).collect()
}

/// Running per-channel absolute maximum over calibration batches
#[derive(Debug, Clone)]
pub struct ChannelCalibrator {
    max_abs: Vec<f32>,
    rows_seen: usize,
}

impl ChannelCalibrator {
    pub fn new(dim: usize) -> Self {
        Self {
            max_abs: vec![0.0; dim],
            rows_seen: 0,
        }
    }

    /// Fold a row-major batch of embeddings into the running statistics
    pub fn observe(&mut self, embeddings: &[f32]) {
        let dim = self.max_abs.len().max(1);
        for row in embeddings.chunks(dim) {
            for (m, &x) in self.max_abs.iter_mut().zip(row) {
                *m = m.max(x.abs());
            }
            self.rows_seen += 1;
        }
    }

    pub fn rows_seen(&self) -> usize {
        self.rows_seen
    }

    /// Per-channel scales mapping the observed range onto [-127, 127]
    pub fn scales(&self) -> Vec<f32> {
        self.max_abs.iter().map(|&m| scale_for(m)).collect()
    }
}
