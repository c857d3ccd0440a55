//! PatchCore anomaly model
//!
//! Locally aware patch embeddings from two backbone stages are compared with a
//! memory bank of nominal embeddings. The distance of each patch to its
//! nearest bank entry is its anomaly score; the image score is the largest
//! patch score and the anomaly map is the patch score grid upsampled to the
//! input resolution and smoothed with a Gaussian.

use burn::{
    config::Config,
    nn::{
        pool::{AvgPool2d, AvgPool2dConfig},
        PaddingConfig2d,
    },
    tensor::{
        backend::Backend,
        module::{conv2d, interpolate},
        ops::{ConvOptions, InterpolateMode, InterpolateOptions},
        Tensor, TensorData,
    },
};

use super::backbone::{Backbone, BackboneConfig};
use super::coreset::CoresetSampler;
use crate::utils::error::AnomalyError;

/// Configuration for the PatchCore model
#[derive(Config, Debug)]
pub struct PatchCoreConfig {
    pub backbone: BackboneConfig,

    /// Input image size (square)
    #[config(default = "256")]
    pub image_size: usize,

    /// Neighbourhood of the local average pooling over feature maps
    #[config(default = "3")]
    pub pool_kernel: usize,

    /// Standard deviation of the anomaly map smoothing
    #[config(default = "4.0")]
    pub blur_sigma: f32,

    /// Memory bank rows compared per matmul
    #[config(default = "8192")]
    pub bank_chunk: usize,
}

impl PatchCoreConfig {
    pub fn embedding_dim(&self) -> usize {
        self.backbone.embedding_dim()
    }

    /// Side of the patch grid
    pub fn feature_size(&self) -> usize {
        self.backbone.feature_size(self.image_size)
    }

    /// Patches per image
    pub fn patches_per_image(&self) -> usize {
        self.feature_size() * self.feature_size()
    }
}

/// Unnormalized output for one image
#[derive(Debug, Clone)]
pub struct RawPrediction {
    /// Largest patch distance
    pub score: f32,
    /// Smoothed distance map, row-major [image_size * image_size]
    pub anomaly_map: Vec<f32>,
}

/// Nominal patch embeddings resident on the device
#[derive(Debug, Clone)]
pub struct MemoryBank<B: Backend> {
    /// Row chunks [rows, D] with their squared norms [1, rows]
    chunks: Vec<(Tensor<B, 2>, Tensor<B, 2>)>,
    /// Per-channel scales [1, D] when embeddings are fake-quantized to int8
    embedding_scales: Option<Tensor<B, 2>>,
    len: usize,
    dim: usize,
}

impl<B: Backend> MemoryBank<B> {
    /// Upload a row-major bank of `dim` columns
    pub fn new(
        data: &[f32],
        dim: usize,
        embedding_scales: Option<&[f32]>,
        chunk_rows: usize,
        device: &B::Device,
    ) -> crate::utils::error::Result<Self> {
        if dim == 0 || data.is_empty() || data.len() % dim != 0 {
            return Err(AnomalyError::Model(format!(
                "Memory bank of {} values does not hold rows of width {}",
                data.len(),
                dim
            )));
        }
        if let Some(scales) = embedding_scales {
            if scales.len() != dim {
                return Err(AnomalyError::Model(format!(
                    "Expected {} embedding scales, got {}",
                    dim,
                    scales.len()
                )));
            }
        }

        let len = data.len() / dim;
        let chunk_rows = chunk_rows.max(1);
        let chunks = data
            .chunks(chunk_rows * dim)
            .map(|rows| {
                let n = rows.len() / dim;
                let bank = Tensor::<B, 2>::from_floats(TensorData::new(rows.to_vec(), [n, dim]), device);
                let sq_norms = bank.clone().powf_scalar(2.0).sum_dim(1).reshape([1, n]);
                (bank, sq_norms)
            })
            .collect();

        let embedding_scales = embedding_scales.map(|s| {
            Tensor::<B, 2>::from_floats(TensorData::new(s.to_vec(), [1, dim]), device)
        });

        Ok(Self {
            chunks,
            embedding_scales,
            len,
            dim,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Euclidean distance of each embedding [P, D] to its nearest row, [P, 1]
    pub fn nearest_distance(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2> {
        let embeddings = match &self.embedding_scales {
            Some(scales) => fake_quantize(embeddings, scales.clone()),
            None => embeddings,
        };
        let emb_sq = embeddings.clone().powf_scalar(2.0).sum_dim(1);

        let minima: Vec<Tensor<B, 2>> = self
            .chunks
            .iter()
            .map(|(bank, bank_sq)| {
                let cross = embeddings.clone().matmul(bank.clone().transpose());
                let dist = emb_sq.clone() - cross.mul_scalar(2.0) + bank_sq.clone();
                dist.min_dim(1)
            })
            .collect();

        Tensor::cat(minima, 1).min_dim(1).clamp_min(0.0).sqrt()
    }
}

/// Symmetric int8 fake quantization with per-channel scales [1, D]
pub fn fake_quantize<B: Backend>(x: Tensor<B, 2>, scales: Tensor<B, 2>) -> Tensor<B, 2> {
    x.div(scales.clone()).round().clamp(-127.0, 127.0).mul(scales)
}

/// Separable Gaussian smoothing normalized at the borders
#[derive(Debug, Clone)]
pub struct GaussianBlur<B: Backend> {
    horizontal: Tensor<B, 4>,
    vertical: Tensor<B, 4>,
    radius: usize,
    /// Response of the blur to a constant image
    norm: Tensor<B, 4>,
}

/// Normalized 1D Gaussian weights of size `2 * floor(4 * sigma + 0.5) + 1`
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (4.0 * sigma + 0.5).floor().max(0.0) as usize;
    let weights: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-x * x / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

impl<B: Backend> GaussianBlur<B> {
    pub fn new(sigma: f32, size: usize, device: &B::Device) -> Self {
        let kernel = gaussian_kernel(sigma.max(f32::EPSILON));
        let k = kernel.len();
        let horizontal = Tensor::<B, 4>::from_floats(TensorData::new(kernel.clone(), [1, 1, 1, k]), device);
        let vertical = Tensor::<B, 4>::from_floats(TensorData::new(kernel, [1, 1, k, 1]), device);

        let mut blur = Self {
            horizontal,
            vertical,
            radius: k / 2,
            norm: Tensor::ones([1, 1, size, size], device),
        };
        blur.norm = blur.convolve(Tensor::ones([1, 1, size, size], device));
        blur
    }

    fn convolve(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let r = self.radius;
        let x = conv2d(
            x,
            self.horizontal.clone(),
            None,
            ConvOptions::new([1, 1], [0, r], [1, 1], 1),
        );
        conv2d(
            x,
            self.vertical.clone(),
            None,
            ConvOptions::new([1, 1], [r, 0], [1, 1], 1),
        )
    }

    /// Smooth single-channel maps [N, 1, size, size]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.convolve(x) / self.norm.clone()
    }
}

/// PatchCore model: backbone, feature aggregation and memory bank
#[derive(Debug, Clone)]
pub struct PatchCore<B: Backend> {
    config: PatchCoreConfig,
    backbone: Backbone<B>,
    pool: AvgPool2d,
    blur: GaussianBlur<B>,
    memory_bank: Option<MemoryBank<B>>,
}

impl<B: Backend> PatchCore<B> {
    /// Create a model with a freshly initialized backbone
    pub fn new(config: &PatchCoreConfig, device: &B::Device) -> Self {
        Self::with_backbone(config, config.backbone.init(device), device)
    }

    /// Create a model around existing backbone weights
    pub fn with_backbone(config: &PatchCoreConfig, backbone: Backbone<B>, device: &B::Device) -> Self {
        let pad = config.pool_kernel / 2;
        let pool = AvgPool2dConfig::new([config.pool_kernel, config.pool_kernel])
            .with_strides([1, 1])
            .with_padding(PaddingConfig2d::Explicit(pad, pad))
            .with_count_include_pad(false)
            .init();

        Self {
            config: config.clone(),
            backbone,
            pool,
            blur: GaussianBlur::new(config.blur_sigma, config.image_size, device),
            memory_bank: None,
        }
    }

    pub fn config(&self) -> &PatchCoreConfig {
        &self.config
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    pub fn memory_bank(&self) -> Option<&MemoryBank<B>> {
        self.memory_bank.as_ref()
    }

    pub fn set_memory_bank(&mut self, bank: MemoryBank<B>) {
        self.memory_bank = Some(bank);
    }

    /// Patch embeddings of images [N, 3, S, S] in [0, 1], as [N * h * w, D]
    /// in image-major, row-major patch order
    pub fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        let layer2 = self.pool.forward(features.layer2);
        let layer3 = self.pool.forward(features.layer3);

        let [n, _, h, w] = layer2.dims();
        let layer3 = interpolate(
            layer3,
            [h, w],
            InterpolateOptions::new(InterpolateMode::Bilinear),
        );

        let embedding = Tensor::cat(vec![layer2, layer3], 1);
        let dim = embedding.dims()[1];
        embedding.permute([0, 2, 3, 1]).reshape([n * h * w, dim])
    }

    /// Embed images and copy the embeddings to the host
    pub fn embed_to_vec(&self, images: Tensor<B, 4>) -> crate::utils::error::Result<Vec<f32>> {
        tensor_to_vec(self.embed(images))
    }

    /// Score images [N, 3, S, S] in [0, 1] against the memory bank
    pub fn predict(&self, images: Tensor<B, 4>) -> crate::utils::error::Result<Vec<RawPrediction>> {
        let bank = self
            .memory_bank
            .as_ref()
            .ok_or_else(|| AnomalyError::Model("Memory bank has not been fitted".to_string()))?;

        let [n, _, h, w] = images.dims();
        let side = self.config.feature_size();
        let size = self.config.image_size;
        if (h, w) != (size, size) {
            return Err(AnomalyError::Model(format!(
                "Expected {size}x{size} inputs, got {w}x{h}"
            )));
        }

        let distances = bank.nearest_distance(self.embed(images));
        let patch_scores = distances.reshape([n, 1, side, side]);

        let scores = tensor_to_vec(patch_scores.clone().reshape([n, side * side]).max_dim(1))?;

        let maps = interpolate(
            patch_scores,
            [size, size],
            InterpolateOptions::new(InterpolateMode::Bilinear),
        );
        let maps = tensor_to_vec(self.blur.forward(maps))?;

        Ok(scores
            .into_iter()
            .zip(maps.chunks(size * size))
            .map(|(score, map)| RawPrediction {
                score,
                anomaly_map: map.to_vec(),
            })
            .collect())
    }
}

/// Reduce collected embeddings (row-major, `dim` columns) to a coreset
pub fn subsample_embeddings(embeddings: &[f32], dim: usize, sampler: &CoresetSampler) -> Vec<f32> {
    sampler
        .select(embeddings, dim)
        .into_iter()
        .flat_map(|row| embeddings[row * dim..(row + 1) * dim].iter().copied())
        .collect()
}

/// Copy a float tensor to the host
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> crate::utils::error::Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| AnomalyError::Inference(format!("Failed to read tensor data: {:?}", e)))
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn small_config() -> PatchCoreConfig {
        PatchCoreConfig::new(
            BackboneConfig::new()
                .with_base_channels(4)
                .with_blocks_per_stage(1),
        )
        .with_image_size(32)
        .with_blur_sigma(1.0)
        .with_bank_chunk(3)
    }

    #[test]
    fn test_gaussian_kernel() {
        let kernel = gaussian_kernel(4.0);
        assert_eq!(kernel.len(), 33);
        assert!((kernel.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(kernel[16] > kernel[0]);
    }

    #[test]
    fn test_blur_preserves_constant() {
        let device = Default::default();
        let blur = GaussianBlur::<TestBackend>::new(2.0, 16, &device);
        let out = blur.forward(Tensor::ones([2, 1, 16, 16], &device).mul_scalar(3.0));
        let values = tensor_to_vec(out).unwrap();
        assert!(values.iter().all(|v| (v - 3.0).abs() < 1e-4));
    }

    #[test]
    fn test_nearest_distance_over_chunks() {
        let device = Default::default();
        let bank_rows = [0.0, 0.0, 3.0, 4.0, 10.0, 0.0, -1.0, 0.0];
        let bank = MemoryBank::<TestBackend>::new(&bank_rows, 2, None, 3, &device).unwrap();
        assert_eq!(bank.len(), 4);

        let queries = Tensor::<TestBackend, 2>::from_floats(
            TensorData::new(vec![3.0f32, 4.0, 9.0, 0.0, 0.0, 2.0], [3, 2]),
            &device,
        );
        let d = tensor_to_vec(bank.nearest_distance(queries)).unwrap();
        assert!(d[0].abs() < 1e-3);
        assert!((d[1] - 1.0).abs() < 1e-3);
        assert!((d[2] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_memory_bank_rejects_ragged_rows() {
        let device = Default::default();
        assert!(MemoryBank::<TestBackend>::new(&[1.0, 2.0, 3.0], 2, None, 8, &device).is_err());
        assert!(MemoryBank::<TestBackend>::new(&[1.0, 2.0], 2, Some(&[1.0]), 8, &device).is_err());
    }

    #[test]
    fn test_fake_quantize_rounds_to_grid() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_floats(TensorData::new(vec![0.26f32, -3.0], [1, 2]), &device);
        let scales = Tensor::<TestBackend, 2>::from_floats(TensorData::new(vec![0.1f32, 0.01], [1, 2]), &device);
        let q = tensor_to_vec(fake_quantize(x, scales)).unwrap();
        assert!((q[0] - 0.3).abs() < 1e-5);
        assert!((q[1] + 1.27).abs() < 1e-5);
    }

    #[test]
    fn test_predict_requires_bank() {
        let device = Default::default();
        let model = PatchCore::<TestBackend>::new(&small_config(), &device);
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        assert!(model.predict(images).is_err());
    }

    #[test]
    fn test_fit_and_predict_shapes() {
        let device = Default::default();
        let config = small_config();
        let mut model = PatchCore::<TestBackend>::new(&config, &device);

        let images = Tensor::<TestBackend, 4>::random(
            [2, 3, 32, 32],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let embeddings = model.embed_to_vec(images.clone()).unwrap();
        let dim = config.embedding_dim();
        assert_eq!(embeddings.len(), 2 * config.patches_per_image() * dim);

        let bank = subsample_embeddings(&embeddings, dim, &CoresetSampler::new(0.5, 1));
        model.set_memory_bank(MemoryBank::new(&bank, dim, None, config.bank_chunk, &device).unwrap());

        let predictions = model.predict(images).unwrap();
        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0].anomaly_map.len(), 32 * 32);
        assert!(predictions.iter().all(|p| p.score >= 0.0 && p.score.is_finite()));
    }
}
