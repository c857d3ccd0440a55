//! Residual feature extractor for PatchCore
//!
//! A ResNet-18 style network truncated after its third stage. PatchCore only
//! reads the intermediate feature maps of stages 2 and 3, so the classifier
//! head and the fourth stage are never built.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor, TensorData},
};

/// ImageNet channel means
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Configuration for the backbone
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Channels of the stem and the first stage
    #[config(default = "64")]
    pub base_channels: usize,

    /// Residual blocks per stage
    #[config(default = "2")]
    pub blocks_per_stage: usize,
}

impl BackboneConfig {
    /// Channels produced by stage 2
    pub fn layer2_channels(&self) -> usize {
        self.base_channels * 2
    }

    /// Channels produced by stage 3
    pub fn layer3_channels(&self) -> usize {
        self.base_channels * 4
    }

    /// Width of a concatenated stage 2 + stage 3 patch embedding
    pub fn embedding_dim(&self) -> usize {
        self.layer2_channels() + self.layer3_channels()
    }

    /// Side of the stage 2 feature map for a square input
    pub fn feature_size(&self, image_size: usize) -> usize {
        // stem conv, max pool and stage 2 each halve with padding, rounding up
        image_size.div_ceil(2).div_ceil(2).div_ceil(2)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        Backbone::new(self, device)
    }
}

/// 1x1 projection on the residual path when shape changes
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
}

/// Two 3x3 convolutions with an identity (or projected) shortcut
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    pub downsample: Option<Downsample<B>>,
    pub relu: Relu,
}

impl<B: Backend> BasicBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        let conv2 = Conv2dConfig::new([out_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);

        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });

        Self {
            conv1,
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2,
            bn2: BatchNormConfig::new(out_channels).init(device),
            downsample,
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(ds) => ds.bn.forward(ds.conv.forward(x.clone())),
            None => x.clone(),
        };

        let out = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        self.relu.forward(out + identity)
    }
}

/// Stem plus three residual stages
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub relu: Relu,
    pub max_pool: MaxPool2d,
    pub layer1: Vec<BasicBlock<B>>,
    pub layer2: Vec<BasicBlock<B>>,
    pub layer3: Vec<BasicBlock<B>>,
}

/// Intermediate feature maps read by PatchCore
pub struct StageFeatures<B: Backend> {
    /// [N, 2 * base, H / 8, W / 8]
    pub layer2: Tensor<B, 4>,
    /// [N, 4 * base, H / 16, W / 16]
    pub layer3: Tensor<B, 4>,
}

fn stage<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    blocks: usize,
    stride: usize,
    device: &B::Device,
) -> Vec<BasicBlock<B>> {
    (0..blocks.max(1))
        .map(|i| {
            if i == 0 {
                BasicBlock::new(in_channels, out_channels, stride, device)
            } else {
                BasicBlock::new(out_channels, out_channels, 1, device)
            }
        })
        .collect()
}

impl<B: Backend> Backbone<B> {
    pub fn new(config: &BackboneConfig, device: &B::Device) -> Self {
        let base = config.base_channels;
        let blocks = config.blocks_per_stage;

        let conv1 = Conv2dConfig::new([config.in_channels, base], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let max_pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        Self {
            conv1,
            bn1: BatchNormConfig::new(base).init(device),
            relu: Relu::new(),
            max_pool,
            layer1: stage(base, base, blocks, 1, device),
            layer2: stage(base, base * 2, blocks, 2, device),
            layer3: stage(base * 2, base * 4, blocks, 2, device),
        }
    }

    /// Extract stage 2 and stage 3 features from images in [0, 1]
    pub fn forward(&self, images: Tensor<B, 4>) -> StageFeatures<B> {
        let x = imagenet_normalize(images);
        let x = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        let x = self.max_pool.forward(x);

        let x = self.layer1.iter().fold(x, |x, block| block.forward(x));
        let layer2 = self.layer2.iter().fold(x, |x, block| block.forward(x));
        let layer3 = self
            .layer3
            .iter()
            .fold(layer2.clone(), |x, block| block.forward(x));

        StageFeatures { layer2, layer3 }
    }
}

/// Apply ImageNet normalization: (x - mean) / std
pub fn imagenet_normalize<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let mean = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_MEAN.to_vec(), [1, 3, 1, 1]), &device);
    let std = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_STD.to_vec(), [1, 3, 1, 1]), &device);
    (images - mean) / std
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_stage_shapes() {
        let device = Default::default();
        let config = BackboneConfig::new().with_base_channels(8).with_blocks_per_stage(1);
        let backbone = config.init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::ones([2, 3, 64, 64], &device);
        let features = backbone.forward(images);

        assert_eq!(features.layer2.dims(), [2, 16, 8, 8]);
        assert_eq!(features.layer3.dims(), [2, 32, 4, 4]);
        assert_eq!(config.feature_size(64), 8);
        assert_eq!(config.embedding_dim(), 48);
    }

    #[test]
    fn test_feature_size_rounds_up() {
        let device = Default::default();
        let config = BackboneConfig::new().with_base_channels(8).with_blocks_per_stage(1);
        let backbone = config.init::<TestBackend>(&device);

        for size in [36, 50, 33] {
            let images = Tensor::<TestBackend, 4>::ones([1, 3, size, size], &device);
            let [_, _, h, w] = backbone.forward(images).layer2.dims();
            assert_eq!(h, config.feature_size(size), "input {size}");
            assert_eq!(w, config.feature_size(size), "input {size}");
        }
        assert_eq!(config.feature_size(36), 5);
        assert_eq!(config.feature_size(256), 32);
    }

    #[test]
    fn test_default_embedding_dim() {
        assert_eq!(BackboneConfig::new().embedding_dim(), 384);
    }
}
