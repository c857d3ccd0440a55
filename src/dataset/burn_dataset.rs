//! Burn Dataset Integration for MVTec AD
//!
//! Implements Burn's `Dataset` and `Batcher` over MVTec samples. The exporter
//! uses it to embed training images for the memory bank and to score the test
//! split when fitting thresholds.

use std::sync::atomic::{AtomicUsize, Ordering};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rayon::prelude::*;
use tracing::info;

use super::mvtec::DatasetSample;
use crate::utils::error::Result;
use crate::utils::logging::progress_bar;

/// A single MVTec item ready for Burn
#[derive(Clone, Debug)]
pub struct MvtecItem {
    /// Image data as flattened CHW float array [3 * H * W] in [0, 1]
    pub image: Vec<f32>,
    /// Ground-truth mask flattened row-major [H * W]
    pub mask: Vec<bool>,
    /// Whether the sample is abnormal
    pub anomalous: bool,
    /// Image path (for debugging/logging)
    pub path: String,
}

impl MvtecItem {
    /// Load and preprocess a sample
    pub fn from_sample(sample: &DatasetSample, image_size: usize) -> Result<Self> {
        let image = sample.load_tensor_data(image_size)?;
        let size = image_size as u32;
        let mask = sample
            .load_mask(size, size)?
            .pixels()
            .map(|p| p[0] > 0)
            .collect();

        Ok(Self {
            image,
            mask,
            anomalous: sample.label.is_anomalous(),
            path: sample.path.to_string_lossy().to_string(),
        })
    }
}

/// MVTec Dataset implementing Burn's Dataset trait, fully decoded in memory
#[derive(Debug, Clone)]
pub struct MvtecBurnDataset {
    items: Vec<MvtecItem>,
    image_size: usize,
}

impl MvtecBurnDataset {
    /// Decode every sample up front, in parallel with rayon.
    ///
    /// Fails on the first sample that cannot be decoded.
    pub fn load(samples: Vec<DatasetSample>, image_size: usize) -> Result<Self> {
        let total = samples.len();
        info!("Pre-loading {} images into memory (parallel)", total);

        let pb = progress_bar(total, "Loading");
        let loaded = AtomicUsize::new(0);

        let items = samples
            .par_iter()
            .map(|sample| {
                let item = MvtecItem::from_sample(sample, image_size);
                let count = loaded.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 16 == 0 || count == total {
                    pb.set_position(count as u64);
                }
                item
            })
            .collect::<Result<Vec<_>>>()?;

        pb.finish_and_clear();
        info!("Loaded {} images", items.len());

        Ok(Self { items, image_size })
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Items in index order, grouped into batches of `batch_size`
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Vec<MvtecItem>> + '_ {
        let batch_size = batch_size.max(1);
        (0..self.len())
            .step_by(batch_size)
            .map(move |start| {
                self.items[start..(start + batch_size).min(self.len())].to_vec()
            })
    }
}

impl Dataset<MvtecItem> for MvtecBurnDataset {
    fn get(&self, index: usize) -> Option<MvtecItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// A batch of MVTec images
#[derive(Clone, Debug)]
pub struct MvtecBatch<B: Backend> {
    /// Images with shape [batch_size, 3, height, width] in [0, 1]
    pub images: Tensor<B, 4>,
    /// Ground-truth labels
    pub anomalous: Vec<bool>,
    /// Ground-truth masks, one flattened [H * W] per image
    pub masks: Vec<Vec<bool>>,
}

/// Batcher stacking preprocessed items into a 4D tensor
#[derive(Clone, Debug)]
pub struct MvtecBatcher {
    image_size: usize,
}

impl MvtecBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl<B: Backend> Batcher<B, MvtecItem, MvtecBatch<B>> for MvtecBatcher {
    fn batch(&self, items: Vec<MvtecItem>, device: &B::Device) -> MvtecBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, 3, size, size]),
            device,
        );

        let (anomalous, masks) = items
            .into_iter()
            .map(|item| (item.anomalous, item.mask))
            .unzip();

        MvtecBatch {
            images,
            anomalous,
            masks,
        }
    }
}
