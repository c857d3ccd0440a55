//! MVTec AD Dataset Loader
//!
//! Discovers the samples of one category/split on disk, pairs abnormal test
//! images with their ground-truth masks and decodes images on demand.

use std::fmt;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{GrayImage, ImageReader, Luma, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::Category;
use crate::utils::error::{AnomalyError, Result};

/// Defect directory holding nominal images
pub const GOOD_DIR: &str = "good";

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Dataset split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ground-truth or predicted image label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Normal,
    Abnormal,
}

impl Label {
    pub fn from_anomalous(anomalous: bool) -> Self {
        if anomalous {
            Label::Abnormal
        } else {
            Label::Normal
        }
    }

    pub fn is_anomalous(&self) -> bool {
        matches!(self, Label::Abnormal)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Normal => write!(f, "Normal"),
            Label::Abnormal => write!(f, "Abnormal"),
        }
    }
}

/// A single image with its ground truth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSample {
    /// Path to the image file
    pub path: PathBuf,
    /// Ground-truth label
    pub label: Label,
    /// Ground-truth defect mask, only for abnormal test images
    pub mask_path: Option<PathBuf>,
    pub split: Split,
    /// Defect directory name (`good` for nominal images)
    pub defect_type: String,
    /// Index within the dataset
    pub id: usize,
}

impl DatasetSample {
    /// Decode the image as RGB8
    pub fn load_image(&self) -> Result<RgbImage> {
        load_rgb(&self.path)
    }

    /// Decode the ground-truth mask as a binary image (0 or 255).
    ///
    /// Normal samples and samples without a mask file get an all-zero mask of
    /// `width` x `height`. Masks of a different size are resized with
    /// nearest-neighbour sampling.
    pub fn load_mask(&self, width: u32, height: u32) -> Result<GrayImage> {
        let Some(mask_path) = &self.mask_path else {
            return Ok(GrayImage::new(width, height));
        };

        let mask = ImageReader::open(mask_path)
            .map_err(|e| AnomalyError::ImageLoad(mask_path.clone(), e.to_string()))?
            .decode()
            .map_err(|e| AnomalyError::ImageLoad(mask_path.clone(), e.to_string()))?
            .to_luma8();

        let mask = if mask.dimensions() != (width, height) {
            image::imageops::resize(&mask, width, height, FilterType::Nearest)
        } else {
            mask
        };

        Ok(binarize(&mask))
    }

    /// Decode, resize to `image_size` and convert to CHW floats in [0, 1]
    pub fn load_tensor_data(&self, image_size: usize) -> Result<Vec<f32>> {
        Ok(to_chw(&self.load_image()?, image_size))
    }
}

/// Decode an image file as RGB8
pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    let img = ImageReader::open(path)
        .map_err(|e| AnomalyError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .with_guessed_format()
        .map_err(|e| AnomalyError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .decode()
        .map_err(|e| AnomalyError::ImageLoad(path.to_path_buf(), e.to_string()))?;
    Ok(img.to_rgb8())
}

/// Resize to a square `image_size` and lay out as CHW floats in [0, 1]
pub fn to_chw(img: &RgbImage, image_size: usize) -> Vec<f32> {
    let size = image_size as u32;
    let resized;
    let img = if img.dimensions() != (size, size) {
        resized = image::imageops::resize(img, size, size, FilterType::Triangle);
        &resized
    } else {
        img
    };

    let plane = image_size * image_size;
    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in img.enumerate_pixels() {
        let offset = y as usize * image_size + x as usize;
        data[offset] = pixel[0] as f32 / 255.0;
        data[plane + offset] = pixel[1] as f32 / 255.0;
        data[2 * plane + offset] = pixel[2] as f32 / 255.0;
    }
    data
}

fn binarize(mask: &GrayImage) -> GrayImage {
    let mut out = mask.clone();
    for pixel in out.pixels_mut() {
        *pixel = Luma([if pixel[0] > 127 { 255 } else { 0 }]);
    }
    out
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// One category/split of MVTec AD
#[derive(Debug, Clone)]
pub struct MvtecDataset {
    /// Root directory of the dataset
    pub root: PathBuf,
    pub category: Category,
    pub split: Split,
    /// All samples, sorted by defect type then file name
    pub samples: Vec<DatasetSample>,
}

impl MvtecDataset {
    /// Discover the samples of `category`/`split` under `root`.
    ///
    /// Fails with [`AnomalyError::EmptyDataset`] when the split holds no
    /// images, so per-image statistics never divide by zero.
    pub fn open<P: AsRef<Path>>(root: P, category: Category, split: Split) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let category_dir = root.join(category.as_str());
        let split_dir = category_dir.join(split.as_str());
        info!("Loading MVTec AD {}/{} from: {:?}", category, split, split_dir);

        if !split_dir.is_dir() {
            return Err(AnomalyError::Dataset(format!(
                "Split directory does not exist: {:?}",
                split_dir
            )));
        }

        let mut samples = Vec::new();
        for entry in WalkDir::new(&split_dir)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path().to_path_buf();
            if !entry.file_type().is_file() || !is_image_file(&path) {
                continue;
            }

            let defect_type = path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let label = Label::from_anomalous(defect_type != GOOD_DIR);

            let mask_path = if label.is_anomalous() {
                find_mask(&category_dir, &defect_type, &path)
            } else {
                None
            };

            samples.push(DatasetSample {
                path,
                label,
                mask_path,
                split,
                defect_type,
                id: samples.len(),
            });
        }

        info!("Loaded {} samples", samples.len());
        Self::from_samples(root, category, split, samples)
    }

    /// Build from already discovered samples
    pub fn from_samples(
        root: PathBuf,
        category: Category,
        split: Split,
        samples: Vec<DatasetSample>,
    ) -> Result<Self> {
        if samples.is_empty() {
            return Err(AnomalyError::EmptyDataset {
                category: category.to_string(),
                split: split.to_string(),
            });
        }
        Ok(Self {
            root,
            category,
            split,
            samples,
        })
    }

    /// Get the number of samples in the dataset
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Pick a sample uniformly at random
    pub fn sample_random<R: Rng + ?Sized>(&self, rng: &mut R) -> &DatasetSample {
        &self.samples[rng.gen_range(0..self.samples.len())]
    }

    /// Keep only the first `k` samples; `0` keeps everything
    pub fn limit(mut self, k: usize) -> Self {
        if k > 0 && k < self.samples.len() {
            self.samples.truncate(k);
        }
        self
    }

    /// (normal, abnormal) sample counts
    pub fn label_counts(&self) -> (usize, usize) {
        let abnormal = self
            .samples
            .iter()
            .filter(|s| s.label.is_anomalous())
            .count();
        (self.samples.len() - abnormal, abnormal)
    }
}

fn find_mask(category_dir: &Path, defect_type: &str, image_path: &Path) -> Option<PathBuf> {
    let stem = image_path.file_stem()?.to_string_lossy();
    let mask = category_dir
        .join("ground_truth")
        .join(defect_type)
        .join(format!("{}_mask.png", stem));

    if mask.is_file() {
        Some(mask)
    } else {
        debug!("No ground-truth mask for {:?}", image_path);
        None
    }
}
