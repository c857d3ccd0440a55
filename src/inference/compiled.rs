//! Loading an exported model for inference
//!
//! Reads the manifest, backbone record and memory bank of an IR directory and
//! assembles a PatchCore model on the target device.

use std::path::{Path, PathBuf};

use burn::tensor::{backend::Backend, Tensor, TensorData};
use tracing::info;

use super::result::InferenceResult;
use crate::dataset::Category;
use crate::export::manifest::{self, ModelManifest};
use crate::export::Precision;
use crate::model::{MemoryBank, PatchCore};
use crate::utils::error::{AnomalyError, Result};

/// A loaded, inference-ready model
#[derive(Debug, Clone)]
pub struct CompiledModel<B: Backend> {
    model: PatchCore<B>,
    manifest: ModelManifest,
    device: B::Device,
}

impl<B: Backend> CompiledModel<B> {
    /// Load `<model_root>/<category>/<precision>/model.json`
    pub fn load(
        model_root: &Path,
        category: Category,
        precision: Precision,
        device: &B::Device,
    ) -> Result<Self> {
        let dir = manifest::model_dir(model_root, category, precision);
        Self::from_dir(&dir, category, device)
    }

    /// Load the IR in `dir`
    pub fn from_dir(dir: &Path, category: Category, device: &B::Device) -> Result<Self> {
        let manifest_path: PathBuf = dir.join(manifest::MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(AnomalyError::ModelNotFound {
                path: manifest_path,
                category: category.to_string(),
            });
        }

        let manifest = manifest::load_manifest(&manifest_path)?;
        if manifest.category != category {
            return Err(AnomalyError::Manifest(format!(
                "{} holds a {} model, expected {}",
                manifest_path.display(),
                manifest.category,
                category
            )));
        }

        let backbone = manifest::load_backbone::<B>(dir, manifest.backbone_config(), manifest.weights, device)?;
        let decoded = manifest::load_bank(dir)?.decode(manifest.memory_bank.dim);

        let mut model = PatchCore::with_backbone(&manifest.model, backbone, device);
        model.set_memory_bank(MemoryBank::new(
            &decoded.data,
            manifest.memory_bank.dim,
            decoded.embedding_scales.as_deref(),
            manifest.model.bank_chunk,
            device,
        )?);

        info!(
            "Loaded {} model ({}, {} bank rows) from {:?}",
            category, manifest.effective_precision, manifest.memory_bank.rows, dir
        );

        Ok(Self {
            model,
            manifest,
            device: device.clone(),
        })
    }

    pub fn manifest(&self) -> &ModelManifest {
        &self.manifest
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Side of the square model input
    pub fn image_size(&self) -> usize {
        self.manifest.model.image_size
    }

    /// Number of floats in one CHW input
    pub fn input_len(&self) -> usize {
        3 * self.image_size() * self.image_size()
    }

    /// Run one CHW image in [0, 1] through the model
    pub fn infer(&self, input: &[f32]) -> Result<InferenceResult> {
        let mut results = self.infer_batch(&[input])?;
        results
            .pop()
            .ok_or_else(|| AnomalyError::Inference("Model returned no prediction".to_string()))
    }

    /// Run several CHW images as one batch
    pub fn infer_batch(&self, inputs: &[&[f32]]) -> Result<Vec<InferenceResult>> {
        let size = self.image_size();
        let expected = self.input_len();
        if let Some(bad) = inputs.iter().find(|i| i.len() != expected) {
            return Err(AnomalyError::Inference(format!(
                "Expected input of {} values ([3, {}, {}]), got {}",
                expected,
                size,
                size,
                bad.len()
            )));
        }
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let data: Vec<f32> = inputs.iter().flat_map(|i| i.iter().copied()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(data, [inputs.len(), 3, size, size]),
            &self.device,
        );

        let stats = self.manifest.normalization;
        Ok(self
            .model
            .predict(images)?
            .into_iter()
            .map(|raw| InferenceResult::from_raw(raw, &stats, size))
            .collect())
    }
}
