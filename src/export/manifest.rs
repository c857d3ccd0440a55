//! Intermediate representation on disk
//!
//! An exported model is a directory `<root>/<category>/<precision>/` holding:
//!
//! ```text
//! model.json         manifest (this module)
//! model.mpk          backbone weights (Burn named MessagePack record)
//! memory_bank.bin    memory bank (bincode, storage depends on precision)
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, HalfPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::Backend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::quantize;
use super::Precision;
use crate::dataset::Category;
use crate::model::{Backbone, BackboneConfig, NormalizationStats, PatchCoreConfig};
use crate::utils::error::{AnomalyError, Result};

/// Manifest layout version
pub const FORMAT_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "model.json";
/// Record stem; the recorder appends `.mpk`
pub const WEIGHTS_STEM: &str = "model";
pub const BANK_FILE: &str = "memory_bank.bin";

/// Float precision of the backbone record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightPrecision {
    Full,
    Half,
}

/// How the memory bank is encoded in `memory_bank.bin`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BankStorage {
    F32,
    F16,
    Int8PerRow,
    Int8PerChannel,
}

/// Memory bank description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankInfo {
    pub rows: usize,
    pub dim: usize,
    pub storage: BankStorage,
}

/// Accuracy observed while exporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportMetrics {
    /// Image AUROC of the fp32 model on the test split
    pub reference_auroc: Option<f64>,
    /// Image AUROC of the precision `int8_acq` settled on, measured with the
    /// stored memory bank and the weights at their record precision
    pub exported_auroc: Option<f64>,
}

/// `model.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub format_version: u32,
    pub category: Category,
    /// Requested export precision (names the directory)
    pub precision: Precision,
    /// Precision actually stored; differs from `precision` for `int8_acq`
    pub effective_precision: Precision,
    /// NCHW input shape
    pub input_shape: [usize; 4],
    pub model: PatchCoreConfig,
    pub weights: WeightPrecision,
    pub memory_bank: BankInfo,
    pub normalization: NormalizationStats,
    /// Whether `normalization` was fitted on the test split
    pub thresholds_fitted: bool,
    /// Reference images used for the memory bank (0 = all)
    pub k_shot: usize,
    #[serde(default)]
    pub metrics: ExportMetrics,
    pub created_at: DateTime<Utc>,
    pub crate_version: String,
}

impl ModelManifest {
    pub fn backbone_config(&self) -> &BackboneConfig {
        &self.model.backbone
    }

    /// Check the manifest against what this build can load
    pub fn validate(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(AnomalyError::Manifest(format!(
                "Unsupported format version {} (expected {})",
                self.format_version, FORMAT_VERSION
            )));
        }
        if self.memory_bank.dim != self.model.embedding_dim() {
            return Err(AnomalyError::Manifest(format!(
                "Memory bank width {} does not match embedding width {}",
                self.memory_bank.dim,
                self.model.embedding_dim()
            )));
        }
        let expected = [1, 3, self.model.image_size, self.model.image_size];
        if self.input_shape != expected {
            return Err(AnomalyError::Manifest(format!(
                "Input shape {:?} does not match model image size {}",
                self.input_shape, self.model.image_size
            )));
        }
        Ok(())
    }
}

/// Memory bank contents as serialized with bincode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoredBank {
    F32(Vec<f32>),
    /// IEEE half bit patterns
    F16(Vec<u16>),
    Int8PerRow {
        values: Vec<i8>,
        scales: Vec<f32>,
    },
    /// Bank and embeddings share calibrated channel scales
    Int8PerChannel {
        values: Vec<i8>,
        channel_scales: Vec<f32>,
    },
}

/// Dequantized bank ready for upload
#[derive(Debug, Clone)]
pub struct DecodedBank {
    pub data: Vec<f32>,
    /// Per-channel scales for embedding fake quantization
    pub embedding_scales: Option<Vec<f32>>,
}

impl StoredBank {
    /// Encode an f32 bank for `precision`.
    ///
    /// `channel_scales` is required for [`Precision::Int8Ptq`].
    pub fn encode(
        precision: Precision,
        data: &[f32],
        dim: usize,
        channel_scales: Option<&[f32]>,
    ) -> Result<Self> {
        match precision {
            Precision::Fp32 => Ok(StoredBank::F32(data.to_vec())),
            Precision::Fp16 => Ok(StoredBank::F16(quantize::to_f16_bits(data))),
            Precision::Int8 => {
                let (values, scales) = quantize::quantize_per_row(data, dim);
                Ok(StoredBank::Int8PerRow { values, scales })
            }
            Precision::Int8Ptq => {
                let scales = channel_scales.ok_or_else(|| {
                    AnomalyError::Model("Post-training quantization needs calibrated scales".to_string())
                })?;
                Ok(StoredBank::Int8PerChannel {
                    values: quantize::quantize_per_channel(data, scales),
                    channel_scales: scales.to_vec(),
                })
            }
            Precision::Int8Acq => Err(AnomalyError::UnsupportedExportType(
                "int8_acq must be resolved to a concrete precision before encoding".to_string(),
            )),
        }
    }

    pub fn storage(&self) -> BankStorage {
        match self {
            StoredBank::F32(_) => BankStorage::F32,
            StoredBank::F16(_) => BankStorage::F16,
            StoredBank::Int8PerRow { .. } => BankStorage::Int8PerRow,
            StoredBank::Int8PerChannel { .. } => BankStorage::Int8PerChannel,
        }
    }

    pub fn decode(&self, dim: usize) -> DecodedBank {
        match self {
            StoredBank::F32(data) => DecodedBank {
                data: data.clone(),
                embedding_scales: None,
            },
            StoredBank::F16(bits) => DecodedBank {
                data: quantize::from_f16_bits(bits),
                embedding_scales: None,
            },
            StoredBank::Int8PerRow { values, scales } => DecodedBank {
                data: quantize::dequantize_per_row(values, scales, dim),
                embedding_scales: None,
            },
            StoredBank::Int8PerChannel {
                values,
                channel_scales,
            } => DecodedBank {
                data: quantize::dequantize_per_channel(values, channel_scales),
                embedding_scales: Some(channel_scales.clone()),
            },
        }
    }
}

/// Directory of an exported model
pub fn model_dir(root: &Path, category: Category, precision: Precision) -> PathBuf {
    root.join(category.as_str()).join(precision.as_str())
}

pub fn save_manifest(dir: &Path, manifest: &ModelManifest) -> Result<PathBuf> {
    let path = dir.join(MANIFEST_FILE);
    let writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(writer, manifest)?;
    Ok(path)
}

pub fn load_manifest(path: &Path) -> Result<ModelManifest> {
    let reader = BufReader::new(File::open(path)?);
    let manifest: ModelManifest = serde_json::from_reader(reader)
        .map_err(|e| AnomalyError::Manifest(format!("{}: {}", path.display(), e)))?;
    manifest.validate()?;
    Ok(manifest)
}

pub fn save_bank(dir: &Path, bank: &StoredBank) -> Result<PathBuf> {
    let path = dir.join(BANK_FILE);
    let writer = BufWriter::new(File::create(&path)?);
    bincode::serialize_into(writer, bank)?;
    Ok(path)
}

pub fn load_bank(dir: &Path) -> Result<StoredBank> {
    let reader = BufReader::new(File::open(dir.join(BANK_FILE))?);
    Ok(bincode::deserialize_from(reader)?)
}

pub fn save_backbone<B: Backend>(dir: &Path, backbone: &Backbone<B>, precision: WeightPrecision) -> Result<()> {
    let path = dir.join(WEIGHTS_STEM);
    let result = match precision {
        WeightPrecision::Full => backbone
            .clone()
            .save_file(path, &NamedMpkFileRecorder::<FullPrecisionSettings>::new()),
        WeightPrecision::Half => backbone
            .clone()
            .save_file(path, &NamedMpkFileRecorder::<HalfPrecisionSettings>::new()),
    };
    result.map_err(|e| AnomalyError::Model(format!("Failed to save backbone weights: {:?}", e)))
}

/// The backbone as it reads back after being saved at `precision`
pub fn round_trip_backbone<B: Backend>(
    backbone: &Backbone<B>,
    precision: WeightPrecision,
    device: &B::Device,
) -> Result<Backbone<B>> {
    if precision == WeightPrecision::Full {
        return Ok(backbone.clone());
    }

    let recorder = BinBytesRecorder::<HalfPrecisionSettings>::default();
    let bytes = Recorder::<B>::record(&recorder, backbone.clone().into_record(), ())
        .map_err(|e| AnomalyError::Model(format!("Failed to record backbone weights: {:?}", e)))?;
    let record = Recorder::<B>::load(&recorder, bytes, device)
        .map_err(|e| AnomalyError::Model(format!("Failed to reload backbone weights: {:?}", e)))?;
    Ok(backbone.clone().load_record(record))
}

pub fn load_backbone<B: Backend>(
    dir: &Path,
    config: &BackboneConfig,
    precision: WeightPrecision,
    device: &B::Device,
) -> Result<Backbone<B>> {
    load_backbone_record(&dir.join(WEIGHTS_STEM), config, precision, device)
}

/// Load backbone weights from a record file (`.mpk` may be omitted)
pub fn load_backbone_record<B: Backend>(
    path: &Path,
    config: &BackboneConfig,
    precision: WeightPrecision,
    device: &B::Device,
) -> Result<Backbone<B>> {
    let backbone = config.init::<B>(device);
    let path = path.with_extension("");
    let result = match precision {
        WeightPrecision::Full => backbone.load_file(
            path.clone(),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        ),
        WeightPrecision::Half => backbone.load_file(
            path.clone(),
            &NamedMpkFileRecorder::<HalfPrecisionSettings>::new(),
            device,
        ),
    };
    result.map_err(|e| {
        AnomalyError::Model(format!("Failed to load backbone weights from {:?}: {:?}", path, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest() -> ModelManifest {
        let model = PatchCoreConfig::new(BackboneConfig::new());
        ModelManifest {
            format_version: FORMAT_VERSION,
            category: Category::Bottle,
            precision: Precision::Fp16,
            effective_precision: Precision::Fp16,
            input_shape: [1, 3, 256, 256],
            memory_bank: BankInfo {
                rows: 10,
                dim: model.embedding_dim(),
                storage: BankStorage::F16,
            },
            model,
            weights: WeightPrecision::Half,
            normalization: NormalizationStats::default(),
            thresholds_fitted: false,
            k_shot: 0,
            metrics: ExportMetrics::default(),
            created_at: Utc::now(),
            crate_version: crate::VERSION.to_string(),
        }
    }

    #[test]
    fn test_manifest_file_round_trip() {
        let dir = TempDir::new().unwrap();
        save_manifest(dir.path(), &manifest()).unwrap();

        let loaded = load_manifest(&dir.path().join(MANIFEST_FILE)).unwrap();
        assert_eq!(loaded.category, Category::Bottle);
        assert_eq!(loaded.memory_bank.dim, 384);
        assert_eq!(loaded.normalization, NormalizationStats::default());

        let json = std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        assert!(json.contains("\"precision\": \"fp16\""));
    }

    #[test]
    fn test_manifest_rejects_mismatched_bank() {
        let mut m = manifest();
        m.memory_bank.dim = 12;
        assert!(matches!(m.validate(), Err(AnomalyError::Manifest(_))));
    }

    #[test]
    fn test_bank_storage_by_precision() {
        let data = vec![0.5, -0.25, 1.0, 2.0];
        let scales = [0.01, 0.02];

        let int8 = StoredBank::encode(Precision::Int8, &data, 2, None).unwrap();
        assert_eq!(int8.storage(), BankStorage::Int8PerRow);
        assert!(int8.decode(2).embedding_scales.is_none());

        let ptq = StoredBank::encode(Precision::Int8Ptq, &data, 2, Some(&scales)).unwrap();
        let decoded = ptq.decode(2);
        assert_eq!(decoded.embedding_scales.as_deref(), Some(&scales[..]));
        assert!((decoded.data[0] - 0.5).abs() < 1e-6);

        assert!(StoredBank::encode(Precision::Int8Ptq, &data, 2, None).is_err());
        assert!(StoredBank::encode(Precision::Int8Acq, &data, 2, None).is_err());
    }

    #[test]
    fn test_bank_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let bank = StoredBank::encode(Precision::Fp16, &[1.0, 2.0, 3.0, 4.0], 2, None).unwrap();
        save_bank(dir.path(), &bank).unwrap();

        let loaded = load_bank(dir.path()).unwrap();
        assert_eq!(loaded.storage(), BankStorage::F16);
        assert_eq!(loaded.decode(2).data, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[cfg(feature = "ndarray")]
    #[test]
    fn test_half_round_trip_matches_saved_weights() {
        use burn::tensor::Tensor;
        use burn_ndarray::NdArray;

        let device = Default::default();
        let config = BackboneConfig::new().with_base_channels(8).with_blocks_per_stage(1);
        let backbone = config.init::<NdArray>(&device);
        let dir = TempDir::new().unwrap();

        save_backbone(dir.path(), &backbone, WeightPrecision::Half).unwrap();
        let loaded = load_backbone::<NdArray>(dir.path(), &config, WeightPrecision::Half, &device).unwrap();
        let rounded = round_trip_backbone(&backbone, WeightPrecision::Half, &device).unwrap();

        let images = Tensor::<NdArray, 4>::ones([1, 3, 32, 32], &device) * 0.5;
        let expected: Vec<f32> = loaded.forward(images.clone()).layer2.into_data().to_vec().unwrap();
        let actual: Vec<f32> = rounded.forward(images).layer2.into_data().to_vec().unwrap();
        assert_eq!(expected.len(), actual.len());
        for (e, a) in expected.iter().zip(&actual) {
            assert!((e - a).abs() < 1e-6, "{e} vs {a}");
        }
    }

    #[test]
    fn test_model_dir_layout() {
        let dir = model_dir(Path::new("ovmodels"), Category::MetalNut, Precision::Int8Ptq);
        assert_eq!(dir, PathBuf::from("ovmodels/metal_nut/int8_ptq"));
    }
}
