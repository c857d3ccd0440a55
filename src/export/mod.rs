//! Model export
//!
//! Fits a PatchCore model for one MVTec AD category and writes it to the IR
//! directory at the requested precision:
//!
//! - `fp32`: full precision weights and memory bank
//! - `fp16`: half precision weights and memory bank
//! - `int8`: weight-only int8 memory bank (per-row scales)
//! - `int8_ptq`: int8 memory bank and embeddings, per-channel scales calibrated
//!   on the training batches
//! - `int8_acq`: the most compressed of `int8_ptq`, `int8`, `fp16` whose image
//!   AUROC stays within `max_auroc_drop` of fp32

pub mod manifest;
pub mod quantize;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::backend::Backend;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ModelSettings;
use crate::dataset::{Category, MvtecBatch, MvtecBatcher, MvtecBurnDataset, MvtecDataset, Split};
use crate::model::{
    patchcore::subsample_embeddings, BackboneConfig, CoresetSampler, MemoryBank, NormalizationStats,
    PatchCore, PatchCoreConfig,
};
use crate::utils::error::{AnomalyError, Result};
use crate::utils::logging::progress_bar;
use crate::utils::metrics::{adaptive_f1_threshold, auroc};

use manifest::{
    BankInfo, ExportMetrics, ModelManifest, StoredBank, WeightPrecision, FORMAT_VERSION,
};
use quantize::ChannelCalibrator;

pub use manifest::{load_manifest, model_dir, MANIFEST_FILE};

/// Export precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    Fp16,
    Int8,
    Int8Ptq,
    Int8Acq,
}

impl Precision {
    pub const ALL: [Precision; 5] = [
        Precision::Fp32,
        Precision::Fp16,
        Precision::Int8,
        Precision::Int8Ptq,
        Precision::Int8Acq,
    ];

    /// Candidates tried by accuracy-controlled quantization, most compressed first
    pub const ACQ_CANDIDATES: [Precision; 3] = [Precision::Int8Ptq, Precision::Int8, Precision::Fp16];

    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Int8 => "int8",
            Precision::Int8Ptq => "int8_ptq",
            Precision::Int8Acq => "int8_acq",
        }
    }

    /// Float precision of the stored backbone record
    pub fn weight_precision(&self) -> WeightPrecision {
        match self {
            Precision::Fp32 => WeightPrecision::Full,
            _ => WeightPrecision::Half,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = AnomalyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| AnomalyError::UnsupportedExportType(s.to_string()))
    }
}

/// Everything needed to export one category
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub category: Category,
    pub precision: Precision,
    /// Reference images for the memory bank (0 = all)
    pub k_shot: usize,
    pub batch_size: usize,
    pub dataset_root: PathBuf,
    pub output_root: PathBuf,
    /// Fit thresholds and normalization on the test split
    pub export_threshold: bool,
    pub model: ModelSettings,
}

/// Outcome of an export
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub category: Category,
    /// IR directory
    pub path: PathBuf,
    pub precision: Precision,
    pub effective_precision: Precision,
    pub bank_rows: usize,
    pub normalization: NormalizationStats,
    pub metrics: ExportMetrics,
    pub elapsed_secs: f64,
}

/// Raw test split outputs of a fitted model
#[derive(Debug, Clone, Default)]
pub struct SplitScores {
    pub scores: Vec<f32>,
    pub labels: Vec<bool>,
    /// Anomaly maps, kept only when requested
    pub maps: Vec<Vec<f32>>,
    pub masks: Vec<Vec<bool>>,
}

/// Score every item of `dataset`
pub fn score_split<B: Backend>(
    model: &PatchCore<B>,
    dataset: &MvtecBurnDataset,
    batch_size: usize,
    keep_maps: bool,
    device: &B::Device,
) -> Result<SplitScores> {
    let batcher = MvtecBatcher::new(dataset.image_size());
    let mut out = SplitScores::default();

    let pb = progress_bar(dataset.len(), "Scoring");
    for items in dataset.batches(batch_size) {
        let n = items.len();
        let batch: MvtecBatch<B> = batcher.batch(items, device);
        for (prediction, (label, mask)) in model
            .predict(batch.images)?
            .into_iter()
            .zip(batch.anomalous.into_iter().zip(batch.masks))
        {
            out.scores.push(prediction.score);
            out.labels.push(label);
            if keep_maps {
                out.maps.push(prediction.anomaly_map);
                out.masks.push(mask);
            }
        }
        pb.inc(n as u64);
    }
    pb.finish_and_clear();
    Ok(out)
}

/// Every `PIXEL_STRIDE`-th pixel takes part in the pixel threshold search
const PIXEL_STRIDE: usize = 7;

/// Fit image and pixel thresholds by adaptive F1 and record the map range
pub fn fit_normalization(scores: &SplitScores) -> NormalizationStats {
    let image_threshold = adaptive_f1_threshold(&scores.scores, &scores.labels)
        .map(|fit| fit.threshold)
        .unwrap_or_else(|| {
            warn!("No abnormal images to fit the image threshold, using the largest score");
            scores.scores.iter().copied().fold(f32::MIN, f32::max)
        });

    let (pixels, pixel_labels): (Vec<f32>, Vec<bool>) = scores
        .maps
        .iter()
        .zip(&scores.masks)
        .flat_map(|(map, mask)| map.iter().copied().zip(mask.iter().copied()))
        .step_by(PIXEL_STRIDE)
        .unzip();

    let (min, max) = NormalizationStats::observed_range(scores.maps.iter().map(|m| m.as_slice()))
        .unwrap_or((0.0, 1.0));

    let pixel_threshold = adaptive_f1_threshold(&pixels, &pixel_labels)
        .map(|fit| fit.threshold)
        .unwrap_or(image_threshold);

    NormalizationStats {
        image_threshold,
        pixel_threshold,
        min,
        max,
    }
}

/// Build the model, fit the memory bank and write the IR for one category
pub fn export_category<B: Backend>(options: &ExportOptions, device: &B::Device) -> Result<ExportReport> {
    let start = Instant::now();
    let settings = &options.model;
    let batch_size = options.batch_size.max(1);
    info!(
        "Starting export IR for {} {}-shot at {}",
        options.category, options.k_shot, options.precision
    );

    let config = PatchCoreConfig::new(BackboneConfig::new()).with_image_size(settings.image_size);
    let dim = config.embedding_dim();
    let mut model = match &settings.backbone_weights {
        Some(path) => {
            info!("Loading backbone weights from {:?}", path);
            let backbone = manifest::load_backbone_record::<B>(path, &config.backbone, WeightPrecision::Full, device)?;
            PatchCore::with_backbone(&config, backbone, device)
        }
        None => PatchCore::new(&config, device),
    };

    // Memory bank from the reference images
    let train = MvtecDataset::open(&options.dataset_root, options.category, Split::Train)?.limit(options.k_shot);
    let train = MvtecBurnDataset::load(train.samples, settings.image_size)?;
    let batcher = MvtecBatcher::new(settings.image_size);

    let mut embeddings = Vec::with_capacity(train.len() * config.patches_per_image() * dim);
    let mut calibrator = ChannelCalibrator::new(dim);
    let pb = progress_bar(train.len(), "Embedding");
    for items in train.batches(batch_size) {
        let n = items.len();
        let batch: MvtecBatch<B> = batcher.batch(items, device);
        let batch_embeddings = model.embed_to_vec(batch.images)?;
        calibrator.observe(&batch_embeddings);
        embeddings.extend(batch_embeddings);
        pb.inc(n as u64);
    }
    pb.finish_and_clear();

    let sampler = CoresetSampler::new(settings.coreset_ratio, settings.seed);
    let bank = subsample_embeddings(&embeddings, dim, &sampler);
    drop(embeddings);
    let bank_rows = bank.len() / dim;
    info!("Memory bank: {} x {} ({} calibration rows)", bank_rows, dim, calibrator.rows_seen());

    model.set_memory_bank(MemoryBank::new(&bank, dim, None, config.bank_chunk, device)?);

    let needs_test = options.export_threshold || options.precision == Precision::Int8Acq;
    let test = if needs_test {
        let test = MvtecDataset::open(&options.dataset_root, options.category, Split::Test)?;
        let (normal, abnormal) = test.label_counts();
        info!("Test split: {} normal, {} abnormal images", normal, abnormal);
        Some(MvtecBurnDataset::load(test.samples, settings.image_size)?)
    } else {
        None
    };

    let mut metrics = ExportMetrics::default();
    let reference = match &test {
        Some(test) => {
            let scores = score_split(&model, test, batch_size, options.export_threshold, device)?;
            metrics.reference_auroc = auroc(&scores.scores, &scores.labels);
            Some(scores)
        }
        None => None,
    };

    let normalization = match (&reference, options.export_threshold) {
        (Some(scores), true) => fit_normalization(scores),
        _ => NormalizationStats::default(),
    };

    let channel_scales = calibrator.scales();
    let effective_precision = match (options.precision, &test) {
        (Precision::Int8Acq, Some(test)) => {
            let (precision, exported_auroc) = select_acq_precision(
                &model,
                &bank,
                &channel_scales,
                metrics.reference_auroc,
                settings.max_auroc_drop,
                test,
                batch_size,
                device,
            )?;
            metrics.exported_auroc = exported_auroc;
            precision
        }
        (precision, _) => precision,
    };

    let stored = StoredBank::encode(effective_precision, &bank, dim, Some(&channel_scales))?;

    let dir = model_dir(&options.output_root, options.category, options.precision);
    std::fs::create_dir_all(&dir)?;

    let weights = effective_precision.weight_precision();
    manifest::save_backbone(&dir, model.backbone(), weights)?;
    manifest::save_bank(&dir, &stored)?;

    let manifest = ModelManifest {
        format_version: FORMAT_VERSION,
        category: options.category,
        precision: options.precision,
        effective_precision,
        input_shape: [1, 3, settings.image_size, settings.image_size],
        model: config,
        weights,
        memory_bank: BankInfo {
            rows: bank_rows,
            dim,
            storage: stored.storage(),
        },
        normalization,
        thresholds_fitted: options.export_threshold,
        k_shot: options.k_shot,
        metrics: metrics.clone(),
        created_at: Utc::now(),
        crate_version: crate::VERSION.to_string(),
    };
    let manifest_path = manifest::save_manifest(&dir, &manifest)?;
    debug!("Wrote manifest {:?}", manifest_path);

    Ok(ExportReport {
        category: options.category,
        path: manifest_path,
        precision: options.precision,
        effective_precision,
        bank_rows,
        normalization,
        metrics,
        elapsed_secs: start.elapsed().as_secs_f64(),
    })
}

/// Score every ACQ candidate as it will be exported: quantized memory bank
/// and the backbone weights read back at the candidate's record precision
#[allow(clippy::too_many_arguments)]
fn select_acq_precision<B: Backend>(
    model: &PatchCore<B>,
    bank: &[f32],
    channel_scales: &[f32],
    reference_auroc: Option<f64>,
    max_drop: f64,
    test: &MvtecBurnDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<(Precision, Option<f64>)> {
    let dim = model.config().embedding_dim();
    let half = PatchCore::with_backbone(
        model.config(),
        manifest::round_trip_backbone(model.backbone(), WeightPrecision::Half, device)?,
        device,
    );

    choose_acq_precision(reference_auroc, max_drop, |candidate| {
        let decoded = StoredBank::encode(candidate, bank, dim, Some(channel_scales))?.decode(dim);
        let mut quantized = match candidate.weight_precision() {
            WeightPrecision::Half => half.clone(),
            WeightPrecision::Full => model.clone(),
        };
        quantized.set_memory_bank(MemoryBank::new(
            &decoded.data,
            dim,
            decoded.embedding_scales.as_deref(),
            model.config().bank_chunk,
            device,
        )?);

        let scores = score_split(&quantized, test, batch_size, false, device)?;
        Ok(auroc(&scores.scores, &scores.labels))
    })
}

/// Pick the first candidate whose image AUROC is within `max_drop` of fp32.
///
/// Without a reference AUROC (single-class test split) nothing can be
/// compared and `int8_ptq` is kept.
fn choose_acq_precision<F>(
    reference_auroc: Option<f64>,
    max_drop: f64,
    mut evaluate: F,
) -> Result<(Precision, Option<f64>)>
where
    F: FnMut(Precision) -> Result<Option<f64>>,
{
    let Some(reference) = reference_auroc else {
        warn!("Test split has a single class, AUROC is undefined; keeping int8_ptq");
        return Ok((Precision::Int8Ptq, None));
    };

    for candidate in Precision::ACQ_CANDIDATES {
        let candidate_auroc = evaluate(candidate)?;
        let auroc_drop = candidate_auroc.map(|a| reference - a).unwrap_or(f64::INFINITY);
        info!(
            "ACQ candidate {}: AUROC {:.4} (fp32 {:.4}, drop {:.4})",
            candidate,
            candidate_auroc.unwrap_or(f64::NAN),
            reference,
            auroc_drop
        );

        if auroc_drop <= max_drop {
            return Ok((candidate, candidate_auroc));
        }
    }

    warn!("No quantized candidate within {:.4} AUROC of fp32, keeping fp32", max_drop);
    Ok((Precision::Fp32, Some(reference)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_parse() {
        for precision in Precision::ALL {
            assert_eq!(precision.as_str().parse::<Precision>().unwrap(), precision);
        }
    }

    #[test]
    fn test_precision_rejects_unknown() {
        let err = "int4".parse::<Precision>().unwrap_err();
        assert!(matches!(err, AnomalyError::UnsupportedExportType(ref s) if s == "int4"));
        assert!(err.to_string().starts_with("int4 is not a supported export type"));
        assert!("FP16".parse::<Precision>().is_err());
    }

    #[test]
    fn test_acq_takes_first_candidate_within_drop() {
        let mut tried = Vec::new();
        let chosen = choose_acq_precision(Some(0.95), 0.01, |candidate| {
            tried.push(candidate);
            Ok(Some(match candidate {
                Precision::Int8Ptq => 0.90,
                Precision::Int8 => 0.945,
                _ => 0.95,
            }))
        })
        .unwrap();

        assert_eq!(chosen, (Precision::Int8, Some(0.945)));
        assert_eq!(tried, vec![Precision::Int8Ptq, Precision::Int8]);
    }

    #[test]
    fn test_acq_falls_back_to_fp32() {
        let mut tried = 0;
        let chosen = choose_acq_precision(Some(1.0), -1.0, |_| {
            tried += 1;
            Ok(Some(1.0))
        })
        .unwrap();

        assert_eq!(chosen, (Precision::Fp32, Some(1.0)));
        assert_eq!(tried, Precision::ACQ_CANDIDATES.len());
    }

    #[test]
    fn test_acq_single_class_keeps_int8_ptq() {
        let chosen = choose_acq_precision(None, 0.01, |_| -> Result<Option<f64>> {
            panic!("candidates are not scored without a reference")
        })
        .unwrap();
        assert_eq!(chosen, (Precision::Int8Ptq, None));
    }

    #[test]
    fn test_acq_undefined_candidate_auroc_is_rejected() {
        let chosen = choose_acq_precision(Some(0.8), 0.5, |candidate| {
            Ok((candidate == Precision::Fp16).then_some(0.8))
        })
        .unwrap();
        assert_eq!(chosen, (Precision::Fp16, Some(0.8)));
    }

    #[test]
    fn test_acq_propagates_scoring_errors() {
        let err = choose_acq_precision(Some(0.9), 0.01, |_| {
            Err(AnomalyError::Model("scoring failed".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, AnomalyError::Model(_)));
    }

    #[test]
    fn test_weight_precision() {
        assert_eq!(Precision::Fp32.weight_precision(), WeightPrecision::Full);
        assert_eq!(Precision::Int8Ptq.weight_precision(), WeightPrecision::Half);
    }

    #[test]
    fn test_fit_normalization() {
        let scores = SplitScores {
            scores: vec![1.0, 2.0, 5.0, 6.0],
            labels: vec![false, false, true, true],
            maps: vec![vec![0.5, 0.5], vec![1.0, 1.0], vec![4.0, 1.0], vec![8.0, 1.0]],
            masks: vec![vec![false, false], vec![false, false], vec![true, false], vec![true, false]],
        };
        let stats = fit_normalization(&scores);

        assert_eq!(stats.image_threshold, 5.0);
        assert_eq!(stats.min, 0.5);
        assert_eq!(stats.max, 8.0);
        assert!((stats.normalize_score(5.0) - 0.5).abs() < 1e-6);
    }
}
