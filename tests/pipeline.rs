//! End-to-end export → load → queue run on a synthetic MVTec AD tree

#![cfg(feature = "ndarray")]

use std::path::Path;

use burn_ndarray::NdArray;
use image::{GrayImage, Luma, Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

use anomaly_bench::config::ModelSettings;
use anomaly_bench::export::{export_category, ExportOptions, Precision};
use anomaly_bench::inference::{run_pass, BenchItem, InferQueue, PassKind};
use anomaly_bench::{AnomalyError, Category, CompiledModel, Label, MvtecDataset, Split};

type TestBackend = NdArray;

const SIZE: usize = 32;

fn write_image(path: &Path, rng: &mut ChaCha8Rng, defect: bool) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let img = RgbImage::from_fn(48, 48, |x, y| {
        if defect && (16..32).contains(&x) && (16..32).contains(&y) {
            Rgb([250, 20, 20])
        } else {
            let v = 100 + rng.gen_range(0..20);
            Rgb([v, v, v])
        }
    });
    img.save(path).unwrap();
}

fn write_mask(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    GrayImage::from_fn(48, 48, |x, y| {
        Luma([if (16..32).contains(&x) && (16..32).contains(&y) { 255 } else { 0 }])
    })
    .save(path)
    .unwrap();
}

fn build_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    let cat = dir.path().join("bottle");
    let mut rng = ChaCha8Rng::seed_from_u64(3);

    for i in 0..4 {
        write_image(&cat.join(format!("train/good/{i:03}.png")), &mut rng, false);
    }
    for i in 0..2 {
        write_image(&cat.join(format!("test/good/{i:03}.png")), &mut rng, false);
        write_image(&cat.join(format!("test/broken/{i:03}.png")), &mut rng, true);
        write_mask(&cat.join(format!("ground_truth/broken/{i:03}_mask.png")));
    }
    dir
}

fn options(data: &Path, output: &Path, precision: Precision) -> ExportOptions {
    ExportOptions {
        category: Category::Bottle,
        precision,
        k_shot: 0,
        batch_size: 2,
        dataset_root: data.to_path_buf(),
        output_root: output.to_path_buf(),
        export_threshold: true,
        model: ModelSettings {
            image_size: SIZE,
            coreset_ratio: 0.25,
            ..ModelSettings::default()
        },
    }
}

#[test]
fn export_load_and_benchmark() {
    let data = build_tree();
    let output = TempDir::new().unwrap();
    let device = Default::default();

    let report = export_category::<TestBackend>(&options(data.path(), output.path(), Precision::Fp32), &device)
        .unwrap();
    assert!(report.path.ends_with("bottle/fp32/model.json"));
    assert!(report.path.is_file());
    assert!(report.bank_rows > 0);
    assert_eq!(report.effective_precision, Precision::Fp32);

    let model = CompiledModel::<TestBackend>::load(output.path(), Category::Bottle, Precision::Fp32, &device)
        .unwrap();
    assert_eq!(model.image_size(), SIZE);
    assert!(model.manifest().thresholds_fitted);

    let test = MvtecDataset::open(data.path(), Category::Bottle, Split::Test).unwrap();
    let inputs: Vec<Vec<f32>> = test
        .samples
        .iter()
        .map(|s| s.load_tensor_data(SIZE).unwrap())
        .collect();
    let refs: Vec<&[f32]> = inputs.iter().map(|v| v.as_slice()).collect();
    let results = model.infer_batch(&refs).unwrap();

    assert_eq!(results.len(), 4);
    for result in &results {
        assert!((0.0..=1.0).contains(&result.pred_score));
        assert_eq!(result.anomaly_map.len(), SIZE * SIZE);
        assert_eq!(result.pred_mask.len(), SIZE * SIZE);
        assert_eq!(result.pred_label == Label::Abnormal, result.pred_score >= 0.5);
    }

    // a single image through the queue matches the batched prediction
    let single = model.infer(&inputs[0]).unwrap();
    assert!((single.pred_score - results[0].pred_score).abs() < 1e-4);

    let queue = InferQueue::<BenchItem>::new(model, 2, 2).unwrap();
    let stats = run_pass(&queue, &test, SIZE, PassKind::Inference).unwrap();
    assert_eq!(stats.images, 4);
    assert!(stats.latency() > 0.0);
}

#[test]
fn quantized_exports_load() {
    let data = build_tree();
    let output = TempDir::new().unwrap();
    let device = Default::default();

    for precision in [Precision::Fp16, Precision::Int8, Precision::Int8Ptq] {
        export_category::<TestBackend>(&options(data.path(), output.path(), precision), &device).unwrap();
        let model = CompiledModel::<TestBackend>::load(output.path(), Category::Bottle, precision, &device)
            .unwrap();
        assert_eq!(model.manifest().effective_precision, precision);

        let input = vec![0.4; model.input_len()];
        let result = model.infer(&input).unwrap();
        assert!(result.pred_score.is_finite());
    }
}

#[test]
fn accuracy_controlled_export() {
    let data = build_tree();
    let output = TempDir::new().unwrap();
    let device = Default::default();

    let report = export_category::<TestBackend>(&options(data.path(), output.path(), Precision::Int8Acq), &device)
        .unwrap();
    assert!(report.path.ends_with("bottle/int8_acq/model.json"));
    assert!(Precision::ACQ_CANDIDATES.contains(&report.effective_precision));
    let reference = report.metrics.reference_auroc.unwrap();
    let exported = report.metrics.exported_auroc.unwrap();
    assert!(reference - exported <= ModelSettings::default().max_auroc_drop);

    let model = CompiledModel::<TestBackend>::load(output.path(), Category::Bottle, Precision::Int8Acq, &device)
        .unwrap();
    assert_eq!(model.manifest().precision, Precision::Int8Acq);
    assert_eq!(model.manifest().effective_precision, report.effective_precision);
    let result = model.infer(&vec![0.4; model.input_len()]).unwrap();
    assert!(result.pred_score.is_finite());

    // no candidate can beat a negative tolerance
    let mut strict = options(data.path(), output.path(), Precision::Int8Acq);
    strict.model.max_auroc_drop = -1.0;
    let report = export_category::<TestBackend>(&strict, &device).unwrap();
    assert_eq!(report.effective_precision, Precision::Fp32);
    assert_eq!(report.metrics.exported_auroc, report.metrics.reference_auroc);

    let model = CompiledModel::<TestBackend>::load(output.path(), Category::Bottle, Precision::Int8Acq, &device)
        .unwrap();
    assert_eq!(model.manifest().effective_precision, Precision::Fp32);
}

#[test]
fn image_size_not_multiple_of_eight() {
    let data = build_tree();
    let output = TempDir::new().unwrap();
    let device = Default::default();

    let mut opts = options(data.path(), output.path(), Precision::Fp32);
    opts.model.image_size = 36;
    export_category::<TestBackend>(&opts, &device).unwrap();

    let model = CompiledModel::<TestBackend>::load(output.path(), Category::Bottle, Precision::Fp32, &device)
        .unwrap();
    assert_eq!(model.image_size(), 36);
    let result = model.infer(&vec![0.4; model.input_len()]).unwrap();
    assert_eq!(result.anomaly_map.len(), 36 * 36);
}

#[test]
fn missing_model_and_empty_split() {
    let data = build_tree();
    let device = Default::default();

    let err = CompiledModel::<TestBackend>::load(data.path(), Category::Cable, Precision::Fp16, &device)
        .unwrap_err();
    assert!(matches!(err, AnomalyError::ModelNotFound { .. }));

    std::fs::create_dir_all(data.path().join("cable/test/good")).unwrap();
    let err = MvtecDataset::open(data.path(), Category::Cable, Split::Test).unwrap_err();
    assert!(matches!(err, AnomalyError::EmptyDataset { .. }));
}
