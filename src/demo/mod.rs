//! Interactive demo
//!
//! Repeatedly picks a random test image, runs one synchronous inference and
//! renders `original | edge | predicted-mask overlay` with the labels, score
//! and latency burned in. Frames go to a [`FrameSink`]: a full-screen window
//! (feature `display`) or PNG files on disk.

#[cfg(feature = "display")]
pub mod window;

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::Rng;
use tracing::{debug, info};

use crate::config::DisplayConfig;
use crate::dataset::mvtec::to_chw;
use crate::dataset::{Category, Label, MvtecDataset};
use crate::inference::{InferenceEngine, InferenceResult};
use crate::utils::error::{AnomalyError, Result};
use crate::visualize::{self, text, Padding, BLACK, GREEN, RED, WHITE};

#[cfg(feature = "display")]
pub use window::WindowSink;

/// Destination of rendered frames
pub trait FrameSink {
    /// Present one frame. Returns `false` once the user asked to stop.
    fn show(&mut self, frame: &RgbImage) -> Result<bool>;
}

/// Writes frames as `frame_NNNN.png` and stops after `max_frames`
pub struct HeadlessSink {
    dir: PathBuf,
    max_frames: usize,
    written: usize,
}

impl HeadlessSink {
    pub fn new(dir: impl Into<PathBuf>, max_frames: usize) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_frames: max_frames.max(1),
            written: 0,
        })
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl FrameSink for HeadlessSink {
    fn show(&mut self, frame: &RgbImage) -> Result<bool> {
        let path = self.dir.join(format!("frame_{:04}.png", self.written));
        visualize::save_rgb(frame, &path)?;
        self.written += 1;
        debug!("Wrote {:?}", path);
        Ok(self.written < self.max_frames)
    }
}

/// Print the numbered category menu and read the choice
pub fn prompt_category<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> Result<Category> {
    writeln!(output, "Please select the category for demo:")?;
    for category in Category::ALL {
        writeln!(output, "{}. {}", category.menu_index(), category)?;
    }
    write!(output, "Enter the number: ")?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    let choice = line.trim();

    let category = choice
        .parse::<usize>()
        .ok()
        .and_then(Category::from_menu_index)
        .ok_or_else(|| AnomalyError::UnknownCategories(vec![choice.to_string()]))?;

    writeln!(output, "You selected the category '{}' to run the demo", category)?;
    Ok(category)
}

/// What gets burned into a frame
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub gt_label: Label,
    pub pred_label: Label,
    pub pred_score: f32,
    pub latency: Duration,
}

impl FrameInfo {
    pub fn new(gt_label: Label, result: &InferenceResult, latency: Duration) -> Self {
        Self {
            gt_label,
            pred_label: result.pred_label,
            pred_score: result.pred_score,
            latency,
        }
    }

    /// Lines drawn over the overlay panel
    pub fn prediction_lines(&self) -> [String; 3] {
        [
            format!("Pred Label: {}", self.pred_label),
            format!("Pred Score: {:.3}", self.pred_score),
            format!("Latency: {:.0} ms", self.latency.as_secs_f64() * 1000.0),
        ]
    }
}

/// Glyph scale for an image of `height` pixels
fn text_scale(height: u32) -> u32 {
    (height / 256).max(1)
}

/// Build the display frame for one prediction
pub fn compose_frame(
    original: &RgbImage,
    result: &InferenceResult,
    info: &FrameInfo,
    display: &DisplayConfig,
) -> RgbImage {
    let (width, height) = original.dimensions();
    let mask = visualize::resize_mask(
        &result.pred_mask,
        result.width as u32,
        result.height as u32,
        width,
        height,
    );
    let overlay = visualize::fill_overlay(original, &mask, RED, display.overlay_alpha);
    let mut frame = visualize::hstack(&[original, &overlay], display.edge_width, BLACK);

    let scale = text_scale(height);
    let margin = text::line_height(scale) * 2;
    let spacing = text::line_height(scale);
    text::draw_text(
        &mut frame,
        &format!("GT Label: {}", info.gt_label),
        margin,
        margin,
        scale,
        GREEN,
    );
    text::draw_lines(
        &mut frame,
        &info.prediction_lines(),
        width + display.edge_width + margin,
        margin,
        scale,
        spacing,
        RED,
    );

    visualize::resize_with_padding(&frame, display.width, display.height, WHITE, Padding::Centered)
}

/// Random-sample demo loop over one category's test split
pub struct DemoRunner<E, R> {
    engine: E,
    image_size: usize,
    dataset: MvtecDataset,
    display: DisplayConfig,
    rng: R,
}

impl<E: InferenceEngine, R: Rng> DemoRunner<E, R> {
    pub fn new(engine: E, image_size: usize, dataset: MvtecDataset, display: DisplayConfig, rng: R) -> Self {
        Self {
            engine,
            image_size,
            dataset,
            display,
            rng,
        }
    }

    /// Infer one random sample and render its frame
    pub fn step(&mut self) -> Result<RgbImage> {
        let sample = self.dataset.sample_random(&mut self.rng).clone();
        let original = sample.load_image()?;

        let size = self.image_size as u32;
        let start = Instant::now();
        let resized = imageops::resize(&original, size, size, FilterType::Triangle);
        let result = self.engine.infer(&to_chw(&resized, self.image_size))?;
        let latency = start.elapsed();

        debug!(
            "{:?}: score {:.3} ({}) in {:?}",
            sample.path, result.pred_score, result.pred_label, latency
        );

        let info = FrameInfo::new(sample.label, &result, latency);
        Ok(compose_frame(&original, &result, &info, &self.display))
    }

    /// Render frames until the sink asks to stop; returns the frame count
    pub fn run<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> Result<usize> {
        let mut frames = 0;
        loop {
            let frame = self.step()?;
            frames += 1;
            if !sink.show(&frame)? {
                break;
            }
        }
        info!("Demo stopped after {} frames", frames);
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Split;
    use image::Rgb;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[derive(Clone)]
    struct ConstEngine {
        size: usize,
        score: f32,
    }

    impl InferenceEngine for ConstEngine {
        fn infer(&self, input: &[f32]) -> Result<InferenceResult> {
            assert_eq!(input.len(), 3 * self.size * self.size);
            let plane = self.size * self.size;
            Ok(InferenceResult {
                pred_score: self.score,
                pred_label: Label::from_anomalous(self.score >= 0.5),
                anomaly_map: vec![self.score; plane],
                pred_mask: (0..plane).map(|i| i < plane / 2).collect(),
                width: self.size,
                height: self.size,
            })
        }
    }

    fn small_display() -> DisplayConfig {
        DisplayConfig {
            width: 320,
            height: 180,
            frame_interval_ms: 0,
            edge_width: 10,
            overlay_alpha: 0.5,
        }
    }

    fn build_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        for name in ["good/000.png", "good/001.png", "crack/000.png"] {
            let path = dir.path().join("bottle/test").join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            RgbImage::from_pixel(40, 40, Rgb([90, 90, 90])).save(&path).unwrap();
        }
        dir
    }

    #[test]
    fn test_prompt_category_by_number() {
        let mut input = Cursor::new("8\n");
        let mut output = Vec::new();
        let category = prompt_category(&mut input, &mut output).unwrap();

        assert_eq!(category, Category::MetalNut);
        let shown = String::from_utf8(output).unwrap();
        assert!(shown.contains("1. bottle"));
        assert!(shown.contains("15. zipper"));
    }

    #[test]
    fn test_prompt_category_rejects_invalid() {
        for choice in ["0\n", "16\n", "bottle\n", "\n"] {
            let mut input = Cursor::new(choice);
            let err = prompt_category(&mut input, &mut Vec::new()).unwrap_err();
            assert!(matches!(err, AnomalyError::UnknownCategories(_)));
        }
    }

    #[test]
    fn test_prediction_lines() {
        let info = FrameInfo {
            gt_label: Label::Normal,
            pred_label: Label::Abnormal,
            pred_score: 0.71234,
            latency: Duration::from_micros(12_600),
        };
        assert_eq!(
            info.prediction_lines(),
            [
                "Pred Label: Abnormal".to_string(),
                "Pred Score: 0.712".to_string(),
                "Latency: 13 ms".to_string(),
            ]
        );
    }

    #[test]
    fn test_compose_frame_fills_display() {
        let original = RgbImage::from_pixel(100, 100, Rgb([0, 0, 255]));
        let result = ConstEngine { size: 8, score: 0.9 }
            .infer(&vec![0.0; 3 * 64])
            .unwrap();
        let info = FrameInfo::new(Label::Abnormal, &result, Duration::from_millis(5));

        let frame = compose_frame(&original, &result, &info, &small_display());
        assert_eq!(frame.dimensions(), (320, 180));
        // 210x100 content scaled to 320x152, white bars above and below
        assert_eq!(*frame.get_pixel(160, 0), WHITE);
        assert_eq!(*frame.get_pixel(160, 179), WHITE);
    }

    #[test]
    fn test_headless_run_stops_after_frames() {
        let tree = build_tree();
        let out = TempDir::new().unwrap();
        let dataset = MvtecDataset::open(tree.path(), Category::Bottle, Split::Test).unwrap();

        let engine = ConstEngine { size: 16, score: 0.2 };
        let mut runner = DemoRunner::new(engine, 16, dataset, small_display(), ChaCha8Rng::seed_from_u64(7));
        let mut sink = HeadlessSink::new(out.path().join("demo"), 3).unwrap();

        assert_eq!(runner.run(&mut sink).unwrap(), 3);
        assert_eq!(sink.written(), 3);
        assert!(out.path().join("demo/frame_0002.png").is_file());
        assert!(!out.path().join("demo/frame_0003.png").exists());
    }
}
