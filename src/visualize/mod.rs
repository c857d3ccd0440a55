//! Visualization of predictions
//!
//! Image helpers used by the benchmark's result writer and the demo:
//! letterboxing, horizontal stacking, the jet colormap for anomaly maps, mask
//! fills and contours, and the output naming scheme.

pub mod text;

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};

use crate::inference::InferenceResult;
use crate::utils::error::{AnomalyError, Result};

pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
pub const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);

/// Opacity of mask contours in result overlays
pub const CONTOUR_ALPHA: f32 = 0.7;

/// Where letterbox padding goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Split evenly, the extra pixel going to the bottom/right
    Centered,
    /// All padding on the bottom/right
    BottomRight,
}

/// Size of the content after fitting `(width, height)` into the target
/// while keeping the aspect ratio
pub fn fit_within(width: u32, height: u32, target_w: u32, target_h: u32) -> (u32, u32) {
    let (w, h) = (width as u64, height as u64);
    let (tw, th) = (target_w as u64, target_h as u64);
    if w * th > h * tw {
        (target_w, ((h * tw / w) as u32).max(1))
    } else {
        (((w * th / h) as u32).max(1), target_h)
    }
}

/// Resize keeping the aspect ratio, then pad with `color` to exactly
/// `target_w` x `target_h`
pub fn resize_with_padding(
    img: &RgbImage,
    target_w: u32,
    target_h: u32,
    color: Rgb<u8>,
    padding: Padding,
) -> RgbImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || target_w == 0 || target_h == 0 {
        return RgbImage::from_pixel(target_w, target_h, color);
    }

    let (new_w, new_h) = fit_within(w, h, target_w, target_h);
    let resized = if (new_w, new_h) == (w, h) {
        img.clone()
    } else {
        imageops::resize(img, new_w, new_h, FilterType::Triangle)
    };

    let pad_w = target_w - new_w;
    let pad_h = target_h - new_h;
    let (left, top) = match padding {
        Padding::Centered => (pad_w / 2, pad_h / 2),
        Padding::BottomRight => (0, 0),
    };

    let mut out = RgbImage::from_pixel(target_w, target_h, color);
    imageops::replace(&mut out, &resized, left as i64, top as i64);
    out
}

/// Place images side by side, separated by `gap` pixels of `gap_color`
pub fn hstack(images: &[&RgbImage], gap: u32, gap_color: Rgb<u8>) -> RgbImage {
    let height = images.iter().map(|i| i.height()).max().unwrap_or(0);
    let width = images.iter().map(|i| i.width()).sum::<u32>()
        + gap * images.len().saturating_sub(1) as u32;

    let mut out = RgbImage::from_pixel(width, height, gap_color);
    let mut x = 0i64;
    for img in images {
        imageops::replace(&mut out, *img, x, 0);
        x += (img.width() + gap) as i64;
    }
    out
}

/// Jet colormap: blue at 0, green at 0.5, red at 1
pub fn jet(value: f32) -> Rgb<u8> {
    let v = value.clamp(0.0, 1.0);
    let channel = |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Rescale values to [0, 1]; a constant map becomes all zeros
pub fn min_max_normalize(values: &[f32]) -> Vec<f32> {
    let (lo, hi) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = hi - lo;
    if !range.is_finite() || range <= f32::EPSILON {
        return vec![0.0; values.len()];
    }
    values.iter().map(|&v| (v - lo) / range).collect()
}

/// Colormapped, min-max normalized anomaly map
pub fn heatmap(map: &[f32], width: u32, height: u32) -> RgbImage {
    let normalized = min_max_normalize(map);
    RgbImage::from_fn(width, height, |x, y| {
        jet(normalized[(y * width + x) as usize])
    })
}

fn blend(base: Rgb<u8>, color: Rgb<u8>, alpha: f32) -> Rgb<u8> {
    let mix = |b: u8, c: u8| (b as f32 * (1.0 - alpha) + c as f32 * alpha).round() as u8;
    Rgb([mix(base[0], color[0]), mix(base[1], color[1]), mix(base[2], color[2])])
}

/// Blend `color` over every masked pixel
pub fn fill_overlay(img: &RgbImage, mask: &[bool], color: Rgb<u8>, alpha: f32) -> RgbImage {
    let width = img.width();
    let mut out = img.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if mask.get((y * width + x) as usize).copied().unwrap_or(false) {
            *pixel = blend(*pixel, color, alpha);
        }
    }
    out
}

/// Masked pixels with at least one unmasked 4-neighbour (or the border)
pub fn contour(mask: &[bool], width: u32, height: u32) -> Vec<bool> {
    let (w, h) = (width as i64, height as i64);
    let at = |x: i64, y: i64| x >= 0 && y >= 0 && x < w && y < h && mask[(y * w + x) as usize];

    (0..h)
        .flat_map(|y| (0..w).map(move |x| (x, y)))
        .map(|(x, y)| at(x, y) && !(at(x - 1, y) && at(x + 1, y) && at(x, y - 1) && at(x, y + 1)))
        .collect()
}

/// Blend the outline of `mask` over the image in place
pub fn draw_contour(img: &mut RgbImage, mask: &[bool], color: Rgb<u8>, alpha: f32) {
    let (width, height) = img.dimensions();
    if mask.len() != (width * height) as usize {
        return;
    }
    for (i, on) in contour(mask, width, height).into_iter().enumerate() {
        if on {
            let (x, y) = (i as u32 % width, i as u32 / width);
            let pixel = img.get_pixel_mut(x, y);
            *pixel = blend(*pixel, color, alpha);
        }
    }
}

/// Flatten a binary image into a row-major mask
pub fn mask_from_gray(mask: &GrayImage) -> Vec<bool> {
    mask.pixels().map(|p| p[0] > 0).collect()
}

/// `<image> | <colormapped anomaly map>`
pub fn anomaly_map_panel(image: &RgbImage, result: &InferenceResult) -> RgbImage {
    let map = heatmap(&result.anomaly_map, result.width as u32, result.height as u32);
    let map = fit_to(&map, image.width(), image.height());
    hstack(&[image, &map], 0, WHITE)
}

/// Image with the ground-truth contour in green and the predicted one in red
pub fn overlay_panel(image: &RgbImage, gt_mask: &[bool], result: &InferenceResult) -> RgbImage {
    let mut out = image.clone();
    draw_contour(&mut out, gt_mask, GREEN, CONTOUR_ALPHA);

    let pred = resize_mask(&result.pred_mask, result.width as u32, result.height as u32, image.width(), image.height());
    draw_contour(&mut out, &pred, RED, CONTOUR_ALPHA);
    out
}

fn fit_to(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    if img.dimensions() == (width, height) {
        img.clone()
    } else {
        imageops::resize(img, width, height, FilterType::Triangle)
    }
}

/// Nearest-neighbour resampling of a row-major mask
pub fn resize_mask(mask: &[bool], width: u32, height: u32, new_w: u32, new_h: u32) -> Vec<bool> {
    if (width, height) == (new_w, new_h) {
        return mask.to_vec();
    }
    (0..new_h)
        .flat_map(|y| (0..new_w).map(move |x| (x, y)))
        .map(|(x, y)| {
            let sx = (x as u64 * width as u64 / new_w.max(1) as u64) as u32;
            let sy = (y as u64 * height as u64 / new_h.max(1) as u64) as u32;
            mask.get((sy * width + sx) as usize).copied().unwrap_or(false)
        })
        .collect()
}

/// Output name: the last four path components joined by `_`
pub fn result_file_name(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .filter(|c| !c.is_empty() && c != "/")
        .collect();
    parts[parts.len().saturating_sub(4)..].join("_")
}

/// Save an RGB image, creating parent directories
pub fn save_rgb(img: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    img.save(path)
        .map_err(|e| AnomalyError::Image(format!("Failed to write {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Label;
    use std::path::PathBuf;

    #[test]
    fn test_resize_with_padding_square_into_wide() {
        let img = RgbImage::from_pixel(256, 256, BLACK);
        let out = resize_with_padding(&img, 1920, 1080, WHITE, Padding::Centered);

        assert_eq!(out.dimensions(), (1920, 1080));
        // height limits: 1080 x 1080 content, 420 px on each side
        assert_eq!(*out.get_pixel(419, 540), WHITE);
        assert_eq!(*out.get_pixel(420, 540), BLACK);
        assert_eq!(*out.get_pixel(1499, 540), BLACK);
        assert_eq!(*out.get_pixel(1500, 540), WHITE);
    }

    #[test]
    fn test_resize_with_padding_wide_into_square() {
        let img = RgbImage::from_pixel(200, 100, BLACK);
        assert_eq!(fit_within(200, 100, 50, 50), (50, 25));

        let out = resize_with_padding(&img, 50, 50, WHITE, Padding::Centered);
        assert_eq!(out.dimensions(), (50, 50));
        assert_eq!(*out.get_pixel(25, 11), WHITE);
        assert_eq!(*out.get_pixel(25, 12), BLACK);
        assert_eq!(*out.get_pixel(25, 36), BLACK);
        assert_eq!(*out.get_pixel(25, 37), WHITE);
    }

    #[test]
    fn test_resize_with_padding_one_sided() {
        let img = RgbImage::from_pixel(100, 100, BLACK);
        let out = resize_with_padding(&img, 60, 30, WHITE, Padding::BottomRight);
        assert_eq!(out.dimensions(), (60, 30));
        assert_eq!(*out.get_pixel(0, 0), BLACK);
        assert_eq!(*out.get_pixel(29, 29), BLACK);
        assert_eq!(*out.get_pixel(30, 0), WHITE);
    }

    #[test]
    fn test_resize_with_padding_empty_target() {
        let img = RgbImage::from_pixel(256, 256, BLACK);
        let out = resize_with_padding(&img, 0, 0, WHITE, Padding::Centered);
        assert_eq!(out.dimensions(), (0, 0));
        let out = resize_with_padding(&img, 0, 40, WHITE, Padding::BottomRight);
        assert_eq!(out.dimensions(), (0, 40));
    }

    #[test]
    fn test_fit_within_aspect() {
        assert_eq!(fit_within(256, 256, 1920, 1080), (1080, 1080));
        assert_eq!(fit_within(1000, 300, 500, 500), (500, 150));
        assert_eq!(fit_within(300, 1000, 500, 500), (150, 500));
    }

    #[test]
    fn test_hstack_with_gap() {
        let a = RgbImage::from_pixel(3, 2, RED);
        let b = RgbImage::from_pixel(2, 4, GREEN);
        let out = hstack(&[&a, &b], 1, BLACK);

        assert_eq!(out.dimensions(), (6, 4));
        assert_eq!(*out.get_pixel(0, 0), RED);
        assert_eq!(*out.get_pixel(3, 0), BLACK);
        assert_eq!(*out.get_pixel(4, 3), GREEN);
        assert_eq!(*out.get_pixel(0, 3), BLACK);
    }

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(jet(0.0), Rgb([0, 0, 128]));
        assert_eq!(jet(0.5), Rgb([128, 255, 128]));
        assert_eq!(jet(1.0), Rgb([128, 0, 0]));
    }

    #[test]
    fn test_min_max_normalize() {
        assert_eq!(min_max_normalize(&[2.0, 4.0, 3.0]), vec![0.0, 1.0, 0.5]);
        assert_eq!(min_max_normalize(&[1.0, 1.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_contour_of_square() {
        // 4x4 mask with a filled 3x3 block in the top-left
        let mut mask = vec![false; 16];
        for y in 0..3 {
            for x in 0..3 {
                mask[y * 4 + x] = true;
            }
        }
        let edge = contour(&mask, 4, 4);
        assert!(!edge[5]); // interior pixel (1, 1)
        assert!(edge[0]);
        assert!(edge[2]);
        assert!(!edge[3]);
        assert_eq!(edge.iter().filter(|&&e| e).count(), 8);
    }

    #[test]
    fn test_fill_overlay_blends_masked_only() {
        let img = RgbImage::from_pixel(2, 1, BLACK);
        let out = fill_overlay(&img, &[true, false], RED, 0.5);
        assert_eq!(*out.get_pixel(0, 0), Rgb([128, 0, 0]));
        assert_eq!(*out.get_pixel(1, 0), BLACK);
    }

    #[test]
    fn test_result_file_name() {
        let path = PathBuf::from("./datasets/MVTecAD/bottle/test/broken_large/000.png");
        assert_eq!(result_file_name(&path), "bottle_test_broken_large_000.png");
        assert_eq!(result_file_name(Path::new("a/b.png")), "a_b.png");
    }

    #[test]
    fn test_panels_match_image_size() {
        let image = RgbImage::from_pixel(8, 8, WHITE);
        let result = InferenceResult {
            pred_score: 0.9,
            pred_label: Label::Abnormal,
            anomaly_map: (0..16).map(|v| v as f32).collect(),
            pred_mask: (0..16).map(|v| v >= 8).collect(),
            width: 4,
            height: 4,
        };

        let panel = anomaly_map_panel(&image, &result);
        assert_eq!(panel.dimensions(), (16, 8));

        let overlay = overlay_panel(&image, &vec![false; 64], &result);
        assert_eq!(overlay.dimensions(), (8, 8));
        assert_ne!(*overlay.get_pixel(0, 7), WHITE);
        assert_eq!(*overlay.get_pixel(0, 0), WHITE);
    }
}
