//! Bitmap text rendering with the 8x8 public-domain font

use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{Rgb, RgbImage};

/// Glyph cell size in pixels before scaling
pub const GLYPH_SIZE: u32 = 8;

/// Height in pixels of one line at `scale`
pub fn line_height(scale: u32) -> u32 {
    GLYPH_SIZE * scale
}

/// Draw `text` with its top-left corner at `(x, y)`.
///
/// Characters outside basic Latin render as blanks; pixels outside the image
/// are clipped.
pub fn draw_text(img: &mut RgbImage, text: &str, x: u32, y: u32, scale: u32, color: Rgb<u8>) {
    let scale = scale.max(1);
    let (width, height) = img.dimensions();

    for (i, ch) in text.chars().enumerate() {
        let Some(glyph) = BASIC_FONTS.get(ch) else {
            continue;
        };
        let origin_x = x + i as u32 * GLYPH_SIZE * scale;

        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_SIZE {
                if bits & (1 << col) == 0 {
                    continue;
                }
                let px = origin_x + col * scale;
                let py = y + row as u32 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        let (tx, ty) = (px + dx, py + dy);
                        if tx < width && ty < height {
                            img.put_pixel(tx, ty, color);
                        }
                    }
                }
            }
        }
    }
}

/// Draw lines of text stacked downwards with `spacing` pixels between them
pub fn draw_lines<S: AsRef<str>>(
    img: &mut RgbImage,
    lines: &[S],
    x: u32,
    y: u32,
    scale: u32,
    spacing: u32,
    color: Rgb<u8>,
) {
    let step = line_height(scale.max(1)) + spacing;
    for (i, line) in lines.iter().enumerate() {
        draw_text(img, line.as_ref(), x, y + i as u32 * step, scale, color);
    }
}
