//! Small grayscale helpers shared by the detector and the extractors.

use crate::types::{BoundingBox, Frame};

/// Integer pixel rectangle, already clipped to its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

/// Clip a floating-point box to the frame. `None` if nothing is left.
pub fn clip_to_frame(face: &BoundingBox, frame: &Frame) -> Option<PixelRect> {
    let fw = frame.width as f32;
    let fh = frame.height as f32;

    let x0 = face.x.round().clamp(0.0, fw);
    let y0 = face.y.round().clamp(0.0, fh);
    let x1 = (face.x + face.width).round().clamp(0.0, fw);
    let y1 = (face.y + face.height).round().clamp(0.0, fh);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(PixelRect {
        x: x0 as usize,
        y: y0 as usize,
        width: (x1 - x0) as usize,
        height: (y1 - y0) as usize,
    })
}

/// Copy a rectangle out of a frame, row by row.
pub fn crop(frame: &Frame, rect: PixelRect) -> Vec<u8> {
    let stride = frame.width as usize;
    let mut out = Vec::with_capacity(rect.width * rect.height);
    for row in rect.y..rect.y + rect.height {
        let start = row * stride + rect.x;
        out.extend_from_slice(&frame.data[start..start + rect.width]);
    }
    out
}

/// Mean and population standard deviation of a pixel slice.
pub fn intensity_stats(pixels: &[u8]) -> (f32, f32) {
    if pixels.is_empty() {
        return (0.0, 0.0);
    }
    let n = pixels.len() as f64;
    let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / n;
    let variance = pixels
        .iter()
        .map(|&p| (p as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean as f32, variance.sqrt() as f32)
}

/// Bilinear resize of a grayscale buffer (pixel-center aligned).
pub fn resize_bilinear(
    src: &[u8],
    width: usize,
    height: usize,
    new_w: usize,
    new_h: usize,
) -> Vec<u8> {
    let mut out = vec![0u8; new_w * new_h];
    if width == 0 || height == 0 || new_w == 0 || new_h == 0 {
        return out;
    }

    let sx = width as f32 / new_w as f32;
    let sy = height as f32 / new_h as f32;

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * sy - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * sx - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let top = src[y0 * width + x0] as f32 * (1.0 - fx) + src[y0 * width + x1] as f32 * fx;
            let bot = src[y1 * width + x0] as f32 * (1.0 - fx) + src[y1 * width + x1] as f32 * fx;
            out[y * new_w + x] = (top * (1.0 - fy) + bot * fy).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}
