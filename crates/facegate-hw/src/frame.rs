//! Raw buffer → grayscale conversion, dark-frame detection, mirroring.

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Pixel layouts the camera may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, Y channel taken).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale, high byte kept.
    Y16,
}

/// Convert a raw capture buffer to 8-bit grayscale.
pub fn to_grayscale(
    buf: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    let expected = match format {
        PixelFormat::Grey => pixels,
        PixelFormat::Yuyv | PixelFormat::Y16 => pixels * 2,
    };
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }

    Ok(match format {
        PixelFormat::Grey => buf[..pixels].to_vec(),
        // [Y0, U, Y1, V]: luma is every even byte
        PixelFormat::Yuyv => buf[..expected].iter().step_by(2).copied().collect(),
        PixelFormat::Y16 => buf[..expected].chunks_exact(2).map(|px| px[1]).collect(),
    })
}

/// True if more than `threshold_pct` of pixels are in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    (dark as f32 / gray.len() as f32) > threshold_pct
}

/// Flip a grayscale image left-to-right in place.
pub fn mirror_horizontal(gray: &mut [u8], width: u32) {
    let w = width as usize;
    if w == 0 {
        return;
    }
    for row in gray.chunks_exact_mut(w) {
        row.reverse();
    }
}
