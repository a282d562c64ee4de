//! Structural validation of page images.
//!
//! A page counts as present only if its bytes are a non-empty image whose
//! header decodes to real dimensions. JPEGs must additionally carry an
//! end-of-image marker near the tail, which catches the common truncated
//! write left by an interrupted run.

use std::io::Cursor;
use std::path::Path;

use image::ImageFormat;
use image::io::Reader as ImageReader;

/// How far from the end of a JPEG the EOI marker may sit (trailing padding).
const JPEG_TAIL_WINDOW: usize = 1024;

/// Checks page bytes and returns `(width, height)`.
///
/// # Errors
///
/// Returns a short reason when the bytes are empty, not an image, or a
/// truncated JPEG.
pub fn inspect_image_bytes(bytes: &[u8]) -> Result<(u32, u32), String> {
    if bytes.is_empty() {
        return Err("empty image".to_string());
    }

    let format = image::guess_format(bytes).map_err(|e| e.to_string())?;
    if format == ImageFormat::Jpeg && !has_jpeg_eoi(bytes) {
        return Err("truncated JPEG (no end-of-image marker)".to_string());
    }

    let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(|e| e.to_string())?;
    if width == 0 || height == 0 {
        return Err("image has zero dimensions".to_string());
    }
    Ok((width, height))
}

/// Returns the dimensions of a valid page file, `None` for anything else.
///
/// Blocking; call from `spawn_blocking` in async code.
#[must_use]
pub fn inspect_image_file(path: &Path) -> Option<(u32, u32)> {
    let bytes = std::fs::read(path).ok()?;
    inspect_image_bytes(&bytes).ok()
}

fn has_jpeg_eoi(bytes: &[u8]) -> bool {
    let start = bytes.len().saturating_sub(JPEG_TAIL_WINDOW);
    bytes[start..].windows(2).any(|w| w == [0xFF, 0xD9])
}
