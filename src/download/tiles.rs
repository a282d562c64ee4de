//! Last-resort page assembly from IIIF image tiles.
//!
//! Some image servers refuse every full-size request yet still serve the
//! tiles advertised in `info.json`. A page can then be rebuilt by fetching
//! each full-resolution tile region and pasting it onto one canvas.

use std::io::Cursor;

use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage, imageops};
use serde_json::Value;

/// JPEG quality of a stitched page.
pub const STITCH_JPEG_QUALITY: u8 = 90;

/// Upper bound on the uncompressed RGB canvas assembled in memory.
pub const MAX_STITCH_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Attempts per tile before the whole stitch is abandoned.
pub const TILE_ATTEMPTS: u32 = 3;

/// One tile region at full resolution: `(x, y, width, height)`.
pub type Region = (u32, u32, u32, u32);

/// Full image size and tile size read from `info.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl TilePlan {
    /// Builds a plan from the first entry of `tiles`; a missing tile
    /// height means square tiles.
    #[must_use]
    pub fn from_info(info: &Value) -> Option<Self> {
        let width = positive(info.get("width")?)?;
        let height = positive(info.get("height")?)?;
        let tiles = info.get("tiles")?;
        let spec = match tiles {
            Value::Array(items) => items.first()?,
            Value::Object(_) => tiles,
            _ => return None,
        };
        let tile_width = positive(spec.get("width")?)?;
        let tile_height = spec.get("height").and_then(positive).unwrap_or(tile_width);
        Some(Self {
            width,
            height,
            tile_width,
            tile_height,
        })
    }

    /// Tile regions row by row; edge tiles are clipped to the image.
    #[must_use]
    pub fn regions(&self) -> Vec<Region> {
        let mut regions = Vec::new();
        let mut y = 0;
        while y < self.height {
            let h = self.tile_height.min(self.height - y);
            let mut x = 0;
            while x < self.width {
                let w = self.tile_width.min(self.width - x);
                regions.push((x, y, w, h));
                x += w;
            }
            y += h;
        }
        regions
    }

    #[must_use]
    pub fn canvas_bytes(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * 3
    }
}

fn positive(value: &Value) -> Option<u32> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
}

/// Image API URL of one full-resolution tile.
#[must_use]
pub fn tile_url(service_base: &str, (x, y, w, h): Region, quality: &str) -> String {
    format!(
        "{}/{x},{y},{w},{h}/{w},/0/{quality}.jpg",
        service_base.trim_end_matches('/')
    )
}

/// Pastes the tiles onto a white canvas and encodes it as JPEG.
///
/// Tiles that come back at an unexpected size are resized to their region.
/// Blocking; run inside `spawn_blocking` from async code.
///
/// # Errors
///
/// Returns a description of the first tile that cannot be decoded, or of
/// the encoding failure.
pub fn compose(plan: &TilePlan, tiles: Vec<(Region, Vec<u8>)>) -> Result<Vec<u8>, String> {
    let mut canvas = RgbImage::from_pixel(plan.width, plan.height, Rgb([255, 255, 255]));
    for ((x, y, w, h), bytes) in tiles {
        let mut tile = image::load_from_memory(&bytes)
            .map_err(|e| format!("tile {x},{y}: {e}"))?
            .to_rgb8();
        if tile.dimensions() != (w, h) {
            tile = imageops::resize(&tile, w, h, imageops::FilterType::Triangle);
        }
        imageops::replace(&mut canvas, &tile, i64::from(x), i64::from(y));
    }

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut out, ImageOutputFormat::Jpeg(STITCH_JPEG_QUALITY))
        .map_err(|e| e.to_string())?;
    Ok(out.into_inner())
}
