//! Image inputs (local files or `http(s)` URLs) and box annotation.

use crate::detector::BoundingBox;
use crate::error::{PawsightError, Result};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[must_use]
pub fn is_url(source: &str) -> bool {
    let lower = source.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Open `source` as a URL when it looks like one, otherwise as a path.
pub fn load_image(source: &str) -> Result<DynamicImage> {
    if is_url(source) {
        fetch_image(source.trim())
    } else {
        let path = Path::new(source);
        if !path.is_file() {
            return Err(PawsightError::NotFound(path.to_owned()));
        }
        Ok(image::open(path)?)
    }
}

pub fn fetch_image(url: &str) -> Result<DynamicImage> {
    let client = reqwest::blocking::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| PawsightError::Download(e.to_string()))?;
    let response = client
        .get(url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(|e| PawsightError::Download(format!("{url}: {e}")))?;
    let bytes = response
        .bytes()
        .map_err(|e| PawsightError::Download(format!("{url}: {e}")))?;
    debug!(url, bytes = bytes.len(), "image fetched");
    Ok(image::load_from_memory(&bytes)?)
}

/// Copy of `image` with `bbox` outlined in red, `thickness` pixels wide.
#[must_use]
#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub fn annotate(image: &DynamicImage, bbox: &BoundingBox, thickness: u32) -> RgbImage {
    let mut canvas = image.to_rgb8();
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return canvas;
    }
    let [x1, y1, x2, y2] = bbox.pixels().map(|v| v.max(0) as u32);
    let (x1, x2) = (x1.min(width - 1), x2.min(width - 1));
    let (y1, y2) = (y1.min(height - 1), y2.min(height - 1));
    let red = Rgb([255, 0, 0]);

    // Nested outlines, one per pixel of thickness, shrinking inwards.
    for t in 0..thickness {
        let (left, top) = (x1.saturating_add(t), y1.saturating_add(t));
        let (right, bottom) = (x2.saturating_sub(t), y2.saturating_sub(t));
        if right < left || bottom < top {
            break;
        }
        let rect = Rect::at(left as i32, top as i32).of_size(right - left + 1, bottom - top + 1);
        draw_hollow_rect_mut(&mut canvas, rect, red);
    }
    canvas
}
