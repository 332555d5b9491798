use crate::detector::BoundingBox;
use image::{imageops::FilterType, DynamicImage, GenericImageView, Rgb, RgbImage};

/// Crop to `bbox` grown by `pad` pixels on every side, clamped to the image.
///
/// Without a box, or when the clamped box is empty, the whole image is returned.
#[must_use]
pub fn crop_with_padding(image: &DynamicImage, bbox: Option<&BoundingBox>, pad: u32) -> DynamicImage {
    let Some(bbox) = bbox else {
        return image.clone();
    };
    let [x1, y1, x2, y2] = bbox.pixels();
    padded_region(image, [x1, y1, x2, y2], i64::from(pad)).map_or_else(
        || image.clone(),
        |(x, y, w, h)| image.crop_imm(x, y, w, h),
    )
}

/// Crop to `bbox` grown by `max(width, height) * pad_ratio`; `None` when empty.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn crop_with_ratio(image: &DynamicImage, bbox: &BoundingBox, pad_ratio: f32) -> Option<DynamicImage> {
    let (width, height) = image.dimensions();
    let pad = (width.max(height) as f32 * pad_ratio) as i64;
    padded_region(image, bbox.pixels(), pad).map(|(x, y, w, h)| image.crop_imm(x, y, w, h))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn padded_region(image: &DynamicImage, [x1, y1, x2, y2]: [i32; 4], pad: i64) -> Option<(u32, u32, u32, u32)> {
    let (width, height) = image.dimensions();
    let x1 = (i64::from(x1) - pad).max(0);
    let y1 = (i64::from(y1) - pad).max(0);
    let x2 = (i64::from(x2) + pad).min(i64::from(width));
    let y2 = (i64::from(y2) + pad).min(i64::from(height));
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
}

/// Scale the longest side to `size` and center on a white `size × size` canvas.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn fit_to_square(image: &DynamicImage, size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let (new_w, new_h) = if width > height {
        (size, (height as f32 * (size as f32 / width as f32)) as u32)
    } else {
        ((width as f32 * (size as f32 / height as f32)) as u32, size)
    };
    let resized = image
        .resize_exact(new_w.max(1), new_h.max(1), FilterType::Lanczos3)
        .to_rgb8();

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([255, 255, 255]));
    let offset_x = (size - resized.width()) / 2;
    let offset_y = (size - resized.height()) / 2;
    image::imageops::overlay(&mut canvas, &resized, i64::from(offset_x), i64::from(offset_y));
    canvas
}
