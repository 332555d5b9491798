//! Canny edge maps used as the ControlNet structural hint.

use image::{DynamicImage, GrayImage, Luma, RgbImage};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

/// BT.601 luma, the weighting most vision pipelines use for RGB → gray.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn to_gray(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut gray = GrayImage::new(width, height);
    for (src, dst) in image.pixels().zip(gray.pixels_mut()) {
        let [r, g, b] = src.0;
        let y = 0.114_f32.mul_add(
            f32::from(b),
            0.299_f32.mul_add(f32::from(r), 0.587 * f32::from(g)),
        );
        *dst = Luma([y.round().clamp(0.0, 255.0) as u8]);
    }
    gray
}

/// Canny edges with L1 gradient magnitude and hysteresis between `low` and `high`.
///
/// Gradients come from imageproc's 3x3 Sobel (edge pixels replicated) without
/// a blur pass, so the thresholds behave like OpenCV's on an unblurred image.
/// Thresholds are swapped if given in the wrong order. Output pixels are 0 or 255.
#[must_use]
#[allow(
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::similar_names
)]
pub fn canny(gray: &GrayImage, low: f32, high: f32) -> GrayImage {
    let (low, high) = if low > high { (high, low) } else { (low, high) };
    let (width, height) = gray.dimensions();
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 {
        return GrayImage::new(width, height);
    }

    let sobel_x = horizontal_sobel(gray);
    let sobel_y = vertical_sobel(gray);
    let grads: Vec<(f32, f32)> = sobel_x
        .as_raw()
        .iter()
        .zip(sobel_y.as_raw())
        .map(|(&gx, &gy)| (f32::from(gx), f32::from(gy)))
        .collect();
    let magnitude: Vec<f32> = grads.iter().map(|(gx, gy)| gx.abs() + gy.abs()).collect();

    // Non-maximum suppression along the quantized gradient direction.
    let mag_at = |x: isize, y: isize| -> f32 {
        if x < 0 || y < 0 || x >= w as isize || y >= h as isize {
            0.0
        } else {
            magnitude[y as usize * w + x as usize]
        }
    };
    let tan_22_5 = 0.414_213_57_f32;
    let mut state = vec![0_u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let m = magnitude[i];
            if m <= low {
                continue;
            }
            let (gx, gy) = grads[i];
            let (ax, ay) = (gx.abs(), gy.abs());
            let (xi, yi) = (x as isize, y as isize);
            let (n1, n2) = if ay <= ax * tan_22_5 {
                (mag_at(xi - 1, yi), mag_at(xi + 1, yi))
            } else if ay > ax / tan_22_5 {
                (mag_at(xi, yi - 1), mag_at(xi, yi + 1))
            } else if (gx > 0.0) == (gy > 0.0) {
                (mag_at(xi - 1, yi - 1), mag_at(xi + 1, yi + 1))
            } else {
                (mag_at(xi + 1, yi - 1), mag_at(xi - 1, yi + 1))
            };
            if m > n1 && m >= n2 {
                state[i] = if m > high { 2 } else { 1 };
            }
        }
    }

    // Hysteresis: grow strong edges through connected weak ones.
    let mut out = vec![0_u8; w * h];
    let mut stack: Vec<usize> = state
        .iter()
        .enumerate()
        .filter(|&(_, &s)| s == 2)
        .map(|(i, _)| i)
        .collect();
    let mut visited = vec![false; w * h];
    while let Some(i) = stack.pop() {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        let (x, y) = (i % w, i / w);
        out[i] = 255;
        for dy in -1_isize..=1 {
            for dx in -1_isize..=1 {
                let nx = x as isize + dx;
                let ny = y as isize + dy;
                if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                    continue;
                }
                let j = ny as usize * w + nx as usize;
                if !visited[j] && state[j] > 0 {
                    stack.push(j);
                }
            }
        }
    }
    GrayImage::from_raw(width, height, out).unwrap_or_else(|| GrayImage::new(width, height))
}

/// Edge map of an RGB image as a three-channel image, ready for conditioning.
#[must_use]
pub fn edge_map(image: &RgbImage, low: f32, high: f32) -> RgbImage {
    let edges = canny(&to_gray(image), low, high);
    DynamicImage::ImageLuma8(edges).to_rgb8()
}
