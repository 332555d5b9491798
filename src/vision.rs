use crate::config::EmbedderConfig;
use crate::error::{PawsightError, Result};
use crate::model_manager;
use crate::onnx::OnnxSession;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array1, Array2, Array4, ArrayView, Axis, IxDyn};
use ort::value::Value;
use rayon::prelude::*;
use std::path::Path;
use tracing::info;

/// CLIP-style image tower producing unit-length embeddings.
pub struct ImageEmbedder {
    pub session: OnnxSession,
    pub config: EmbedderConfig,
    pub input_name: String,
}

impl ImageEmbedder {
    /// Load `visual.onnx` and `model_config.json` from `model_dir`.
    pub fn new(model_dir: &Path, threads: usize) -> Result<Self> {
        model_manager::verify_model_dir(model_dir, model_manager::EMBEDDER_FILES)?;
        let session = OnnxSession::with_threads(model_dir.join("visual.onnx"), threads)?;
        let config = EmbedderConfig::from_file(model_dir.join("model_config.json"))?;

        let input_name = session
            .find_input(&["pixel_values", "input", "image"])
            .unwrap_or_else(|| session.first_input_or("pixel_values"));
        info!(dir = %model_dir.display(), dim = config.embed_dim, "image embedder loaded");

        Ok(Self {
            session,
            config,
            input_name,
        })
    }

    #[must_use]
    pub const fn dim(&self) -> usize {
        self.config.embed_dim
    }

    /// Embed a single image
    pub fn embed_image(&mut self, image: &DynamicImage) -> Result<Array1<f32>> {
        let embs = self.embed_images(std::slice::from_ref(image))?;
        let len = embs.len();
        Ok(embs.into_shape_with_order(len)?)
    }

    /// Embed a batch of images; every row is L2-normalized.
    pub fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Array2<f32>> {
        let batch_tensor = preprocess_batch(&self.config, images)?;

        let input_tensor = Value::from_array(batch_tensor)?;
        let outputs = self
            .session
            .session
            .run(ort::inputs![self.input_name.as_str() => input_tensor])?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let shape_usize: Vec<usize> = shape.iter().map(|&x| x as usize).collect();
        let view = ArrayView::from_shape(IxDyn(&shape_usize), data)?;

        let mut embs = view
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|e| PawsightError::Inference(e.to_string()))?
            .to_owned();
        l2_normalize_rows(&mut embs);
        Ok(embs)
    }
}

/// Normalize every row to unit length; zero rows are left untouched.
pub fn l2_normalize_rows(embs: &mut Array2<f32>) {
    for mut row in embs.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > f32::EPSILON {
            row.mapv_inplace(|v| v / norm);
        }
    }
}

/// Preprocess a batch of images into a `[n, 3, size, size]` tensor.
pub fn preprocess_batch(config: &EmbedderConfig, images: &[DynamicImage]) -> Result<Array4<f32>> {
    if images.is_empty() {
        return Err(PawsightError::Inference("Empty batch".to_string()));
    }

    let size = config.image_size as usize;
    let mut batch_tensor = Array4::<f32>::zeros((images.len(), 3, size, size));
    batch_tensor
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(images.par_iter())
        .try_for_each(|(mut slot, img)| preprocess_into(config, img, &mut slot))?;

    Ok(batch_tensor)
}

fn preprocess_into(
    config: &EmbedderConfig,
    image: &DynamicImage,
    out_view: &mut ndarray::ArrayViewMut3<f32>,
) -> Result<()> {
    let size = config.image_size;
    let interp = match config.interpolation.as_str() {
        "bicubic" => FilterType::CatmullRom,
        "bilinear" => FilterType::Triangle,
        _ => FilterType::Nearest,
    };

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let resized = if config.resize_mode == "squash" {
        image.resize_exact(size, size, interp)
    } else {
        let (width, height) = image.dimensions();
        let scale = size as f32 / width.min(height) as f32;
        let scaled_width = ((width as f32 * scale).round() as u32).max(size);
        let scaled_height = ((height as f32 * scale).round() as u32).max(size);
        let resized = image.resize_exact(scaled_width, scaled_height, interp);
        let x = (scaled_width - size) / 2;
        let y = (scaled_height - size) / 2;
        resized.crop_imm(x, y, size, size)
    };

    let rgb = resized.to_rgb8();
    let pixels = rgb.as_raw();
    let channel_len = (size as usize).pow(2);
    for c in 0..3 {
        let channel_slice = out_view.index_axis_mut(Axis(0), c);
        let flat_channel = channel_slice
            .into_slice()
            .ok_or_else(|| PawsightError::Inference("Layout mismatch".into()))?;
        for (i, out) in flat_channel.iter_mut().enumerate().take(channel_len) {
            let val = f32::from(pixels[i * 3 + c]) / 255.0;
            *out = (val - config.mean[c]) / config.std[c];
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn rows_become_unit_length() {
        let mut embs = array![[3.0_f32, 4.0], [0.0, 0.0]];
        l2_normalize_rows(&mut embs);
        assert_abs_diff_eq!(embs[[0, 0]], 0.6, epsilon = 1e-6);
        assert_abs_diff_eq!(embs[[0, 1]], 0.8, epsilon = 1e-6);
        assert_abs_diff_eq!(embs[[1, 0]], 0.0);
    }

    #[test]
    fn preprocess_normalizes_with_config() {
        let config = EmbedderConfig {
            image_size: 8,
            mean: [0.5; 3],
            std: [0.5; 3],
            ..EmbedderConfig::default()
        };
        let white = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            20,
            10,
            image::Rgb([255, 255, 255]),
        ));
        let tensor = preprocess_batch(&config, &[white.clone(), white]).unwrap();
        assert_eq!(tensor.shape(), &[2, 3, 8, 8]);
        assert!(tensor.iter().all(|&v| (v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(preprocess_batch(&EmbedderConfig::default(), &[]).is_err());
    }
}
