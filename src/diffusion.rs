//! Stable Diffusion + ControlNet over ONNX exports.
//!
//! Expected layout of the model directory:
//!
//! ```text
//! text_encoder/model.onnx   input_ids -> last_hidden_state
//! tokenizer/tokenizer.json
//! controlnet/model.onnx     sample, timestep, encoder_hidden_states, controlnet_cond
//!                           [, conditioning_scale] -> residuals
//! unet/model.onnx           sample, timestep, encoder_hidden_states, residuals -> noise
//! vae_decoder/model.onnx    latent_sample -> sample
//! pipeline_config.json      optional, see `DiffusionConfig`
//! ```
//!
//! ControlNet outputs are routed to the UNet inputs of the same name.

use crate::error::{PawsightError, Result};
use crate::model_manager;
use crate::onnx::OnnxSession;
use crate::prompt::Prompts;
use crate::scheduler::{DdimConfig, DdimScheduler};
use image::{imageops::FilterType, RgbImage};
use ndarray::{concatenate, Array1, Array2, Array4, ArrayD, Axis, Ix4, IxDyn};
use ort::value::{DynValue, Value};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorDtype {
    Int32,
    #[default]
    Int64,
    Float32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub context_length: usize,
    pub input_ids_dtype: TensorDtype,
    pub timestep_dtype: TensorDtype,
    pub latent_channels: usize,
    pub latent_scale: f32,
    pub vae_scale_factor: u32,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            context_length: 77,
            input_ids_dtype: TensorDtype::Int32,
            timestep_dtype: TensorDtype::Int64,
            latent_channels: 4,
            latent_scale: 0.182_15,
            vae_scale_factor: 8,
        }
    }
}

impl DiffusionConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub steps: usize,
    pub guidance_scale: f32,
    pub controlnet_scale: f32,
    pub seed: u64,
    pub samples: usize,
    pub width: u32,
    pub height: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            steps: 20,
            guidance_scale: 7.5,
            controlnet_scale: 0.7,
            seed: 42,
            samples: 1,
            width: 512,
            height: 512,
        }
    }
}

pub struct ControlNetPipeline {
    pub config: DiffusionConfig,
    text_encoder: OnnxSession,
    controlnet: OnnxSession,
    unet: OnnxSession,
    vae_decoder: OnnxSession,
    tokenizer: Tokenizer,
    residual_names: Vec<String>,
    controlnet_takes_scale: bool,
}

impl ControlNetPipeline {
    pub fn new(model_dir: &Path, threads: usize) -> Result<Self> {
        model_manager::verify_model_dir(model_dir, model_manager::DIFFUSION_FILES)?;
        let start = Instant::now();

        let config_path = model_dir.join("pipeline_config.json");
        let config = if config_path.is_file() {
            DiffusionConfig::from_file(config_path)?
        } else {
            DiffusionConfig::default()
        };

        let text_encoder = OnnxSession::with_threads(model_dir.join("text_encoder/model.onnx"), threads)?;
        let controlnet = OnnxSession::with_threads(model_dir.join("controlnet/model.onnx"), threads)?;
        let unet = OnnxSession::with_threads(model_dir.join("unet/model.onnx"), threads)?;
        let vae_decoder = OnnxSession::with_threads(model_dir.join("vae_decoder/model.onnx"), threads)?;

        let mut tokenizer = Tokenizer::from_file(model_dir.join("tokenizer/tokenizer.json"))
            .map_err(|e| PawsightError::Tokenizer(e.to_string()))?;
        let pad_id = tokenizer
            .token_to_id("<|endoftext|>")
            .ok_or_else(|| PawsightError::Config("No <|endoftext|> token in tokenizer".into()))?;
        tokenizer
            .with_padding(Some(PaddingParams {
                strategy: PaddingStrategy::Fixed(config.context_length),
                pad_id,
                pad_token: "<|endoftext|>".to_string(),
                ..Default::default()
            }))
            .with_truncation(Some(TruncationParams {
                max_length: config.context_length,
                ..Default::default()
            }))
            .map_err(|e| PawsightError::Tokenizer(e.to_string()))?;

        let residual_names: Vec<String> = controlnet
            .output_names()
            .into_iter()
            .filter(|name| unet.has_input(name))
            .collect();
        if residual_names.is_empty() {
            return Err(PawsightError::Config(
                "ControlNet outputs do not match any UNet input".into(),
            ));
        }
        let controlnet_takes_scale = controlnet.has_input("conditioning_scale");
        info!(
            dir = %model_dir.display(),
            residuals = residual_names.len(),
            elapsed = ?start.elapsed(),
            "diffusion pipeline loaded"
        );

        Ok(Self {
            config,
            text_encoder,
            controlnet,
            unet,
            vae_decoder,
            tokenizer,
            residual_names,
            controlnet_takes_scale,
        })
    }

    /// Token ids padded/truncated to the context length.
    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| PawsightError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Text encoder hidden states, `[1, context, hidden]`.
    pub fn encode_prompt(&mut self, text: &str) -> Result<ArrayD<f32>> {
        let ids = self.tokenize(text)?;
        let len = ids.len();
        let input = match self.config.input_ids_dtype {
            #[allow(clippy::cast_possible_wrap)]
            TensorDtype::Int32 => Value::from_array(Array2::from_shape_vec(
                (1, len),
                ids.iter().map(|&x| x as i32).collect(),
            )?)?
            .into_dyn(),
            TensorDtype::Int64 => Value::from_array(Array2::from_shape_vec(
                (1, len),
                ids.iter().map(|&x| i64::from(x)).collect(),
            )?)?
            .into_dyn(),
            TensorDtype::Float32 => {
                return Err(PawsightError::Config("input_ids cannot be float32".into()))
            }
        };
        let outputs = self
            .text_encoder
            .session
            .run(ort::inputs!["input_ids" => input])?;
        extract_f32(&outputs[0])
    }

    /// Run the full denoising loop and decode `params.samples` images.
    ///
    /// `progress` receives the completed fraction after every step.
    pub fn generate(
        &mut self,
        prompts: &Prompts,
        control: &RgbImage,
        params: &GenerationParams,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<RgbImage>> {
        let start = Instant::now();
        let do_cfg = params.guidance_scale > 1.0;

        let cond = self.encode_prompt(&prompts.positive)?;
        let text_embeddings = if do_cfg {
            let uncond = self.encode_prompt(&prompts.negative)?;
            concatenate(Axis(0), &[uncond.view(), cond.view()])?
        } else {
            cond
        };
        let batch = text_embeddings.shape()[0];

        let control_tensor = control_to_tensor(control, params.width, params.height, batch);
        let scheduler = DdimScheduler::new(params.steps, DdimConfig::default());
        let latent_shape = [
            1,
            self.config.latent_channels,
            (params.height / self.config.vae_scale_factor) as usize,
            (params.width / self.config.vae_scale_factor) as usize,
        ];

        let mut rng = StdRng::seed_from_u64(params.seed);
        let total_steps = scheduler.timesteps().len() * params.samples.max(1);
        let mut done = 0_usize;
        let mut images = Vec::with_capacity(params.samples.max(1));

        for sample in 0..params.samples.max(1) {
            let mut latents = ArrayD::from_shape_fn(IxDyn(&latent_shape), |_| {
                let n: f32 = StandardNormal.sample(&mut rng);
                n * scheduler.init_noise_sigma
            });

            for &t in scheduler.timesteps() {
                let latent_input = if do_cfg {
                    concatenate(Axis(0), &[latents.view(), latents.view()])?
                } else {
                    latents.clone()
                };
                let noise = self.predict_noise(
                    &latent_input,
                    t,
                    &text_embeddings,
                    &control_tensor,
                    params.controlnet_scale,
                )?;
                let guided = if do_cfg {
                    guide(&noise, params.guidance_scale)?
                } else {
                    noise
                };
                latents = scheduler.step(&guided, t, &latents);

                done += 1;
                #[allow(clippy::cast_precision_loss)]
                let fraction = done as f32 / total_steps as f32;
                progress(fraction);
            }

            debug!(sample, "decoding latents");
            images.push(self.decode(&latents)?);
        }

        info!(
            samples = images.len(),
            steps = params.steps,
            elapsed = ?start.elapsed(),
            "generation finished"
        );
        Ok(images)
    }

    fn predict_noise(
        &mut self,
        latents: &ArrayD<f32>,
        timestep: usize,
        text_embeddings: &ArrayD<f32>,
        control: &ArrayD<f32>,
        controlnet_scale: f32,
    ) -> Result<ArrayD<f32>> {
        let mut control_inputs: Vec<(String, DynValue)> = vec![
            ("sample".to_string(), Value::from_array(latents.clone())?.into_dyn()),
            ("timestep".to_string(), self.timestep_value(timestep)?),
            (
                "encoder_hidden_states".to_string(),
                Value::from_array(text_embeddings.clone())?.into_dyn(),
            ),
            ("controlnet_cond".to_string(), Value::from_array(control.clone())?.into_dyn()),
        ];
        if self.controlnet_takes_scale {
            control_inputs.push((
                "conditioning_scale".to_string(),
                Value::from_array(Array1::from_elem(1, controlnet_scale))?.into_dyn(),
            ));
        }

        let residuals: Vec<(String, ArrayD<f32>)> = {
            let outputs = self.controlnet.session.run(control_inputs)?;
            self.residual_names
                .iter()
                .map(|name| {
                    let mut value = extract_f32(&outputs[name.as_str()])?;
                    if !self.controlnet_takes_scale {
                        value.mapv_inplace(|v| v * controlnet_scale);
                    }
                    Ok((name.clone(), value))
                })
                .collect::<Result<_>>()?
        };

        let mut unet_inputs: Vec<(String, DynValue)> = vec![
            ("sample".to_string(), Value::from_array(latents.clone())?.into_dyn()),
            ("timestep".to_string(), self.timestep_value(timestep)?),
            (
                "encoder_hidden_states".to_string(),
                Value::from_array(text_embeddings.clone())?.into_dyn(),
            ),
        ];
        for (name, value) in residuals {
            unet_inputs.push((name, Value::from_array(value)?.into_dyn()));
        }

        let outputs = self.unet.session.run(unet_inputs)?;
        extract_f32(&outputs[0])
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_precision_loss)]
    fn timestep_value(&self, timestep: usize) -> Result<DynValue> {
        Ok(match self.config.timestep_dtype {
            TensorDtype::Int64 => Value::from_array(Array1::from_elem(1, timestep as i64))?.into_dyn(),
            TensorDtype::Int32 => Value::from_array(Array1::from_elem(1, timestep as i32))?.into_dyn(),
            TensorDtype::Float32 => Value::from_array(Array1::from_elem(1, timestep as f32))?.into_dyn(),
        })
    }

    fn decode(&mut self, latents: &ArrayD<f32>) -> Result<RgbImage> {
        let scaled = latents.mapv(|v| v / self.config.latent_scale);
        let outputs = self
            .vae_decoder
            .session
            .run(ort::inputs!["latent_sample" => Value::from_array(scaled)?])?;
        let decoded = extract_f32(&outputs[0])?;
        tensor_to_image(&decoded)
    }
}

/// `uncond + scale * (cond - uncond)` over a batch of two.
fn guide(noise: &ArrayD<f32>, scale: f32) -> Result<ArrayD<f32>> {
    if noise.shape()[0] != 2 {
        return Err(PawsightError::Inference(format!(
            "Expected a guidance batch of 2, got {:?}",
            noise.shape()
        )));
    }
    let uncond = noise.index_axis(Axis(0), 0);
    let cond = noise.index_axis(Axis(0), 1);
    let guided = &uncond + &((&cond - &uncond) * scale);
    Ok(guided.insert_axis(Axis(0)))
}

/// Resize the control image and lay it out as `[batch, 3, h, w]` in `[0, 1]`.
fn control_to_tensor(control: &RgbImage, width: u32, height: u32, batch: usize) -> ArrayD<f32> {
    let resized = if control.dimensions() == (width, height) {
        control.clone()
    } else {
        image::imageops::resize(control, width, height, FilterType::Triangle)
    };
    let mut tensor = Array4::<f32>::zeros((batch, 3, height as usize, width as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for b in 0..batch {
            for c in 0..3 {
                tensor[[b, c, y as usize, x as usize]] = f32::from(pixel[c]) / 255.0;
            }
        }
    }
    tensor.into_dyn()
}

/// Decoder output `[1, 3, h, w]` in `[-1, 1]` to an RGB image.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn tensor_to_image(decoded: &ArrayD<f32>) -> Result<RgbImage> {
    let view = decoded
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| PawsightError::Inference(e.to_string()))?;
    let (_, channels, height, width) = view.dim();
    if channels != 3 {
        return Err(PawsightError::Inference(format!(
            "Decoder produced {channels} channels"
        )));
    }
    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let px = |c: usize| {
            let v = (view[[0, c, y as usize, x as usize]] / 2.0 + 0.5).clamp(0.0, 1.0);
            (v * 255.0).round() as u8
        };
        image::Rgb([px(0), px(1), px(2)])
    }))
}

fn extract_f32(value: &DynValue) -> Result<ArrayD<f32>> {
    Ok(value.try_extract_array::<f32>()?.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn guidance_extrapolates_from_uncond() {
        let mut noise = ArrayD::<f32>::zeros(IxDyn(&[2, 1, 1, 2]));
        noise[[0, 0, 0, 0]] = 1.0;
        noise[[1, 0, 0, 0]] = 2.0;
        noise[[1, 0, 0, 1]] = -1.0;
        let guided = guide(&noise, 7.5).unwrap();
        assert_eq!(guided.shape(), &[1, 1, 1, 2]);
        assert_abs_diff_eq!(guided[[0, 0, 0, 0]], 8.5);
        assert_abs_diff_eq!(guided[[0, 0, 0, 1]], -7.5);
        assert!(guide(&ArrayD::zeros(IxDyn(&[1, 1])), 2.0).is_err());
    }

    #[test]
    fn control_tensor_is_batched_and_scaled() {
        let control = RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 255]));
        let tensor = control_to_tensor(&control, 8, 8, 2);
        assert_eq!(tensor.shape(), &[2, 3, 8, 8]);
        assert_abs_diff_eq!(tensor[[1, 0, 7, 7]], 1.0, epsilon = 1e-2);
        assert_abs_diff_eq!(tensor[[1, 1, 3, 3]], 0.0, epsilon = 1e-2);
    }

    #[test]
    fn decoder_range_maps_to_pixels() {
        let mut decoded = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 1, 2]));
        decoded[[0, 0, 0, 0]] = 1.0;
        decoded[[0, 1, 0, 0]] = -1.0;
        decoded[[0, 2, 0, 1]] = 3.0;
        let image = tensor_to_image(&decoded).unwrap();
        assert_eq!(image.dimensions(), (2, 1));
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 128]);
        assert_eq!(image.get_pixel(1, 0).0, [128, 128, 255]);
    }

    #[test]
    fn pipeline_config_defaults() {
        let cfg: DiffusionConfig = serde_json::from_str(r#"{ "timestep_dtype": "float32" }"#).unwrap();
        assert_eq!(cfg.timestep_dtype, TensorDtype::Float32);
        assert_eq!(cfg.input_ids_dtype, TensorDtype::Int32);
        assert_eq!(cfg.context_length, 77);
    }
}
