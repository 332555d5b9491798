use crate::error::Result;
use crate::vote::Aggregation;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Preprocessing and shape description shipped next to `visual.onnx`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EmbedderConfig {
    pub embed_dim: usize,
    pub image_size: u32,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
    #[serde(default = "default_interpolation")]
    pub interpolation: String,
    #[serde(default = "default_resize_mode")]
    pub resize_mode: String,
}

// OpenAI CLIP normalization, also used by the DFN checkpoints.
const fn default_mean() -> [f32; 3] {
    [0.481_454_66, 0.457_827_5, 0.408_210_73]
}

const fn default_std() -> [f32; 3] {
    [0.268_629_54, 0.261_302_58, 0.275_777_11]
}

fn default_interpolation() -> String {
    "bicubic".to_string()
}

fn default_resize_mode() -> String {
    "shortest".to_string()
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            embed_dim: 512,
            image_size: 224,
            mean: default_mean(),
            std: default_std(),
            interpolation: default_interpolation(),
            resize_mode: default_resize_mode(),
        }
    }
}

impl EmbedderConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DetectorSettings {
    pub model: PathBuf,
    pub input_size: u32,
    pub conf: f32,
    pub iou: f32,
    pub classes: Vec<usize>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            model: PathBuf::from("models/yolo11n.onnx"),
            input_size: 640,
            conf: 0.25,
            iou: 0.45,
            classes: vec![crate::detector::COCO_CAT, crate::detector::COCO_DOG],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BreedSettings {
    /// Directory holding `visual.onnx` and `model_config.json`.
    pub embedder_dir: PathBuf,
    /// Holds one sub-directory per animal type with the index and id map.
    pub data_dir: PathBuf,
    pub crop_pad: u32,
    pub search_k: usize,
    pub top_breeds: usize,
    pub aggregation: Aggregation,
}

impl Default for BreedSettings {
    fn default() -> Self {
        Self {
            embedder_dir: PathBuf::from("models/clip-vit-b-16"),
            data_dir: PathBuf::from("data/breeds"),
            crop_pad: 2,
            search_k: 50,
            top_breeds: 5,
            aggregation: Aggregation::Max,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TryOnSettings {
    pub diffusion_dir: PathBuf,
    pub catalog: PathBuf,
    pub size: u32,
    pub steps: usize,
    pub guidance_scale: f32,
    pub controlnet_scale: f32,
    pub canny_low: f32,
    pub canny_high: f32,
    pub seed: u64,
    pub samples: usize,
    /// Crop to the detected subject before resizing.
    pub crop_subject: bool,
    pub subject_pad_ratio: f32,
}

impl Default for TryOnSettings {
    fn default() -> Self {
        Self {
            diffusion_dir: PathBuf::from("models/sd15-controlnet-canny"),
            catalog: PathBuf::from("data/tryon_metadata.json"),
            size: 512,
            steps: 20,
            guidance_scale: 7.5,
            controlnet_scale: 0.7,
            canny_low: 100.0,
            canny_high: 200.0,
            seed: 42,
            samples: 1,
            crop_subject: false,
            subject_pad_ratio: 0.08,
        }
    }
}

/// Top-level settings; every field has a default so partial files are fine.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub detector: DetectorSettings,
    pub breed: BreedSettings,
    pub tryon: TryOnSettings,
    /// ONNX intra-op threads, 0 for one per core.
    pub threads: usize,
}

impl Settings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load from `path` when given, otherwise fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::from_file)
    }

    /// Location of the index and id map for one animal type.
    #[must_use]
    pub fn database_dir(&self, animal: &str) -> PathBuf {
        self.breed.data_dir.join(animal)
    }
}
