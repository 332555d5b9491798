use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PawsightError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ONNX error: {0}")]
    Onnx(#[from] ort::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Shape/Tensor error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Tokenization error: {0}")]
    Tokenizer(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Inference error: {0}")]
    Inference(String),
    #[error("Index error: {0}")]
    Index(String),
    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Model folder not found: {}", .0.display())]
    ModelFolderNotFound(PathBuf),
    #[error("Model folder {} is missing '{file}'", model_dir.display())]
    MissingModelFile { model_dir: PathBuf, file: String },
    #[error("Unknown product: {0}")]
    UnknownProduct(String),
    #[error("No animal detected in image")]
    NoAnimal,
    #[error("Download error: {0}")]
    Download(String),
    #[cfg(feature = "hf-hub")]
    #[error("Hugging Face Hub error: {0}")]
    HfHub(#[from] hf_hub::api::sync::ApiError),
}

pub type Result<T> = std::result::Result<T, PawsightError>;
