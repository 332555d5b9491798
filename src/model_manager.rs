use crate::error::{PawsightError, Result};
#[cfg(feature = "hf-hub")]
use hf_hub::api::sync::Api;
use std::path::{Path, PathBuf};

/// Files an image embedder directory must contain.
pub const EMBEDDER_FILES: &[&str] = &["model_config.json", "visual.onnx"];

/// Files a Stable Diffusion + ControlNet export must contain.
pub const DIFFUSION_FILES: &[&str] = &[
    "text_encoder/model.onnx",
    "tokenizer/tokenizer.json",
    "unet/model.onnx",
    "controlnet/model.onnx",
    "vae_decoder/model.onnx",
];

/// Index file name inside a per-animal database directory.
pub const INDEX_FILE: &str = "faiss_IndexFlatIP.faiss";
/// Id map file name inside a per-animal database directory.
pub const ID_MAP_FILE: &str = "id_map.json";

/// Download the embedder files for `model_id` from the Hugging Face Hub.
#[cfg(feature = "hf-hub")]
pub fn get_hf_model(model_id: &str) -> Result<PathBuf> {
    let api = Api::new()?;
    let repo = api.model(model_id.to_string());

    let mut model_dir = None;
    for file in EMBEDDER_FILES {
        let downloaded_file = repo.get(file)?;
        if model_dir.is_none() {
            model_dir = downloaded_file.parent().map(ToOwned::to_owned);
        }
    }

    model_dir.ok_or_else(|| {
        PawsightError::Download(format!(
            "Could not determine model directory for '{model_id}'"
        ))
    })
}

/// Verify that a model directory exists and contains `files`.
pub fn verify_model_dir(model_dir: &Path, files: &[&str]) -> Result<()> {
    if !model_dir.is_dir() {
        return Err(PawsightError::ModelFolderNotFound(model_dir.to_owned()));
    }

    for file in files {
        if !model_dir.join(file).is_file() {
            return Err(PawsightError::MissingModelFile {
                model_dir: model_dir.to_owned(),
                file: (*file).to_string(),
            });
        }
    }

    Ok(())
}

/// Resolve the index and id map paths of a database directory, checking both exist.
pub fn database_files(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let index = dir.join(INDEX_FILE);
    let id_map = dir.join(ID_MAP_FILE);
    for path in [&index, &id_map] {
        if !path.is_file() {
            return Err(PawsightError::NotFound(path.clone()));
        }
    }
    Ok((index, id_map))
}
