use crate::error::Result;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use tracing::debug;

pub struct OnnxSession {
    pub session: Session,
}

impl OnnxSession {
    /// Open a graph; `threads == 0` means one per logical core.
    pub fn with_threads(path: impl AsRef<Path>, threads: usize) -> Result<Self> {
        let path = path.as_ref();
        let threads = if threads == 0 { num_cpus::get() } else { threads };

        #[allow(unused_mut)]
        let mut builder = Session::builder()?;
        #[cfg(feature = "cuda")]
        {
            builder = builder.with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default().build(),
            ])?;
        }

        let session = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(threads)?
            .commit_from_file(path)?;
        debug!(path = %path.display(), threads, "onnx session ready");

        Ok(Self { session })
    }

    /// Helper to check if the model expects a specific input name
    #[must_use]
    pub fn has_input(&self, name: &str) -> bool {
        self.session.inputs.iter().any(|i| i.name == name)
    }

    /// Helper to find the first likely input name for a specific role
    #[must_use]
    pub fn find_input(&self, possibilities: &[&str]) -> Option<String> {
        possibilities
            .iter()
            .find(|p| self.has_input(p))
            .map(|p| (*p).to_string())
    }

    /// First input name, or `fallback` for graphs without declared inputs.
    #[must_use]
    pub fn first_input_or(&self, fallback: &str) -> String {
        self.session
            .inputs
            .first()
            .map_or_else(|| fallback.to_string(), |i| i.name.clone())
    }

    #[must_use]
    pub fn output_names(&self) -> Vec<String> {
        self.session.outputs.iter().map(|o| o.name.clone()).collect()
    }
}
