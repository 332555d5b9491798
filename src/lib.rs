#![allow(clippy::missing_errors_doc)]
pub mod breed;
pub mod builder;
pub mod config;
pub mod crop;
pub mod detector;
pub mod diffusion;
pub mod edges;
pub mod error;
pub mod index;
pub mod model_manager;
pub mod onnx;
pub mod prompt;
pub mod scheduler;
pub mod server;
pub mod source;
pub mod tryon;
pub mod vision;
pub mod vote;

pub use breed::{BreedDetector, BreedReport};
pub use config::Settings;
pub use detector::{AnimalKind, Detector};
pub use error::{PawsightError, Result};
pub use index::{BreedDatabase, FlatIndex};
pub use tryon::TryOnPipeline;
pub use vision::ImageEmbedder;
