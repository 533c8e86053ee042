//! onnxruntime backend for the catalog's Piper, VITS and Kokoro voices.
//!
//! Text goes through a frontend (espeak-ng IPA, or `lexicon.txt` when the
//! model ships one), is mapped through `tokens.txt`, and the resulting ids
//! are fed to the exported graph. Requires `espeak-ng` on `PATH` for models
//! without a lexicon.

mod frontend;
mod model;

use std::path::Path;

pub use model::VitsModel;

use super::{VoiceModel, VoiceModelLoader};
use crate::error::EngineError;
use crate::models::ModelInfo;

#[derive(Debug, Clone)]
pub struct VitsModelLoader {
    pub num_threads: usize,
}

impl Default for VitsModelLoader {
    fn default() -> Self {
        Self { num_threads: 2 }
    }
}

impl VoiceModelLoader for VitsModelLoader {
    fn load(&self, model: &ModelInfo, model_dir: &Path) -> Result<Box<dyn VoiceModel>, EngineError> {
        Ok(Box::new(VitsModel::load(model, model_dir, self.num_threads)?))
    }
}
