//! Speech engines.
//!
//! Two backends sit behind the playback manager:
//!
//! - [`NeuralEngine`] runs a downloaded voice model and hands back raw samples.
//! - [`SystemEngine`] asks the host speech service to speak a string.
//!
//! Which one is used is decided per reading session from the active model id
//! (see [`EngineKind::for_model_id`]).
//!
//! Enable the `onnx` feature for the Piper/VITS backend.

pub mod neural;
pub mod system;
#[cfg(feature = "onnx")]
pub mod vits;

use std::path::Path;

use crate::error::EngineError;
use crate::models::{ModelInfo, SYSTEM_MODEL_ID};

pub use neural::{NeuralEngine, DEFAULT_NUM_SPEAKERS, DEFAULT_SAMPLE_RATE};
pub use system::{CommandSpeechService, SpeechService, SystemEngine};

/// Which backend a model id selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    System,
    Neural,
}

impl EngineKind {
    pub fn for_model_id(model_id: &str) -> Self {
        if model_id == SYSTEM_MODEL_ID {
            EngineKind::System
        } else {
            EngineKind::Neural
        }
    }
}

/// A loaded neural voice.
pub trait VoiceModel: Send {
    fn sample_rate(&self) -> u32;

    fn num_speakers(&self) -> u32;

    /// Mono samples in `[-1, 1]` for `text`.
    fn generate(&mut self, text: &str, speaker_id: u32, speed: f32) -> Result<Vec<f32>, EngineError>;
}

/// Builds a [`VoiceModel`] from an installed model directory.
pub trait VoiceModelLoader: Send + Sync {
    fn load(&self, model: &ModelInfo, model_dir: &Path) -> Result<Box<dyn VoiceModel>, EngineError>;
}

/// Loader used when no neural backend is compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableLoader;

impl VoiceModelLoader for UnavailableLoader {
    fn load(&self, model: &ModelInfo, _model_dir: &Path) -> Result<Box<dyn VoiceModel>, EngineError> {
        Err(EngineError::BackendUnavailable(format!(
            "{} needs the `onnx` feature",
            model.id
        )))
    }
}

/// The neural loader this build was compiled with.
pub fn default_loader() -> Box<dyn VoiceModelLoader> {
    #[cfg(feature = "onnx")]
    {
        Box::new(vits::VitsModelLoader::default())
    }
    #[cfg(not(feature = "onnx"))]
    {
        Box::new(UnavailableLoader)
    }
}
