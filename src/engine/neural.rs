use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use tracing::{debug, info, warn};

use super::{VoiceModel, VoiceModelLoader};
use crate::models::ModelInfo;

pub const DEFAULT_SAMPLE_RATE: u32 = 22050;
pub const DEFAULT_NUM_SPEAKERS: u32 = 1;

struct LoadedModel {
    id: String,
    sample_rate: u32,
    num_speakers: u32,
    model: Box<dyn VoiceModel>,
}

/// Holds at most one neural voice and synthesizes with it.
///
/// Every failure is absorbed here: a load that fails leaves the engine
/// unloaded, a synthesis that fails (or panics) yields `None`.
pub struct NeuralEngine {
    loader: Box<dyn VoiceModelLoader>,
    loaded: Option<LoadedModel>,
}

impl NeuralEngine {
    pub fn new(loader: Box<dyn VoiceModelLoader>) -> Self {
        Self {
            loader,
            loaded: None,
        }
    }

    /// Replace the current model with `model` from `model_dir`.
    pub fn load(&mut self, model: &ModelInfo, model_dir: &Path) -> bool {
        self.release();

        let loader = &self.loader;
        let result = panic::catch_unwind(AssertUnwindSafe(|| loader.load(model, model_dir)));
        match result {
            Ok(Ok(voice)) => {
                let sample_rate = voice.sample_rate();
                let num_speakers = voice.num_speakers().max(1);
                info!(
                    model_id = model.id,
                    sample_rate, num_speakers, "Voice model loaded"
                );
                self.loaded = Some(LoadedModel {
                    id: model.id.to_string(),
                    sample_rate,
                    num_speakers,
                    model: voice,
                });
                true
            }
            Ok(Err(e)) => {
                warn!(model_id = model.id, error = %e, "Failed to load voice model");
                false
            }
            Err(_) => {
                warn!(model_id = model.id, "Voice model loader panicked");
                false
            }
        }
    }

    /// Samples for `text`, or `None` when nothing could be produced.
    pub fn synthesize(&mut self, text: &str, speaker_id: u32, speed: f32) -> Option<Vec<f32>> {
        let loaded = self.loaded.as_mut()?;
        let speaker = if speaker_id < loaded.num_speakers {
            speaker_id
        } else {
            debug!(speaker_id, available = loaded.num_speakers, "Speaker out of range, using 0");
            0
        };

        let model = &mut loaded.model;
        let result = panic::catch_unwind(AssertUnwindSafe(|| model.generate(text, speaker, speed)));
        match result {
            Ok(Ok(samples)) if !samples.is_empty() => Some(samples),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!(model_id = %loaded.id, error = %e, "Synthesis failed");
                None
            }
            Err(_) => {
                warn!(model_id = %loaded.id, "Synthesis panicked");
                None
            }
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.loaded
            .as_ref()
            .map(|m| m.sample_rate)
            .unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    pub fn num_speakers(&self) -> u32 {
        self.loaded
            .as_ref()
            .map(|m| m.num_speakers)
            .unwrap_or(DEFAULT_NUM_SPEAKERS)
    }

    pub fn current_model_id(&self) -> Option<&str> {
        self.loaded.as_ref().map(|m| m.id.as_str())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn release(&mut self) {
        if let Some(model) = self.loaded.take() {
            debug!(model_id = %model.id, "Voice model released");
        }
    }
}

impl Drop for NeuralEngine {
    fn drop(&mut self) {
        self.release();
    }
}
