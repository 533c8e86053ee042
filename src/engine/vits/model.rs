use std::path::{Path, PathBuf};

use ndarray::{arr1, Array2, ArrayView2};
use ort::execution_providers::CPUExecutionProvider;
use ort::inputs;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use tracing::{debug, info};

use super::frontend::{Frontend, TokenTable};
use crate::engine::{VoiceModel, DEFAULT_SAMPLE_RATE};
use crate::error::EngineError;
use crate::models::{ModelFamily, ModelInfo};

const NOISE_SCALE: f32 = 0.667;
const NOISE_SCALE_W: f32 = 0.8;

const KOKORO_STYLE_DIM: usize = 256;
const KOKORO_MAX_TOKENS: usize = 510;

enum Architecture {
    /// Piper and other VITS exports: `x`, `x_length`, the three scales and
    /// an optional `sid`.
    Vits { add_blank: bool, piper: bool },
    /// Kokoro: `tokens`, a per-speaker `style` row and `speed`.
    Kokoro { voices: Vec<f32> },
}

/// A VITS-family voice running on onnxruntime.
pub struct VitsModel {
    session: Session,
    architecture: Architecture,
    tokens: TokenTable,
    frontend: Frontend,
    sample_rate: u32,
    num_speakers: u32,
}

impl VitsModel {
    pub fn load(info: &ModelInfo, model_dir: &Path, num_threads: usize) -> Result<Self, EngineError> {
        let onnx = required(model_dir, info.model_file)?;
        let tokens = TokenTable::load(&required(model_dir, info.tokens_file)?)?;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers([CPUExecutionProvider::default().build()])?
            .with_intra_threads(num_threads.max(1))?
            .commit_from_file(&onnx)?;

        let sample_rate = metadata(&session, "sample_rate")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SAMPLE_RATE);
        let num_speakers = metadata(&session, "n_speakers")
            .and_then(|v| v.parse().ok())
            .unwrap_or(info.num_speakers)
            .max(1);
        let frontend = Frontend::for_model_dir(model_dir, metadata(&session, "voice"))?;

        let architecture = match info.family {
            ModelFamily::Kokoro => {
                let voices = load_voices(&required(model_dir, "voices.bin")?)?;
                Architecture::Kokoro { voices }
            }
            _ => Architecture::Vits {
                add_blank: metadata(&session, "add_blank").is_some_and(|v| v == "1"),
                piper: info.family == ModelFamily::Piper,
            },
        };

        info!(
            path = %onnx.display(),
            tokens = tokens.len(),
            sample_rate,
            num_speakers,
            "ONNX voice session ready"
        );

        Ok(Self {
            session,
            architecture,
            tokens,
            frontend,
            sample_rate,
            num_speakers,
        })
    }

    fn token_ids(&self, text: &str) -> Result<Vec<i64>, EngineError> {
        let symbols = self.frontend.symbols(text)?;
        let ids = self.tokens.encode(symbols.iter().map(String::as_str));
        let ids = match &self.architecture {
            Architecture::Vits { piper: true, .. } => {
                // ^ p0 _ p1 _ ... $
                let pad = self.tokens.get("_").unwrap_or(0);
                let mut out = Vec::with_capacity(ids.len() * 2 + 2);
                out.extend(self.tokens.get("^"));
                for id in ids {
                    out.push(id);
                    out.push(pad);
                }
                out.extend(self.tokens.get("$"));
                out
            }
            Architecture::Vits { add_blank: true, .. } => {
                let mut out = vec![0; ids.len() * 2 + 1];
                for (i, id) in ids.into_iter().enumerate() {
                    out[i * 2 + 1] = id;
                }
                out
            }
            _ => ids,
        };
        Ok(ids)
    }

    fn run_vits(&mut self, ids: Vec<i64>, speaker_id: u32, speed: f32) -> Result<Vec<f32>, EngineError> {
        let len = ids.len();
        let x = Array2::from_shape_vec((1, len), ids)?;
        let x_length = arr1(&[len as i64]);
        let noise_scale = arr1(&[NOISE_SCALE]);
        let length_scale = arr1(&[1.0 / speed.max(0.1)]);
        let noise_scale_w = arr1(&[NOISE_SCALE_W]);

        let outputs = if self.num_speakers > 1 {
            let sid = arr1(&[speaker_id as i64]);
            self.session.run(inputs![
                "x" => TensorRef::from_array_view(x.view())?,
                "x_length" => TensorRef::from_array_view(x_length.view())?,
                "noise_scale" => TensorRef::from_array_view(noise_scale.view())?,
                "length_scale" => TensorRef::from_array_view(length_scale.view())?,
                "noise_scale_w" => TensorRef::from_array_view(noise_scale_w.view())?,
                "sid" => TensorRef::from_array_view(sid.view())?,
            ])?
        } else {
            self.session.run(inputs![
                "x" => TensorRef::from_array_view(x.view())?,
                "x_length" => TensorRef::from_array_view(x_length.view())?,
                "noise_scale" => TensorRef::from_array_view(noise_scale.view())?,
                "length_scale" => TensorRef::from_array_view(length_scale.view())?,
                "noise_scale_w" => TensorRef::from_array_view(noise_scale_w.view())?,
            ])?
        };

        let (_, audio) = outputs
            .iter()
            .next()
            .ok_or_else(|| EngineError::Inference("model produced no output".into()))?;
        let audio = audio.try_extract_array::<f32>()?;
        Ok(audio.iter().copied().collect())
    }

    fn run_kokoro(&mut self, ids: Vec<i64>, speaker_id: u32, speed: f32) -> Result<Vec<f32>, EngineError> {
        let Architecture::Kokoro { voices } = &self.architecture else {
            return Err(EngineError::ModelNotLoaded);
        };
        let mut ids = ids;
        ids.truncate(KOKORO_MAX_TOKENS - 2);

        let row = ids.len().min(KOKORO_MAX_TOKENS - 1);
        let start = (speaker_id as usize * KOKORO_MAX_TOKENS + row) * KOKORO_STYLE_DIM;
        let style = voices
            .get(start..start + KOKORO_STYLE_DIM)
            .ok_or(EngineError::SpeakerOutOfRange {
                speaker: speaker_id,
                available: self.num_speakers,
            })?;
        let style = ArrayView2::from_shape((1, KOKORO_STYLE_DIM), style)?;

        let mut padded = Vec::with_capacity(ids.len() + 2);
        padded.push(0);
        padded.extend(ids);
        padded.push(0);
        let tokens = Array2::from_shape_vec((1, padded.len()), padded)?;
        let speed = arr1(&[speed]);

        let outputs = self.session.run(inputs![
            "tokens" => TensorRef::from_array_view(tokens.view())?,
            "style" => TensorRef::from_array_view(style)?,
            "speed" => TensorRef::from_array_view(speed.view())?,
        ])?;

        let (_, audio) = outputs
            .iter()
            .next()
            .ok_or_else(|| EngineError::Inference("model produced no output".into()))?;
        let audio = audio.try_extract_array::<f32>()?;
        Ok(audio.iter().copied().collect())
    }
}

impl VoiceModel for VitsModel {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn num_speakers(&self) -> u32 {
        self.num_speakers
    }

    fn generate(&mut self, text: &str, speaker_id: u32, speed: f32) -> Result<Vec<f32>, EngineError> {
        let ids = self.token_ids(text)?;
        if ids.is_empty() {
            debug!(text, "No tokens produced");
            return Ok(Vec::new());
        }
        match self.architecture {
            Architecture::Kokoro { .. } => self.run_kokoro(ids, speaker_id, speed),
            Architecture::Vits { .. } => self.run_vits(ids, speaker_id, speed),
        }
    }
}

fn required(dir: &Path, name: &str) -> Result<PathBuf, EngineError> {
    let path = dir.join(name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(EngineError::MissingFile(path))
    }
}

fn metadata(session: &Session, key: &str) -> Option<String> {
    session.metadata().ok()?.custom(key).ok().flatten()
}

/// `voices.bin` is a flat little-endian f32 array of shape
/// `[speakers, 510, 256]`.
fn load_voices(path: &Path) -> Result<Vec<f32>, EngineError> {
    let bytes = std::fs::read(path)?;
    if bytes.len() % 4 != 0 {
        return Err(EngineError::Inference(format!(
            "{} is not a whole number of floats",
            path.display()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
