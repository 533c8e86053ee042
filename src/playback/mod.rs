//! Reading sessions.
//!
//! [`PlaybackManager`] owns one reading session at a time. A session splits
//! the text into sentences and plays them one after another through whichever
//! engine the active model id selects:
//!
//! ```text
//! Idle ──start_reading──▶ Loading ──engine ready──▶ Playing ──done──▶ Idle
//!                            │                        │  ▲
//!                            └──not ready──▶ Idle   pause resume
//!                                                     ▼  │
//!                                                    Paused
//! ```
//!
//! `stop()` returns to Idle from anywhere. Resuming restarts the pending text
//! from its first sentence.

mod sentences;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

pub use sentences::split_sentences;

use crate::audio::{block_duration_ms, f32_to_pcm16, AudioBlock, AudioOutput};
use crate::engine::{EngineKind, NeuralEngine, SystemEngine};
use crate::error::AudioError;
use crate::models::{model_by_id, ModelDownloadManager, SYSTEM_MODEL_ID};
use crate::preferences::TtsPreferences;

/// Name reported when the active model is not in the catalog.
pub const SYSTEM_MODEL_NAME: &str = "System TTS";

const EVENT_CAPACITY: usize = 64;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Paused,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub enum PlaybackEvent {
    StateChanged(PlaybackState),
    SentenceStarted { index: usize, total: usize },
    /// The session reached the end of its text.
    Finished,
}

/// Everything a [`PlaybackManager`] needs.
pub struct PlaybackParts {
    pub neural: NeuralEngine,
    pub system: SystemEngine,
    pub downloads: Arc<ModelDownloadManager>,
    pub output: Arc<dyn AudioOutput>,
    pub preferences: watch::Receiver<TtsPreferences>,
    /// Extra wait after each real-time block.
    pub playback_slack: Duration,
}

#[derive(Clone, Debug)]
struct Settings {
    model_id: String,
    speed: f32,
    speaker_id: u32,
}

#[derive(Default)]
struct Session {
    generation: u64,
    task: Option<AbortHandle>,
    pending_text: Option<String>,
}

struct Inner {
    neural: Arc<Mutex<NeuralEngine>>,
    system: SystemEngine,
    downloads: Arc<ModelDownloadManager>,
    output: Arc<dyn AudioOutput>,
    slack: Duration,
    settings: Mutex<Settings>,
    session: Mutex<Session>,
    paused: watch::Sender<bool>,
    state: watch::Sender<PlaybackState>,
    events: broadcast::Sender<PlaybackEvent>,
}

/// Plays text aloud and tracks the play/pause/stop state.
///
/// Control methods take `&self` and may be called from any task. Methods that
/// start work must be called inside a tokio runtime.
pub struct PlaybackManager {
    inner: Arc<Inner>,
    observer: JoinHandle<()>,
}

impl PlaybackManager {
    pub fn new(parts: PlaybackParts) -> Self {
        let initial = parts.preferences.borrow().clone();
        let (state, _) = watch::channel(PlaybackState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (paused, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            neural: Arc::new(Mutex::new(parts.neural)),
            system: parts.system,
            downloads: parts.downloads,
            output: parts.output,
            slack: parts.playback_slack,
            settings: Mutex::new(Settings {
                model_id: initial.tts_model_id.clone(),
                speed: initial.tts_speed,
                speaker_id: initial.tts_speaker_id,
            }),
            session: Mutex::new(Session::default()),
            paused,
            state,
            events,
        });

        let observer = tokio::spawn(follow_preferences(Arc::downgrade(&inner), parts.preferences, initial));
        Self { inner, observer }
    }

    /// Start reading `text` from its first sentence, replacing any current
    /// session. Blank text is ignored.
    pub fn start_reading(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let text = text.to_string();

        let mut session = self.inner.session.lock();
        if let Some(task) = session.task.take() {
            task.abort();
        }
        session.generation += 1;
        session.pending_text = Some(text.clone());
        let generation = session.generation;

        self.inner.paused.send_replace(false);
        self.inner.publish(PlaybackState::Loading);

        let inner = self.inner.clone();
        let task = tokio::spawn(run_session(inner, generation, text));
        session.task = Some(task.abort_handle());
    }

    /// Pause at the next sentence boundary. The current neural block is
    /// silenced now; a platform utterance is stopped.
    pub fn pause(&self) {
        if self.state() == PlaybackState::Idle {
            return;
        }
        self.inner.paused.send_replace(true);
        self.inner.system.pause();
        self.inner.publish(PlaybackState::Paused);
    }

    /// Read the pending text again from the beginning.
    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
        let pending = self.inner.session.lock().pending_text.clone();
        if let Some(text) = pending {
            self.start_reading(&text);
        }
    }

    pub fn stop(&self) {
        {
            let mut session = self.inner.session.lock();
            if let Some(task) = session.task.take() {
                task.abort();
            }
            session.generation += 1;
            session.pending_text = None;
        }
        self.inner.paused.send_replace(false);
        self.inner.system.stop();
        self.inner.publish(PlaybackState::Idle);
    }

    /// Applies from the next synthesized sentence.
    pub fn set_speed(&self, speed: f32) {
        self.inner.settings.lock().speed = speed;
    }

    pub fn set_speaker(&self, speaker_id: u32) {
        self.inner.settings.lock().speaker_id = speaker_id;
    }

    /// 0 for the platform engine, otherwise the loaded model's speaker count.
    pub fn num_speakers(&self) -> u32 {
        if self.inner.settings.lock().model_id == SYSTEM_MODEL_ID {
            0
        } else {
            self.inner.neural.lock().num_speakers()
        }
    }

    pub fn current_model_name(&self) -> String {
        let model_id = self.inner.settings.lock().model_id.clone();
        model_by_id(&model_id)
            .map(|m| m.display_name.to_string())
            .unwrap_or_else(|| SYSTEM_MODEL_NAME.to_string())
    }

    pub fn state(&self) -> PlaybackState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.inner.events.subscribe()
    }

    /// Stop, free both engines and stop following preferences.
    pub fn release(self) {
        self.stop();
        self.inner.neural.lock().release();
        self.inner.system.release();
        self.observer.abort();
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        self.observer.abort();
        if let Some(task) = self.inner.session.lock().task.take() {
            task.abort();
        }
    }
}

impl Inner {
    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    fn publish(&self, state: PlaybackState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!(?state, "Playback state changed");
            let _ = self.events.send(PlaybackEvent::StateChanged(state));
        }
    }

    /// Publish `state` for session `generation`. Returns false, writing
    /// nothing, once that session has been replaced or stopped.
    fn transition(&self, generation: u64, state: PlaybackState) -> bool {
        let session = self.session.lock();
        if session.generation != generation {
            return false;
        }
        let state = match state {
            PlaybackState::Playing if self.is_paused() => PlaybackState::Paused,
            other => other,
        };
        self.publish(state);
        true
    }

    /// True when the session should stop before its next sentence.
    fn checkpoint(&self, generation: u64) -> bool {
        if self.is_paused() {
            self.transition(generation, PlaybackState::Paused);
            return true;
        }
        self.session.lock().generation != generation
    }

    fn announce(&self, generation: u64, index: usize, total: usize) {
        if self.session.lock().generation == generation {
            let _ = self.events.send(PlaybackEvent::SentenceStarted { index, total });
        }
    }

    fn finish(&self, generation: u64) {
        let session = self.session.lock();
        if session.generation != generation {
            return;
        }
        if self.is_paused() {
            self.publish(PlaybackState::Paused);
        } else {
            self.publish(PlaybackState::Idle);
            let _ = self.events.send(PlaybackEvent::Finished);
        }
    }

    fn settings(&self) -> Settings {
        self.settings.lock().clone()
    }
}

async fn run_session(inner: Arc<Inner>, generation: u64, text: String) {
    let model_id = inner.settings().model_id;
    let sentences = split_sentences(&text);
    info!(model_id = %model_id, sentences = sentences.len(), "Starting reading session");

    let completed = match EngineKind::for_model_id(&model_id) {
        EngineKind::System => play_system(&inner, generation, &sentences).await,
        EngineKind::Neural => play_neural(&inner, generation, &model_id, &sentences).await,
    };
    if completed {
        inner.finish(generation);
    }
}

/// Returns true when every sentence was handed to the engine.
async fn play_system(inner: &Inner, generation: u64, sentences: &[String]) -> bool {
    if !inner.system.is_available() {
        warn!("System speech unavailable");
        inner.transition(generation, PlaybackState::Idle);
        return false;
    }
    inner.transition(generation, PlaybackState::Playing);

    let total = sentences.len();
    for (index, sentence) in sentences.iter().enumerate() {
        if inner.checkpoint(generation) {
            return false;
        }
        inner.announce(generation, index, total);

        let (done_tx, done_rx) = oneshot::channel();
        inner.system.speak(sentence, inner.settings().speed, move || {
            let _ = done_tx.send(());
        });
        if done_rx.await.is_err() {
            // Callback dropped unfired: the service went away mid-session.
            debug!(index, "System utterance dropped");
        }
    }
    true
}

async fn play_neural(inner: &Inner, generation: u64, model_id: &str, sentences: &[String]) -> bool {
    if !ensure_loaded(inner, model_id).await {
        inner.transition(generation, PlaybackState::Idle);
        return false;
    }
    inner.transition(generation, PlaybackState::Playing);

    let total = sentences.len();
    for (index, sentence) in sentences.iter().enumerate() {
        if inner.checkpoint(generation) {
            return false;
        }
        inner.announce(generation, index, total);

        let Settings { speed, speaker_id, .. } = inner.settings();
        let engine = inner.neural.clone();
        let text = sentence.clone();
        let synthesized = tokio::task::spawn_blocking(move || {
            let mut engine = engine.lock();
            let samples = engine.synthesize(&text, speaker_id, speed);
            (samples, engine.sample_rate())
        })
        .await;

        let (samples, sample_rate) = match synthesized {
            Ok((Some(samples), sample_rate)) => (samples, sample_rate),
            Ok((None, _)) => {
                debug!(index, "No audio for sentence, skipping");
                continue;
            }
            Err(e) => {
                warn!(index, error = %e, "Synthesis task failed");
                continue;
            }
        };
        if inner.checkpoint(generation) {
            return false;
        }
        if let Err(e) = play_block(inner, &samples, sample_rate).await {
            warn!(index, error = %e, "Audio output failed, skipping sentence");
        }
    }
    true
}

async fn ensure_loaded(inner: &Inner, model_id: &str) -> bool {
    let Some(model) = model_by_id(model_id) else {
        warn!(model_id, "Unknown model id");
        return false;
    };
    let engine = inner.neural.clone();
    let downloads = inner.downloads.clone();
    let loaded = tokio::task::spawn_blocking(move || {
        let mut engine = engine.lock();
        if engine.current_model_id() == Some(model.id) {
            return true;
        }
        if !downloads.is_ready(model.id) {
            warn!(model_id = model.id, "Model is not downloaded");
            return false;
        }
        engine.load(model, &downloads.model_dir(model.id))
    })
    .await;
    loaded.unwrap_or(false)
}

/// Play one sentence and wait for it to drain. The block is dropped on
/// return, or when the session is aborted mid-wait.
async fn play_block(inner: &Inner, samples: &[f32], sample_rate: u32) -> Result<(), AudioError> {
    let pcm = f32_to_pcm16(samples);
    let wait = Duration::from_millis(block_duration_ms(pcm.len(), sample_rate)) + inner.slack;

    // Device open and stop may block.
    let output = inner.output.clone();
    let block = tokio::task::spawn_blocking(move || -> Result<Box<dyn AudioBlock>, AudioError> {
        let mut block = output.open(sample_rate)?;
        block.write(&pcm)?;
        block.play()?;
        Ok(block)
    })
    .await
    .map_err(|e| AudioError::Device(e.to_string()))??;

    if inner.output.is_realtime() {
        let mut paused = inner.paused.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = async { let _ = paused.wait_for(|p| *p).await; } => {
                debug!("Block cut short by pause");
            }
        }
    }

    let _ = tokio::task::spawn_blocking(move || {
        let mut block = block;
        block.stop();
    })
    .await;
    Ok(())
}

/// Copy preference changes into the live settings. Only fields that changed
/// are copied, so `set_speed`/`set_speaker` hold until the user edits them.
async fn follow_preferences(
    inner: std::sync::Weak<Inner>,
    mut preferences: watch::Receiver<TtsPreferences>,
    mut last: TtsPreferences,
) {
    while preferences.changed().await.is_ok() {
        let current = preferences.borrow_and_update().clone();
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut settings = inner.settings.lock();
        if current.tts_model_id != last.tts_model_id {
            debug!(model_id = %current.tts_model_id, "Active model changed");
            settings.model_id = current.tts_model_id.clone();
        }
        if current.tts_speed != last.tts_speed {
            settings.speed = current.tts_speed;
        }
        if current.tts_speaker_id != last.tts_speaker_id {
            settings.speaker_id = current.tts_speaker_id;
        }
        last = current;
    }
}
