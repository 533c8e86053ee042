//! Offline text-to-speech for a reading app.
//!
//! - [`models`]: the voice catalog, plus downloading, installing and removing
//!   model bundles.
//! - [`engine`]: the neural engine (a downloaded voice model) and the system
//!   engine (the host speech service).
//! - [`playback`]: the reading session state machine that feeds sentences to
//!   an engine and audio to an [`audio::AudioOutput`].
//!
//! [`preferences`], [`timer`] and [`update`] are the small services the
//! reader app wires around those three.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod playback;
pub mod preferences;
pub mod timer;
pub mod update;

pub use config::TtsConfig;
pub use error::{Result, TtsError};
pub use playback::{PlaybackEvent, PlaybackManager, PlaybackParts, PlaybackState};
pub use preferences::{PreferencesManager, TtsPreferences};
