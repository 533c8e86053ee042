use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::models::SYSTEM_MODEL_ID;

pub const MIN_SPEED: f32 = 0.5;
pub const MAX_SPEED: f32 = 3.0;

/// Values the playback manager follows while reading.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TtsPreferences {
    #[serde(default = "default_model_id")]
    pub tts_model_id: String,
    #[serde(default = "default_speed")]
    pub tts_speed: f32,
    #[serde(default)]
    pub tts_speaker_id: u32,
}

fn default_model_id() -> String {
    SYSTEM_MODEL_ID.to_string()
}

fn default_speed() -> f32 {
    1.0
}

impl Default for TtsPreferences {
    fn default() -> Self {
        Self {
            tts_model_id: default_model_id(),
            tts_speed: default_speed(),
            tts_speaker_id: 0,
        }
    }
}

pub struct PreferencesManager {
    preferences: Arc<RwLock<TtsPreferences>>,
    config_path: PathBuf,
    tx: watch::Sender<TtsPreferences>,
}

impl PreferencesManager {
    /// Preferences stored in the project config directory.
    pub fn new() -> Result<Self> {
        let project_dirs = crate::config::project_dirs()
            .ok_or_else(|| anyhow::anyhow!("Failed to get project directories"))?;
        Self::open(project_dirs.config_dir().join("preferences.json"))
    }

    /// Preferences stored at `config_path`; a missing or unreadable file
    /// yields defaults.
    pub fn open(config_path: PathBuf) -> Result<Self> {
        if let Some(dir) = config_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let preferences = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Ignoring unreadable preferences file");
                TtsPreferences::default()
            })
        } else {
            TtsPreferences::default()
        };

        let (tx, _) = watch::channel(preferences.clone());
        Ok(Self {
            preferences: Arc::new(RwLock::new(preferences)),
            config_path,
            tx,
        })
    }

    pub async fn get_preferences(&self) -> TtsPreferences {
        self.preferences.read().await.clone()
    }

    /// Live view of the preferences.
    pub fn subscribe(&self) -> watch::Receiver<TtsPreferences> {
        self.tx.subscribe()
    }

    pub async fn set_tts_model_id(&self, model_id: &str) -> Result<()> {
        let mut prefs = self.preferences.write().await;
        prefs.tts_model_id = model_id.to_string();
        self.save(&prefs).await
    }

    pub async fn set_tts_speed(&self, speed: f32) -> Result<()> {
        let mut prefs = self.preferences.write().await;
        prefs.tts_speed = speed.clamp(MIN_SPEED, MAX_SPEED);
        self.save(&prefs).await
    }

    pub async fn set_tts_speaker_id(&self, speaker_id: u32) -> Result<()> {
        let mut prefs = self.preferences.write().await;
        prefs.tts_speaker_id = speaker_id;
        self.save(&prefs).await
    }

    /// Fall back to the system voice when the active model was deleted.
    pub async fn on_model_removed(&self, model_id: &str) -> Result<()> {
        let mut prefs = self.preferences.write().await;
        if prefs.tts_model_id != model_id {
            return Ok(());
        }
        prefs.tts_model_id = default_model_id();
        prefs.tts_speaker_id = 0;
        self.save(&prefs).await
    }

    async fn save(&self, prefs: &TtsPreferences) -> Result<()> {
        let json = serde_json::to_string_pretty(prefs)?;
        tokio::fs::write(&self.config_path, json).await?;
        self.tx.send_replace(prefs.clone());
        Ok(())
    }
}
