use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const MODELS_DIR_ENV: &str = "READER_TTS_MODELS_DIR";
pub const CACHE_DIR_ENV: &str = "READER_TTS_CACHE_DIR";

/// Runtime settings for downloads and playback.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TtsConfig {
    /// One sub-directory per installed model.
    pub models_dir: PathBuf,
    /// Partial downloads live here, outside `models_dir`.
    pub cache_dir: PathBuf,
    pub connect_timeout_secs: u64,
    /// Longest gap between two body chunks before a download is abandoned.
    pub read_timeout_secs: u64,
    /// Extra wait after each audio block so the device drains.
    pub playback_slack_ms: u64,
    /// GitHub `owner/name` polled for new releases.
    pub update_repo: String,
    pub user_agent: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        let (models_dir, cache_dir) = match project_dirs() {
            Some(dirs) => (
                dirs.data_dir().join("tts_models"),
                dirs.cache_dir().to_path_buf(),
            ),
            None => (PathBuf::from("tts_models"), PathBuf::from(".cache")),
        };
        Self {
            models_dir,
            cache_dir,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            playback_slack_ms: 100,
            update_repo: "anthropics/kk_reader".to_string(),
            user_agent: format!("reader-tts/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TtsConfig {
    /// Load `config.json` from the project config directory, falling back to
    /// defaults, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let dirs = project_dirs().ok_or(ConfigError::NoProjectDirs)?;
        let mut config = Self::from_file(&dirs.config_dir().join("config.json"))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Read settings from `path`; missing file means defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(MODELS_DIR_ENV) {
            self.models_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            self.cache_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        // Partial downloads must never show up as installed models.
        if self.cache_dir.starts_with(&self.models_dir) {
            return Err(ConfigError::InvalidValue {
                field: "cache_dir".to_string(),
                message: "must not be inside models_dir".to_string(),
            });
        }
        Ok(())
    }
}

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "kk", "ReaderTts")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("config.json");
        std::fs::write(&path, r#"{ "read_timeout_secs": 5, "models_dir": "/tmp/m" }"#).unwrap();

        let config = TtsConfig::from_file(&path).unwrap();
        assert_eq!(config.read_timeout_secs, 5);
        assert_eq!(config.models_dir, PathBuf::from("/tmp/m"));
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.playback_slack_ms, 100);
    }

    #[test]
    fn missing_file_is_default() {
        let scratch = tempfile::tempdir().unwrap();
        let config = TtsConfig::from_file(&scratch.path().join("none.json")).unwrap();
        assert_eq!(config, TtsConfig::default());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = TtsConfig {
            read_timeout_secs: 0,
            ..TtsConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "read_timeout_secs"
        ));
    }

    #[test]
    fn cache_inside_models_root_is_rejected() {
        let config = TtsConfig {
            models_dir: PathBuf::from("/data/models"),
            cache_dir: PathBuf::from("/data/models/cache"),
            ..TtsConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
