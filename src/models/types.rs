use serde::{Deserialize, Serialize};

/// Model id of the host speech service. Always present, never downloaded.
pub const SYSTEM_MODEL_ID: &str = "system";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelFamily {
    Piper,
    Kokoro,
    VitsChinese,
    System,
}

/// Static description of a voice model.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub display_name: &'static str,
    pub family: ModelFamily,
    pub languages: &'static [&'static str],
    pub download_url: &'static str,
    pub size_bytes: u64,
    pub num_speakers: u32,
    pub model_file: &'static str,
    pub tokens_file: &'static str,
    /// Top-level directory inside the release archive.
    pub archive_dir: &'static str,
    pub description: &'static str,
    /// SHA-256 of the archive, when the publisher provides one.
    pub sha256: Option<&'static str>,
}

impl ModelInfo {
    pub fn is_system(&self) -> bool {
        self.id == SYSTEM_MODEL_ID
    }
}

/// One step of a model acquisition.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DownloadProgress {
    pub model_id: String,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub extracting: bool,
    pub complete: bool,
    pub error: Option<String>,
}

impl DownloadProgress {
    pub fn downloading(model_id: &str, bytes_downloaded: u64, total_bytes: u64) -> Self {
        Self {
            model_id: model_id.to_string(),
            bytes_downloaded,
            total_bytes,
            extracting: false,
            complete: false,
            error: None,
        }
    }

    pub fn extracting(model_id: &str, bytes_downloaded: u64, total_bytes: u64) -> Self {
        Self {
            extracting: true,
            ..Self::downloading(model_id, bytes_downloaded, total_bytes)
        }
    }

    pub fn completed(model_id: &str, total_bytes: u64) -> Self {
        Self {
            complete: true,
            ..Self::downloading(model_id, total_bytes, total_bytes)
        }
    }

    pub fn failed(model_id: &str, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::downloading(model_id, 0, 0)
        }
    }

    /// True for the last event of an acquisition.
    pub fn is_terminal(&self) -> bool {
        self.complete || self.error.is_some()
    }

    /// Downloaded fraction in `[0, 1]`, or 0 while the total is unknown.
    pub fn fraction(&self) -> f32 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_downloaded as f64 / self.total_bytes as f64).min(1.0) as f32
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum ModelStatus {
    NotDownloaded,
    Downloading { fraction: f32, extracting: bool },
    Downloaded,
}

impl ModelStatus {
    /// Status a UI should show after receiving `progress`.
    pub fn from_progress(progress: &DownloadProgress) -> Self {
        if progress.error.is_some() {
            ModelStatus::NotDownloaded
        } else if progress.complete {
            ModelStatus::Downloaded
        } else {
            ModelStatus::Downloading {
                fraction: progress.fraction(),
                extracting: progress.extracting,
            }
        }
    }
}
