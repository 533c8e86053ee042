use std::path::PathBuf;

/// Failures while fetching a model archive.
#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("Empty response")]
    EmptyBody,
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("no data received for {0} seconds")]
    ReadTimeout(u64),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
    #[error("download already in progress for {0}")]
    InProgress(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failures while unpacking a model archive.
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("archive entry escapes extraction root: {0}")]
    PathTraversal(String),
    #[error("corrupt archive: {0}")]
    Corrupt(String),
    #[error("archive produced no files")]
    Empty,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("model file not found: {0}")]
    MissingFile(PathBuf),
    #[error("no voice model loaded")]
    ModelNotLoaded,
    #[error("speaker {speaker} out of range (model has {available})")]
    SpeakerOutOfRange { speaker: u32, available: u32 },
    #[error("neural backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("phonemizer failed: {0}")]
    Phonemizer(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "onnx")]
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[cfg(feature = "onnx")]
    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(thiserror::Error, Debug)]
pub enum AudioError {
    #[error("no output device available")]
    NoDevice,
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("audio device error: {0}")]
    Device(String),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
    #[error("could not determine project directories")]
    NoProjectDirs,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum UpdateError {
    #[error("HTTP {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("release has no downloadable asset")]
    NoAsset,
}

/// Top-level error for callers that don't care which subsystem failed.
#[derive(thiserror::Error, Debug)]
pub enum TtsError {
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Update(#[from] UpdateError),
}

pub type Result<T, E = TtsError> = std::result::Result<T, E>;
