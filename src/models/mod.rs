//! Voice model catalog and on-disk model management.

pub mod archive;
pub mod downloader;
pub mod registry;
pub mod types;

pub use downloader::{normalize_model_id, ModelDownloadManager};
pub use registry::{all_models, downloadable_models, model_by_id, system_model};
pub use types::{DownloadProgress, ModelFamily, ModelInfo, ModelStatus, SYSTEM_MODEL_ID};
