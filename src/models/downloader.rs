use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::archive;
use super::types::{DownloadProgress, ModelInfo, ModelStatus, SYSTEM_MODEL_ID};
use crate::config::TtsConfig;
use crate::error::DownloadError;

/// Downloads, installs and removes voice models under one models root.
pub struct ModelDownloadManager {
    client: Client,
    models_dir: PathBuf,
    cache_dir: PathBuf,
    read_timeout: Duration,
    in_flight: InFlight,
}

/// Latest status of every acquisition in progress, keyed by model id.
type InFlight = Arc<Mutex<HashMap<String, ModelStatus>>>;

impl ModelDownloadManager {
    pub fn new(config: &TtsConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self::with_client(
            client,
            config.models_dir.clone(),
            config.cache_dir.clone(),
            Duration::from_secs(config.read_timeout_secs),
        ))
    }

    pub fn with_client(
        client: Client,
        models_dir: PathBuf,
        cache_dir: PathBuf,
        read_timeout: Duration,
    ) -> Self {
        Self {
            client,
            models_dir,
            cache_dir,
            read_timeout,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.models_dir.join(normalize_model_id(model_id))
    }

    pub fn is_ready(&self, model_id: &str) -> bool {
        if model_id == SYSTEM_MODEL_ID {
            return true;
        }
        dir_has_entries(&self.model_dir(model_id))
    }

    /// Ids of every installed model.
    pub fn list_ready(&self) -> BTreeSet<String> {
        let Ok(entries) = fs::read_dir(&self.models_dir) else {
            return BTreeSet::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .filter(|name| dir_has_entries(&self.models_dir.join(name)))
            .collect()
    }

    pub fn remove(&self, model_id: &str) -> bool {
        if model_id == SYSTEM_MODEL_ID {
            return false;
        }
        let dir = self.model_dir(model_id);
        if !dir.exists() {
            return false;
        }
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(model_id, "Removed model");
                true
            }
            Err(e) => {
                warn!(model_id, error = %e, "Failed to remove model directory");
                false
            }
        }
    }

    pub fn status(&self, model_id: &str) -> ModelStatus {
        if let Some(status) = self.in_flight.lock().get(model_id) {
            return status.clone();
        }
        if self.is_ready(model_id) {
            ModelStatus::Downloaded
        } else {
            ModelStatus::NotDownloaded
        }
    }

    /// Download and install `model`.
    ///
    /// Nothing happens until the stream is polled. The last item is either a
    /// completion or an error event. Dropping the stream early cancels the
    /// download and removes the partial archive. Once extraction has started
    /// it runs to the end, and the id stays claimed until it does.
    pub fn acquire(&self, model: &ModelInfo) -> impl Stream<Item = DownloadProgress> + Send + 'static {
        let client = self.client.clone();
        let models_dir = self.models_dir.clone();
        let cache_dir = self.cache_dir.clone();
        let read_timeout = self.read_timeout;
        let in_flight = self.in_flight.clone();
        let model = model.clone();

        async_stream::stream! {
            let id = model.id;
            let Some(claim) = InFlightClaim::acquire(&in_flight, id) else {
                yield DownloadProgress::failed(id, DownloadError::InProgress(id.to_string()).to_string());
                return;
            };
            info!(model_id = id, url = model.download_url, "Starting model download");

            let response = match client.get(model.download_url).send().await {
                Ok(r) => r,
                Err(e) => {
                    yield DownloadProgress::failed(id, DownloadError::from(e).to_string());
                    return;
                }
            };
            if !response.status().is_success() {
                let status = response.status().as_u16();
                warn!(model_id = id, status, "Model download rejected");
                yield DownloadProgress::failed(id, DownloadError::Status(status).to_string());
                return;
            }

            let content_length = response.content_length().filter(|len| *len > 0);
            let total = content_length.unwrap_or(model.size_bytes);

            if let Err(e) = tokio::fs::create_dir_all(&cache_dir).await {
                yield DownloadProgress::failed(id, DownloadError::from(e).to_string());
                return;
            }
            let (mut file, part) = match create_part_file(&cache_dir, id) {
                Ok(created) => created,
                Err(e) => {
                    yield DownloadProgress::failed(id, DownloadError::from(e).to_string());
                    return;
                }
            };

            let mut hasher = Sha256::new();
            let mut downloaded: u64 = 0;
            let mut body = response.bytes_stream();
            loop {
                let chunk = match tokio::time::timeout(read_timeout, body.next()).await {
                    Err(_) => Err(DownloadError::ReadTimeout(read_timeout.as_secs())),
                    Ok(None) => break,
                    Ok(Some(Err(e))) => Err(DownloadError::from(e)),
                    Ok(Some(Ok(chunk))) => Ok(chunk),
                };
                let written = match chunk {
                    Ok(chunk) => file.write_all(&chunk).await.map(|_| chunk).map_err(DownloadError::from),
                    Err(e) => Err(e),
                };
                match written {
                    Ok(chunk) => {
                        hasher.update(&chunk);
                        downloaded += chunk.len() as u64;
                        let progress = DownloadProgress::downloading(id, downloaded, total);
                        claim.set(ModelStatus::from_progress(&progress));
                        yield DownloadProgress::downloading(id, downloaded, total);
                    }
                    Err(e) => {
                        warn!(model_id = id, error = %e, "Model download failed");
                        yield DownloadProgress::failed(id, e.to_string());
                        return;
                    }
                }
            }
            if let Err(e) = file.flush().await {
                yield DownloadProgress::failed(id, DownloadError::from(e).to_string());
                return;
            }
            drop(file);

            if downloaded == 0 {
                yield DownloadProgress::failed(id, DownloadError::EmptyBody.to_string());
                return;
            }

            if let Some(expected) = model.sha256 {
                let actual = format!("{:x}", hasher.finalize());
                if !actual.eq_ignore_ascii_case(expected) {
                    let err = DownloadError::Checksum { expected: expected.to_string(), actual };
                    yield DownloadProgress::failed(id, err.to_string());
                    return;
                }
            }

            let total = content_length.unwrap_or(downloaded);
            let progress = DownloadProgress::extracting(id, downloaded, total);
            claim.set(ModelStatus::from_progress(&progress));
            yield progress;

            let archive_dir = model.archive_dir;
            let installed = tokio::task::spawn_blocking(move || {
                let result = install_archive(part.path(), &models_dir, id, archive_dir);
                drop(part);
                drop(claim);
                result
            })
            .await
            .map_err(DownloadError::from)
            .and_then(|r| r);

            match installed {
                Ok(dir) => {
                    info!(model_id = id, dir = %dir.display(), bytes = downloaded, "Model installed");
                    yield DownloadProgress::completed(id, total);
                }
                Err(e) => {
                    warn!(model_id = id, error = %e, "Model extraction failed");
                    yield DownloadProgress::failed(id, e.to_string());
                }
            }
        }
    }
}

/// Directory name a model id is stored under.
pub fn normalize_model_id(model_id: &str) -> String {
    let mut name: String = model_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.starts_with('.') || name.is_empty() {
        name.insert(0, '_');
    }
    name
}

/// Partial archive with a name unique to this attempt. Deleted when the
/// returned [`NamedTempFile`] drops.
fn create_part_file(cache_dir: &Path, model_id: &str) -> std::io::Result<(File, NamedTempFile)> {
    let part = tempfile::Builder::new()
        .prefix(&format!("{}.", normalize_model_id(model_id)))
        .suffix(".tar.bz2.part")
        .tempfile_in(cache_dir)?;
    let handle = part.reopen()?;
    Ok((File::from_std(handle), part))
}

/// Extract into a staging directory, then move the result into place.
fn install_archive(
    archive_path: &Path,
    models_dir: &Path,
    model_id: &str,
    archive_dir: &str,
) -> Result<PathBuf, DownloadError> {
    let name = normalize_model_id(model_id);
    fs::create_dir_all(models_dir)?;

    let staging = tempfile::Builder::new()
        .prefix(&format!(".staging-{name}-"))
        .tempdir_in(models_dir)?;
    archive::extract_tar_bz2(archive_path, staging.path())?;

    let extracted = locate_extracted(staging.path(), archive_dir)?;
    let target = models_dir.join(&name);
    if target.exists() {
        debug!(model_id, "Replacing existing model directory");
        fs::remove_dir_all(&target)?;
    }
    fs::rename(&extracted, &target)?;
    Ok(target)
}

fn locate_extracted(staging: &Path, archive_dir: &str) -> Result<PathBuf, DownloadError> {
    if !archive_dir.is_empty() {
        let expected = staging.join(archive_dir);
        if expected.is_dir() {
            return Ok(expected);
        }
    }
    let entries: Vec<_> = fs::read_dir(staging)?.filter_map(|e| e.ok()).collect();
    if let [only] = entries.as_slice() {
        if only.file_type()?.is_dir() {
            return Ok(only.path());
        }
    }
    Ok(staging.to_path_buf())
}

fn dir_has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Marks a model id as being downloaded for the claim's lifetime.
struct InFlightClaim {
    set: InFlight,
    id: String,
}

impl InFlightClaim {
    fn acquire(set: &InFlight, id: &str) -> Option<Self> {
        let mut claimed = set.lock();
        if claimed.contains_key(id) {
            return None;
        }
        let status = ModelStatus::Downloading {
            fraction: 0.0,
            extracting: false,
        };
        claimed.insert(id.to_string(), status);
        Some(Self {
            set: set.clone(),
            id: id.to_string(),
        })
    }

    fn set(&self, status: ModelStatus) {
        if let Some(slot) = self.set.lock().get_mut(&self.id) {
            *slot = status;
        }
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &Path) -> ModelDownloadManager {
        ModelDownloadManager::with_client(
            Client::new(),
            root.join("models"),
            root.join("cache"),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn normalizes_ids_into_safe_names() {
        assert_eq!(normalize_model_id("piper-amy-low"), "piper-amy-low");
        assert_eq!(normalize_model_id("../etc"), "_.._etc");
        assert_eq!(normalize_model_id("a b/c"), "a_b_c");
        assert_eq!(normalize_model_id(""), "_");
    }

    #[test]
    fn system_model_is_always_ready_and_never_removed() {
        let scratch = tempfile::tempdir().unwrap();
        let mgr = manager(scratch.path());
        assert!(mgr.is_ready("system"));
        assert!(!mgr.remove("system"));
    }

    #[test]
    fn empty_directory_is_not_ready() {
        let scratch = tempfile::tempdir().unwrap();
        let mgr = manager(scratch.path());
        fs::create_dir_all(mgr.model_dir("piper-amy-low")).unwrap();
        assert!(!mgr.is_ready("piper-amy-low"));
        assert!(mgr.list_ready().is_empty());

        fs::write(mgr.model_dir("piper-amy-low").join("tokens.txt"), "a 1").unwrap();
        assert!(mgr.is_ready("piper-amy-low"));
        assert_eq!(mgr.status("piper-amy-low"), ModelStatus::Downloaded);
    }

    #[test]
    fn list_ready_skips_staging_directories() {
        let scratch = tempfile::tempdir().unwrap();
        let mgr = manager(scratch.path());
        let staging = mgr.models_dir().join(".staging-x");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("f"), "x").unwrap();
        let real = mgr.model_dir("vits-zh-fanchen");
        fs::create_dir_all(&real).unwrap();
        fs::write(real.join("model.onnx"), "x").unwrap();

        let ready = mgr.list_ready();
        assert_eq!(ready.into_iter().collect::<Vec<_>>(), vec!["vits-zh-fanchen"]);
    }

    #[test]
    fn remove_reports_whether_anything_was_deleted() {
        let scratch = tempfile::tempdir().unwrap();
        let mgr = manager(scratch.path());
        assert!(!mgr.remove("piper-amy-low"));

        let dir = mgr.model_dir("piper-amy-low");
        fs::create_dir_all(dir.join("espeak-ng-data")).unwrap();
        fs::write(dir.join("tokens.txt"), "a 1").unwrap();
        assert!(mgr.remove("piper-amy-low"));
        assert!(!dir.exists());
    }

    #[test]
    fn second_claim_for_same_id_is_refused() {
        let set: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let first = InFlightClaim::acquire(&set, "m").unwrap();
        assert!(InFlightClaim::acquire(&set, "m").is_none());
        assert!(InFlightClaim::acquire(&set, "other").is_some());
        drop(first);
        assert!(InFlightClaim::acquire(&set, "m").is_some());
    }

    #[test]
    fn status_follows_the_latest_progress() {
        let scratch = tempfile::tempdir().unwrap();
        let mgr = manager(scratch.path());
        let claim = InFlightClaim::acquire(&mgr.in_flight, "m").unwrap();
        assert_eq!(
            mgr.status("m"),
            ModelStatus::Downloading { fraction: 0.0, extracting: false }
        );

        claim.set(ModelStatus::from_progress(&DownloadProgress::downloading("m", 50, 200)));
        assert_eq!(
            mgr.status("m"),
            ModelStatus::Downloading { fraction: 0.25, extracting: false }
        );

        claim.set(ModelStatus::from_progress(&DownloadProgress::extracting("m", 200, 200)));
        assert!(matches!(mgr.status("m"), ModelStatus::Downloading { extracting: true, .. }));

        drop(claim);
        assert_eq!(mgr.status("m"), ModelStatus::NotDownloaded);
    }
}
