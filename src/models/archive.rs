//! Extraction of `.tar.bz2` model bundles.
//!
//! Archives come from the network and are treated as untrusted: every entry
//! is resolved against the extraction root before anything is written, and
//! an entry that would land outside it aborts the whole extraction.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, warn};

use crate::error::ArchiveError;

/// Unpack `archive` into `dest`, returning the number of files written.
pub fn extract_tar_bz2(archive: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    let file = File::open(archive)?;
    let decoder = BzDecoder::new(BufReader::new(file));
    extract_tar(decoder, dest)
}

/// Unpack an uncompressed tar stream into `dest`.
pub fn extract_tar<R: io::Read>(reader: R, dest: &Path) -> Result<usize, ArchiveError> {
    fs::create_dir_all(dest)?;
    let root = dest.canonicalize()?;

    let mut archive = Archive::new(reader);
    let entries = archive.entries().map_err(corrupt)?;

    let mut written = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(corrupt)?;
        let raw = entry.path_bytes().into_owned();
        let name = String::from_utf8_lossy(&raw).into_owned();

        let relative = sanitize_entry_path(Path::new(&name))
            .ok_or_else(|| ArchiveError::PathTraversal(name.clone()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let out_path = root.join(&relative);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&out_path)?;
                ensure_inside(&root, &out_path, &name)?;
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                let parent = out_path.parent().unwrap_or(&root);
                fs::create_dir_all(parent)?;
                ensure_inside(&root, parent, &name)?;

                let mut out = File::create(&out_path)?;
                io::copy(&mut entry, &mut out).map_err(corrupt)?;
                written += 1;
            }
            other => {
                warn!(entry = %name, kind = ?other, "Skipping unsupported archive entry");
            }
        }
    }

    debug!(files = written, dest = %root.display(), "Archive extracted");
    if written == 0 {
        return Err(ArchiveError::Empty);
    }
    Ok(written)
}

/// Normalize an entry path lexically. `None` if it is absolute or climbs
/// above the root.
pub fn sanitize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.iter().collect())
}

fn ensure_inside(root: &Path, path: &Path, name: &str) -> Result<(), ArchiveError> {
    let resolved = path.canonicalize()?;
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(ArchiveError::PathTraversal(name.to_string()))
    }
}

fn corrupt(e: io::Error) -> ArchiveError {
    ArchiveError::Corrupt(e.to_string())
}
