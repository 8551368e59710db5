//! Byte-level persistence of originals and thumbnails.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

/// File persistence used by the upload pipeline and image deletion.
pub trait ImageStore: Send + Sync {
    /// Write `bytes` to `path`, creating parent directories.
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Remove `path`. A file that is already gone is not an error.
    fn delete(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
}

/// [`ImageStore`] backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsImageStore;

impl ImageStore for FsImageStore {
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        if !path.exists() {
            debug!(path = %path.display(), "delete: file missing; skipping");
            return Ok(());
        }
        match fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "delete: removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "delete: file vanished during remove; skipping");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Collision-resistant stored name for an upload: `<stem>-<hash><.ext>`.
///
/// The hash covers the original name and `now`, so re-uploading the same file
/// never overwrites the earlier copy.
pub fn unique_name(original: &str, now: DateTime<Utc>) -> String {
    let base = Path::new(original)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    let path = Path::new(base);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("upload");
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(base.as_bytes());
    hasher.update(now.to_rfc3339().as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    format!("{stem}-{}{ext}", &digest[..12]).replace(' ', "_")
}

pub fn ensure_dirs<I, P>(paths: I) -> io::Result<()>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    for p in paths {
        let p = p.as_ref();
        if !p.as_os_str().is_empty() {
            fs::create_dir_all(p)?;
        }
    }
    Ok(())
}

/// Regular files directly inside `dir`. A missing directory has none.
pub fn list_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}
