//! Blocking walks over payload and store trees, run on the blocking pool.

use crate::{LibrarianError, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::task;
use walkdir::{DirEntry, WalkDir};

/// In-flight copies live here on a store: local staging and rsync partials.
pub(crate) const STAGING_DIR: &str = ".staging";

/// Sum of the regular files at or below `root`, which may itself be a file.
/// Staging directories are skipped.
pub(crate) async fn tree_bytes(root: PathBuf) -> Result<u64> {
    blocking(move || {
        let mut total = 0u64;
        for entry in walk(&root) {
            let entry = entry?;
            if entry.file_type().is_file() {
                total = total.saturating_add(entry.metadata()?.len());
            }
        }
        Ok(total)
    })
    .await
}

/// Copies a file or directory tree to `target` and checks every copied file
/// against the SHA-256 of its source.
pub(crate) async fn copy_verified(source: PathBuf, target: PathBuf) -> Result<()> {
    blocking(move || {
        for entry in walk(&source) {
            let entry = entry?;
            let relative = entry.path().strip_prefix(&source).map_err(|error| {
                LibrarianError::Internal(format!(
                    "{} escaped {}: {}",
                    entry.path().display(),
                    source.display(),
                    error
                ))
            })?;
            let destination = if relative.as_os_str().is_empty() {
                target.clone()
            } else {
                target.join(relative)
            };

            if entry.file_type().is_dir() {
                fs::create_dir_all(&destination)?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &destination)?;
                verify_copy(entry.path(), &destination)?;
            }
        }
        Ok(())
    })
    .await
}

pub(crate) fn verify_copy(source: &Path, copy: &Path) -> Result<()> {
    let expected = file_sha256(source)?;
    let actual = file_sha256(copy)?;
    if expected != actual {
        return Err(LibrarianError::HashMismatch { expected, actual });
    }
    Ok(())
}

fn walk(root: &Path) -> impl Iterator<Item = walkdir::Result<DirEntry>> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || entry.file_name() != STAGING_DIR)
}

fn file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .map_err(|error| LibrarianError::Internal(format!("tree walk failed: {}", error)))?
}
