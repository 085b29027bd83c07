//! Filesystem utilities for the cache directory.

use std::io::ErrorKind;
use std::path::Path;

/// Remove all files and directories in the given directory, but not the
/// directory itself.
pub async fn remove_dir_contents(path: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if tokio::fs::metadata(&path).await?.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
    }
    Ok(())
}

/// Create `path` and any missing parents. The final directory is owner-only
/// (0700).
pub async fn create_dir_restricted(path: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    builder.mode(0o700);
    builder.create(path).await
}

/// Truncate the file at `path` to zero length, reclaiming its disk blocks
/// even while other descriptors remain open. A missing file counts as done.
pub async fn truncate_idempotent(path: &Path) -> std::io::Result<()> {
    match tokio::fs::OpenOptions::new().write(true).open(path).await {
        Ok(file) => file.set_len(0).await,
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Unlink the file at `path`. A missing file counts as done.
pub async fn remove_file_idempotent(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
