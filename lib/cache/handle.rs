//! Per-read cache handle.

use std::os::unix::fs::FileExt as _;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::cache::download::job::{DownloadJob, JobError, JobPhase};
use crate::cache::file_info::{CacheKey, FileInfo};
use crate::cache::lru::LruIndex;
use crate::store::{ObjectRecord, ObjectStore};

/// A read is sequential when it starts within this many bytes of the
/// previous read's end. Sequential readers wait for download progress;
/// random readers proceed opportunistically.
pub const SEQUENTIAL_READ_WINDOW: u64 = 8 * 1024 * 1024;

/// Error thrown by [`CacheHandle::read`].
#[derive(Debug, Error)]
pub enum ReadError {
    /// The cache entry was evicted, replaced by another generation, or has
    /// not caught up to the requested range. The caller closes the handle
    /// and falls back to a direct object-store read.
    #[error("cache entry is stale or evicted")]
    StaleEntry,

    #[error("cache handle is closed")]
    Closed,

    /// The wait for download progress was cancelled through the caller's
    /// token. The download itself keeps running.
    #[error("read cancelled")]
    Cancelled,

    /// The download terminated before reaching the requested range.
    #[error("download failed: {0}")]
    Download(Arc<JobError>),

    #[error("cache file I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A reader's view of one cached object: an open descriptor to the local
/// file, the download job feeding it, and the index borrow used to
/// revalidate liveness on every read.
///
/// One handle per reader; a handle is not shared across tasks. The handle
/// keeps no entry alive — eviction proceeds regardless of open handles, and
/// the open descriptor (valid after unlink per POSIX) is what keeps
/// in-flight reads safe.
pub struct CacheHandle<S: ObjectStore> {
    file: Option<std::fs::File>,
    /// `None` when the entry was already fully downloaded and its job retired.
    job: Option<Arc<DownloadJob<S>>>,
    index: Arc<RwLock<LruIndex<FileInfo>>>,
    key: CacheKey,
    allow_random_prefetch: bool,
    is_sequential: bool,
    prev_offset: u64,
}

impl<S: ObjectStore> std::fmt::Debug for CacheHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("key", &self.key)
            .field("has_job", &self.job.is_some())
            .field("allow_random_prefetch", &self.allow_random_prefetch)
            .field("is_sequential", &self.is_sequential)
            .field("prev_offset", &self.prev_offset)
            .finish()
    }
}

impl<S: ObjectStore> CacheHandle<S> {
    pub(crate) fn new(
        file: std::fs::File,
        job: Option<Arc<DownloadJob<S>>>,
        index: Arc<RwLock<LruIndex<FileInfo>>>,
        key: CacheKey,
        allow_random_prefetch: bool,
        initial_offset: u64,
    ) -> Self {
        Self {
            file: Some(file),
            job,
            index,
            key,
            allow_random_prefetch,
            is_sequential: initial_offset == 0,
            prev_offset: initial_offset,
        }
    }

    /// Read `buf.len()` bytes of `object` at `offset` from the local cache
    /// file, waiting for download progress when the access pattern warrants
    /// it. Returns the number of bytes read; a read crossing the object end
    /// comes back short.
    ///
    /// The entry is validated against the index before and after the read;
    /// the second check is what guarantees the bytes belong to the requested
    /// generation even when an eviction raced the read.
    pub async fn read(
        &mut self,
        token: &CancellationToken,
        object: &ObjectRecord,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, ReadError> {
        if self.file.is_none() {
            return Err(ReadError::Closed);
        }

        let fi = self
            .index
            .read()
            .lookup_peek(self.key.as_str())
            .ok_or(ReadError::StaleEntry)?;
        if fi.generation != object.generation {
            return Err(ReadError::StaleEntry);
        }

        self.is_sequential = offset <= self.prev_offset.saturating_add(SEQUENTIAL_READ_WINDOW);
        self.prev_offset = offset.saturating_add(buf.len() as u64);

        let required_offset = offset.saturating_add(buf.len() as u64).min(fi.file_size);
        let wait = self.is_sequential || self.allow_random_prefetch;

        if let Some(job) = &self.job {
            let status = job
                .download(token, required_offset, wait)
                .await
                .map_err(|_| ReadError::Cancelled)?;
            // A terminal job can still serve the read when the bytes it
            // already wrote cover the request.
            if status.offset < required_offset
                && matches!(status.phase, JobPhase::Failed | JobPhase::Invalid)
            {
                return Err(match status.err {
                    Some(err) => ReadError::Download(err),
                    None => ReadError::StaleEntry,
                });
            }
        }

        let file = self.file.as_ref().ok_or(ReadError::Closed)?;
        let n = file.read_at(buf, offset)?;

        // Revalidate after the read: an eviction may have truncated the file
        // underneath the pread, in which case the bytes are garbage and the
        // miss must be surfaced. This lookup also promotes the entry.
        let fi = self
            .index
            .write()
            .lookup(self.key.as_str())
            .ok_or(ReadError::StaleEntry)?;
        if fi.generation != object.generation || fi.offset < required_offset {
            return Err(ReadError::StaleEntry);
        }

        trace!(key = %self.key, offset, bytes = n, "served read from cache");
        Ok(n)
    }

    /// Close the descriptor. The entry, the job and other handles are
    /// unaffected; closing twice is a no-op.
    pub fn close(&mut self) {
        self.file = None;
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}
