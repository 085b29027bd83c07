//! Download job: the single writer that brings one local cache file's
//! authoritative prefix up to the object's full size.
//!
//! Progress and phase live in a `watch` channel so that any number of readers
//! can wait for their offset without per-waiter bookkeeping: every publish
//! wakes all waiters and each re-checks its own threshold.

use std::hash::Hasher as _;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::io::{AsyncSeekExt as _, AsyncWriteExt as _};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use twox_hash::XxHash64;

use crate::cache::download::registry::JobTable;
use crate::cache::file_info::{CacheKey, FileInfo};
use crate::cache::lru::LruIndex;
use crate::store::{Bucket, ObjectRecord, ObjectStore, StoreError};

/// Phase of a download job.
///
/// `Completed`, `Failed` and `Invalid` are terminal; a job that reaches
/// `Invalid` never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    NotStarted,
    Downloading,
    Completed,
    Failed,
    Invalid,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Invalid)
    }
}

/// Atomic snapshot of a job's progress.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub phase: JobPhase,
    /// Bytes contiguously written at the head of the local file.
    pub offset: u64,
    pub err: Option<Arc<JobError>>,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("local cache file I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A blocked [`DownloadJob::download`] call was cancelled through its token.
/// The job itself is unaffected; other waiters keep waiting.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("download wait cancelled")]
pub struct WaitCancelled;

/// Collaborators shared by every job of one registry.
pub(crate) struct DownloadEnv<S: ObjectStore> {
    pub(crate) store: Arc<S>,
    pub(crate) index: Arc<RwLock<LruIndex<FileInfo>>>,
    pub(crate) chunk_bytes: u64,
    pub(crate) enable_crc: bool,
    pub(crate) permits: Arc<Semaphore>,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    invalidated: bool,
    task: Option<JoinHandle<()>>,
}

enum FetchOutcome {
    Completed,
    Cancelled,
}

/// State machine managing one asynchronous ranged download into one local
/// file. At most one download task runs per job; the task is the only writer
/// of the file and of the published offset.
pub struct DownloadJob<S: ObjectStore> {
    bucket: Bucket,
    object: ObjectRecord,
    key: CacheKey,
    dest: PathBuf,
    env: Arc<DownloadEnv<S>>,
    cancel: CancellationToken,
    status_tx: watch::Sender<JobStatus>,
    lifecycle: Mutex<Lifecycle>,
    table: Weak<JobTable<S>>,
}

impl<S: ObjectStore> DownloadJob<S> {
    pub(crate) fn new(
        env: Arc<DownloadEnv<S>>,
        bucket: Bucket,
        object: ObjectRecord,
        key: CacheKey,
        dest: PathBuf,
        table: Weak<JobTable<S>>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(JobStatus {
            phase: JobPhase::NotStarted,
            offset: 0,
            err: None,
        });
        Arc::new(Self {
            bucket,
            object,
            key,
            dest,
            env,
            cancel: CancellationToken::new(),
            status_tx,
            lifecycle: Mutex::new(Lifecycle::default()),
            table,
        })
    }

    /// The object version this job downloads.
    pub fn object(&self) -> &ObjectRecord {
        &self.object
    }

    /// Snapshot of the current phase, offset and error.
    pub fn status(&self) -> JobStatus {
        self.status_tx.borrow().clone()
    }

    /// Start the download if it has not started, then optionally wait until
    /// the published offset reaches `required_offset`, the job reaches a
    /// terminal phase, or `token` is cancelled, whichever comes first.
    ///
    /// With `wait = false` the current status is returned immediately.
    pub async fn download(
        self: &Arc<Self>,
        token: &CancellationToken,
        required_offset: u64,
        wait: bool,
    ) -> Result<JobStatus, WaitCancelled> {
        self.ensure_started();
        let mut rx = self.status_tx.subscribe();
        if !wait {
            return Ok(rx.borrow().clone());
        }
        loop {
            let status = rx.borrow_and_update().clone();
            if status.offset >= required_offset || status.phase.is_terminal() {
                return Ok(status);
            }
            tokio::select! {
                () = token.cancelled() => return Err(WaitCancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(rx.borrow().clone());
                    }
                }
            }
        }
    }

    /// Stop the job and make it terminal.
    ///
    /// Idempotent. When this returns, the download task has observed
    /// cancellation and no further writes to the local file can occur. The
    /// registry entry is swept by the caller (or by the task's own
    /// termination path), never from under the job's own lock.
    pub async fn invalidate(&self) {
        let first = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.invalidated {
                None
            } else {
                lifecycle.invalidated = true;
                self.cancel.cancel();
                Some(lifecycle.task.take())
            }
        };

        match first {
            Some(task) => {
                if let Some(task) = task {
                    if let Err(e) = task.await {
                        if !e.is_cancelled() {
                            warn!(key = %self.key, error = %e, "download task panicked during invalidation");
                        }
                    }
                }
                self.status_tx.send_modify(|status| {
                    if status.phase != JobPhase::Completed {
                        status.phase = JobPhase::Invalid;
                    }
                });
            }
            None => {
                // A concurrent invalidation owns the task join; wait until it
                // publishes a terminal phase.
                let mut rx = self.status_tx.subscribe();
                while !rx.borrow_and_update().phase.is_terminal() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn ensure_started(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.started || lifecycle.invalidated {
            return;
        }
        lifecycle.started = true;
        self.status_tx
            .send_modify(|status| status.phase = JobPhase::Downloading);
        let job = Arc::clone(self);
        lifecycle.task = Some(tokio::spawn(job.run()));
    }

    async fn run(self: Arc<Self>) {
        // The permit bounds concurrently downloading jobs and is held for the
        // task's whole life. A deferred job sits here while its waiters block
        // on the progress channel.
        let permits = Arc::clone(&self.env.permits);
        let _permit = tokio::select! {
            () = self.cancel.cancelled() => return,
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                // The registry closed the semaphore at shutdown.
                Err(_) => return,
            },
        };

        match self.fetch_loop().await {
            Ok(FetchOutcome::Completed) => {
                debug!(key = %self.key, size = self.object.size, "download completed");
                self.status_tx
                    .send_modify(|status| status.phase = JobPhase::Completed);
                self.retire();
            }
            Ok(FetchOutcome::Cancelled) => {
                // invalidate() owns the Invalid transition and the sweep.
                trace!(key = %self.key, "download task observed cancellation");
            }
            Err(err) => {
                warn!(key = %self.key, error = %err, "download failed");
                let err = Arc::new(err);
                self.status_tx.send_modify(|status| {
                    status.phase = JobPhase::Failed;
                    status.err = Some(err);
                });
                self.retire();
            }
        }
    }

    async fn fetch_loop(&self) -> Result<FetchOutcome, JobError> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.dest)
            .await?;
        let mut offset = self.status().offset;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        let mut hasher = self.env.enable_crc.then(|| XxHash64::with_seed(0));

        while offset < self.object.size {
            if self.cancel.is_cancelled() {
                return Ok(FetchOutcome::Cancelled);
            }
            let len = self.env.chunk_bytes.min(self.object.size - offset);
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
                chunk = self.env.store.read_range(
                    &self.bucket,
                    &self.object.name,
                    self.object.generation,
                    offset,
                    len,
                ) => chunk?,
            };
            if chunk.is_empty() {
                return Err(JobError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "object store returned no data before the object end",
                )));
            }

            file.write_all(&chunk).await?;
            // Readers pread through their own descriptors; the chunk must hit
            // the file before the offset that advertises it.
            file.flush().await?;

            if let Some(hasher) = hasher.as_mut() {
                hasher.write(&chunk);
            }
            offset += chunk.len() as u64;
            self.publish_progress(offset);
        }

        if let Some(hasher) = hasher {
            debug!(key = %self.key, checksum = hasher.finish(), "download checksum");
        }
        Ok(FetchOutcome::Completed)
    }

    /// Publish `offset` to waiters and into the index record, without
    /// promoting the entry.
    fn publish_progress(&self, offset: u64) {
        self.status_tx.send_modify(|status| status.offset = offset);

        let mut index = self.env.index.write();
        if let Some(mut fi) = index.lookup_peek(self.key.as_str())
            && fi.generation == self.object.generation
        {
            fi.offset = offset;
            index.update_in_place(self.key.as_str(), fi);
        }
        trace!(key = %self.key, offset, "published download progress");
    }

    fn retire(self: &Arc<Self>) {
        if let Some(table) = self.table.upgrade() {
            table.remove_exact(self.key.as_str(), self);
        }
    }
}
