//! File cache coordinator: the single ingress for admitting, reusing and
//! invalidating cached objects.
//!
//! The coordinator owns the LRU index and the job registry for their whole
//! process lifetime and serialises every admit and invalidation under one
//! lock, so two admits for the same key can never race. Eviction safety for
//! concurrent readers relies on POSIX unlink semantics: an unlinked file
//! stays readable through descriptors that were open before the unlink.

use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytesize::ByteSize;
use nix::fcntl::OFlag;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, warn};

use crate::cache::download::job::{DownloadEnv, JobPhase};
use crate::cache::download::registry::JobRegistry;
use crate::cache::file_info::{CacheKey, FileInfo, KeyError};
use crate::cache::handle::CacheHandle;
use crate::cache::lru::{LruError, LruIndex};
use crate::config::{ConfigError, FileCacheConfig, NameFilter};
use crate::io;
use crate::store::{Bucket, ObjectRecord, ObjectStore};

/// Error describing why the configured cache directory cannot be used.
#[derive(Debug, Error)]
pub enum CacheDirError {
    /// The cache path exists but isn't a directory.
    #[error("cache path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The cache path is a non-empty directory whose contents do not stem
    /// from this application.
    #[error("cache path contains data from another application: {0}")]
    ForeignContents(PathBuf),

    /// An IO error occurred while preparing the cache directory.
    #[error("I/O error while preparing cache directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CacheInitError {
    #[error(transparent)]
    Dir(#[from] CacheDirError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Error thrown while acquiring a cache handle. The first three kinds tell
/// the mount layer to serve the read directly from the object store.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// The configured name filters keep this object out of the cache.
    #[error("object {0} is excluded from the file cache by the configured name filters")]
    Excluded(String),

    /// A first read at a non-zero offset does not create cache state unless
    /// range reads are configured to be cached.
    #[error("first read at offset {0} is random; the object will not be cached")]
    NotRequiredForRandomRead(u64),

    /// The index entry lost its backing file; the entry has been dropped and
    /// a retry will admit from scratch.
    #[error("object {0} is not present in the cache")]
    NotPresentInCache(String),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Lru(#[from] LruError),

    #[error("cache file I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Bounded on-disk cache of remote object contents.
///
/// Requires POSIX unlink semantics from the underlying filesystem; see the
/// module docs.
pub struct FileCache<S: ObjectStore> {
    /// Serialises admits and invalidations.
    admission: Mutex<()>,
    index: Arc<RwLock<LruIndex<FileInfo>>>,
    registry: JobRegistry<S>,
    root: PathBuf,
    filter: NameFilter,
    enable_o_direct: bool,
}

impl<S: ObjectStore> FileCache<S> {
    // Changing this constant makes existing cache directories look foreign
    // and breaks restart-over-old-cache behaviour.
    const MARKER_FILE: &'static str = ".blobfs-cache";

    /// Directory created beneath the configured cache dir.
    const SUBDIR: &'static str = "file-cache";

    /// Create the cache, preparing `{cache-dir}/file-cache` on disk.
    ///
    /// The directory must be empty, previously used by this application (it
    /// carries a marker file), or absent. Previous contents are removed; the
    /// cache is metadata-stateless across restarts.
    pub async fn new(store: Arc<S>, config: &FileCacheConfig) -> Result<Self, CacheInitError> {
        let filter = config.compile_filters()?;
        let root = Self::prepare_root(&config.cache_dir).await?;

        let index = Arc::new(RwLock::new(LruIndex::new(config.budget_bytes())));
        let permits = Arc::new(match config.download_permits() {
            Some(n) => Semaphore::new(n),
            None => Semaphore::new(Semaphore::MAX_PERMITS),
        });
        let env = Arc::new(DownloadEnv {
            store,
            index: Arc::clone(&index),
            chunk_bytes: config.chunk_bytes(),
            enable_crc: config.enable_crc,
            permits,
        });

        debug!(root = %root.display(), budget = %ByteSize::b(config.budget_bytes()), "file cache ready");
        Ok(Self {
            admission: Mutex::new(()),
            index,
            registry: JobRegistry::new(env),
            root,
            filter,
            enable_o_direct: config.enable_o_direct,
        })
    }

    async fn prepare_root(cache_dir: &Path) -> Result<PathBuf, CacheDirError> {
        let root = cache_dir.join(Self::SUBDIR);
        match tokio::fs::metadata(&root).await {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(CacheDirError::NotADirectory(root));
                }
                let mut entries = tokio::fs::read_dir(&root).await?;
                let is_empty = entries.next_entry().await?.is_none();
                let marker_exists = tokio::fs::try_exists(root.join(Self::MARKER_FILE)).await?;
                if !(is_empty || marker_exists) {
                    return Err(CacheDirError::ForeignContents(root));
                }
                io::remove_dir_contents(&root).await?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                io::create_dir_restricted(&root).await?;
            }
            Err(e) => return Err(e.into()),
        }

        // Marker file lets subsequent restarts reuse the directory.
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .mode(0o600)
            .open(root.join(Self::MARKER_FILE))
            .await?;
        Ok(root)
    }

    /// Admit or reuse the cache entry for one object version and return a
    /// handle for reading it.
    ///
    /// A surviving entry is promoted to most recently used. A stale entry
    /// (generation mismatch, writer died mid-download, or its job failed) is
    /// invalidated first and the object re-admitted. Eviction cleanup runs
    /// for every record the admission pushes over budget.
    pub async fn acquire(
        &self,
        bucket: &Bucket,
        object: &ObjectRecord,
        allow_random_prefetch: bool,
        initial_offset: u64,
    ) -> Result<CacheHandle<S>, AcquireError> {
        if self.filter.excludes(&bucket.name, &object.name) {
            return Err(AcquireError::Excluded(format!(
                "{}/{}",
                bucket.name, object.name
            )));
        }
        let key = CacheKey::new(bucket, &object.name)?;
        let dest = key.local_path(&self.root);

        let _admission = self.admission.lock().await;

        let peeked = self.index.read().lookup_peek(key.as_str());
        if peeked.is_none() && !allow_random_prefetch && initial_offset != 0 {
            return Err(AcquireError::NotRequiredForRandomRead(initial_offset));
        }

        let mut current = peeked;
        if let Some(fi) = &current {
            if !tokio::fs::try_exists(&dest).await? {
                warn!(key = %key, "cache entry has no backing file");
                // The guard must drop before cleanup: the job joined inside
                // re-acquires the index to publish its final progress.
                let erased = self.index.write().erase(key.as_str());
                if let Some(erased) = erased {
                    self.cleanup(&erased).await;
                }
                return Err(AcquireError::NotPresentInCache(format!(
                    "{}/{}",
                    bucket.name, object.name
                )));
            }

            let job = self.registry.get(key.as_str()).await;
            let stale = fi.generation != object.generation
                || (job.is_none() && fi.offset < fi.file_size)
                || job.as_ref().is_some_and(|job| {
                    matches!(job.status().phase, JobPhase::Failed | JobPhase::Invalid)
                });
            if stale {
                debug!(key = %key, generation = object.generation, "invalidating stale cache entry");
                let erased = self.index.write().erase(key.as_str());
                if let Some(erased) = erased {
                    self.cleanup(&erased).await;
                }
                current = None;
            }
        }

        let job = match current {
            Some(_) => {
                self.index.write().lookup(key.as_str());
                self.registry.get(key.as_str()).await
            }
            None => {
                let fi = FileInfo {
                    key: key.clone(),
                    generation: object.generation,
                    offset: 0,
                    file_size: object.size,
                };
                let evicted = self.index.write().insert(key.as_str().to_owned(), fi)?;
                let job = self
                    .registry
                    .create_if_not_exists(bucket, object, &key, dest.clone())
                    .await;
                for victim in evicted {
                    debug!(
                        key = %victim.key,
                        freed = %ByteSize::b(victim.file_size),
                        "evicting cache entry over budget"
                    );
                    self.cleanup(&victim).await;
                }
                Some(job)
            }
        };

        let file = self.open_local_file(&dest).await?;
        Ok(CacheHandle::new(
            file,
            job,
            Arc::clone(&self.index),
            key,
            allow_random_prefetch,
            initial_offset,
        ))
    }

    /// Drop the cache entry for one object and release its local file.
    /// Used by the filesystem layer when a file is deleted.
    pub async fn invalidate(&self, bucket: &Bucket, object_name: &str) -> Result<(), KeyError> {
        let key = CacheKey::new(bucket, object_name)?;
        let _admission = self.admission.lock().await;
        let erased = self.index.write().erase(key.as_str());
        if let Some(fi) = erased {
            debug!(key = %key, "invalidating cache entry");
            self.cleanup(&fi).await;
        }
        Ok(())
    }

    /// Drop every cache entry of `bucket` whose object name starts with
    /// `object_prefix`. Used when a directory is deleted.
    pub async fn invalidate_prefix(
        &self,
        bucket: &Bucket,
        object_prefix: &str,
    ) -> Result<(), KeyError> {
        let prefix = CacheKey::prefix(bucket, object_prefix)?;
        let _admission = self.admission.lock().await;
        let erased = self.index.write().erase_prefix(&prefix);
        debug!(prefix = %prefix, count = erased.len(), "invalidating cache entries by prefix");
        for fi in &erased {
            self.cleanup(fi).await;
        }
        Ok(())
    }

    /// Shut the cache down: terminate every download job and drop the index.
    /// On-disk contents are reclaimed when the directory is prepared on the
    /// next start.
    pub async fn destroy(&self) {
        self.registry.destroy().await;
        let _admission = self.admission.lock().await;
        self.index.write().clear();
    }

    /// Total bytes the index currently accounts for.
    pub fn cached_bytes(&self) -> u64 {
        self.index.read().current_bytes()
    }

    /// Number of cached entries.
    pub fn entry_count(&self) -> usize {
        self.index.read().entry_count()
    }

    /// Peek the cache record for an object, without touching recency.
    pub fn cached_entry(&self, bucket: &Bucket, object_name: &str) -> Option<FileInfo> {
        let key = CacheKey::new(bucket, object_name).ok()?;
        self.index.read().lookup_peek(key.as_str())
    }

    /// Cleanup protocol for a record removed from the index: stop the writer,
    /// truncate (reclaims disk immediately, open readers notwithstanding),
    /// then unlink. Missing files are fine at either disk step.
    async fn cleanup(&self, fi: &FileInfo) {
        self.registry.invalidate_and_remove(fi.key.as_str()).await;

        let path = fi.key.local_path(&self.root);
        if let Err(e) = io::truncate_idempotent(&path).await {
            error!(path = %path.display(), error = %e, "failed to truncate removed cache file");
        }
        if let Err(e) = io::remove_file_idempotent(&path).await {
            error!(path = %path.display(), error = %e, "failed to unlink removed cache file");
        }
    }

    async fn open_local_file(&self, dest: &Path) -> Result<std::fs::File, std::io::Error> {
        if let Some(parent) = dest.parent() {
            io::create_dir_restricted(parent).await?;
        }
        // The download job opens the path for writing without creating it;
        // the file must exist before the handle is handed out.
        if !tokio::fs::try_exists(dest).await? {
            tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .mode(0o600)
                .open(dest)
                .await?;
        }

        let mut opts = std::fs::OpenOptions::new();
        opts.read(true);
        if self.enable_o_direct {
            opts.custom_flags(OFlag::O_DIRECT.bits());
        }
        opts.open(dest)
    }
}
