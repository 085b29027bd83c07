#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use blob_fs::config::FileCacheConfig;
use blob_fs::store::{Bucket, ObjectRecord, ObjectStore, StoreError};
use bytes::Bytes;
use tokio::sync::Semaphore;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;

struct StoredObject {
    data: Vec<u8>,
    generation: i64,
}

/// In-memory object store.
///
/// When built with [`MockStore::gated`], every ranged read consumes one
/// permit from the returned semaphore, so tests control download progress
/// chunk by chunk.
pub struct MockStore {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    gate: Option<Arc<Semaphore>>,
    fail_reads: AtomicBool,
    read_calls: AtomicUsize,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            gate: None,
            fail_reads: AtomicBool::new(false),
            read_calls: AtomicUsize::new(0),
        })
    }

    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let store = Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            gate: Some(Arc::clone(&gate)),
            fail_reads: AtomicBool::new(false),
            read_calls: AtomicUsize::new(0),
        });
        (store, gate)
    }

    /// Insert (or replace) an object version and return its record.
    pub fn put_object(
        &self,
        bucket: &str,
        name: &str,
        generation: i64,
        data: Vec<u8>,
    ) -> ObjectRecord {
        let record = ObjectRecord {
            name: name.to_owned(),
            generation,
            size: data.len() as u64,
        };
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_owned(), name.to_owned()), StoredObject { data, generation });
        record
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of ranged reads issued so far.
    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }
}

impl ObjectStore for MockStore {
    fn read_range(
        &self,
        bucket: &Bucket,
        object: &str,
        generation: i64,
        offset: u64,
        len: u64,
    ) -> impl Future<Output = Result<Bytes, StoreError>> + Send {
        let bucket_name = bucket.name.clone();
        let object = object.to_owned();
        async move {
            self.read_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|e| StoreError::Io(Box::new(e)))?;
                permit.forget();
            }
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Io("injected read failure".into()));
            }

            let objects = self.objects.lock().unwrap();
            let Some(stored) = objects.get(&(bucket_name, object.clone())) else {
                return Err(StoreError::NotFound(object));
            };
            if stored.generation != generation {
                return Err(StoreError::GenerationChanged {
                    object,
                    requested: generation,
                });
            }
            let start = (offset as usize).min(stored.data.len());
            let end = ((offset.saturating_add(len)) as usize).min(stored.data.len());
            Ok(Bytes::copy_from_slice(&stored.data[start..end]))
        }
    }
}

pub fn bucket(name: &str) -> Bucket {
    Bucket {
        name: name.to_owned(),
        created_secs: 1_700_000_000,
    }
}

/// Config pointing at `dir`, unbounded budget, 1 MiB chunks.
pub fn cache_config(dir: &Path) -> FileCacheConfig {
    FileCacheConfig {
        cache_dir: dir.to_path_buf(),
        download_chunk_size_mb: 1,
        ..FileCacheConfig::default()
    }
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
