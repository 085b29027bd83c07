//! Cache key and per-object cache record.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cache::lru::Weighted;
use crate::store::Bucket;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("bucket name must not be empty")]
    EmptyBucketName,

    #[error("object name must not be empty")]
    EmptyObjectName,
}

/// Identity of one cached object.
///
/// The rendered form `bucket_name || decimal(created_secs) || object_name`
/// keys the LRU index and the job registry; the bucket creation time keeps
/// entries of a deleted-and-re-created bucket apart from its predecessor's.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    bucket_name: String,
    bucket_created_secs: i64,
    object_name: String,
    rendered: String,
}

impl CacheKey {
    pub fn new(bucket: &Bucket, object_name: &str) -> Result<Self, KeyError> {
        if bucket.name.is_empty() {
            return Err(KeyError::EmptyBucketName);
        }
        if object_name.is_empty() {
            return Err(KeyError::EmptyObjectName);
        }
        Ok(Self {
            bucket_name: bucket.name.clone(),
            bucket_created_secs: bucket.created_secs,
            object_name: object_name.to_owned(),
            rendered: Self::render(bucket, object_name),
        })
    }

    /// The rendered key for every object of `bucket` whose name starts with
    /// `object_prefix`. Used to drop a whole directory's worth of entries.
    pub fn prefix(bucket: &Bucket, object_prefix: &str) -> Result<String, KeyError> {
        if bucket.name.is_empty() {
            return Err(KeyError::EmptyBucketName);
        }
        Ok(Self::render(bucket, object_prefix))
    }

    fn render(bucket: &Bucket, object_name: &str) -> String {
        format!("{}{}{}", bucket.name, bucket.created_secs, object_name)
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Path of the local cache file under `root`.
    pub fn local_path(&self, root: &Path) -> PathBuf {
        root.join(&self.bucket_name).join(&self.object_name)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Cache record for one object version.
///
/// `offset` is the number of bytes contiguously present at the head of the
/// local cache file; `0 <= offset <= file_size` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub key: CacheKey,
    pub generation: i64,
    pub offset: u64,
    pub file_size: u64,
}

impl Weighted for FileInfo {
    // Budget accounting uses the full object size, not the downloaded byte
    // count: a partially downloaded entry reserves its eventual footprint.
    fn size(&self) -> u64 {
        self.file_size
    }
}
