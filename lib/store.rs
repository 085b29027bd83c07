//! Contract for the remote object-store client.
//!
//! The store serves ranged reads of immutable `(bucket, object, generation)`
//! tuples. A generation identifies one immutable version of an object; the
//! integer is opaque and not monotonic across versions.

use std::future::Future;

use bytes::Bytes;
use thiserror::Error;

/// A bucket in the remote store.
///
/// `created_secs` (unix seconds) disambiguates buckets that were deleted and
/// re-created under the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub name: String,
    pub created_secs: i64,
}

/// Metadata snapshot of one object version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub name: String,
    pub generation: i64,
    pub size: u64,
}

/// Errors surfaced by the object-store client.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist (or no longer exists) in the store.
    #[error("object not found: {0}")]
    NotFound(String),

    /// A ranged read observed a version newer than the requested generation.
    #[error("object {object} no longer has generation {requested}")]
    GenerationChanged { object: String, requested: i64 },

    /// Transport or server-side failure.
    #[error("object store error: {0}")]
    Io(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Client for ranged reads against the remote store.
pub trait ObjectStore: Send + Sync + 'static {
    /// Read up to `len` bytes of `object` at `offset`, pinned to `generation`.
    ///
    /// Returns [`StoreError::GenerationChanged`] if the store observes a newer
    /// version of the object mid-stream. May return fewer bytes than `len`;
    /// an empty buffer before the object end is a protocol violation the
    /// caller treats as an error.
    fn read_range(
        &self,
        bucket: &Bucket,
        object: &str,
        generation: i64,
        offset: u64,
        len: u64,
    ) -> impl Future<Output = Result<Bytes, StoreError>> + Send;
}
