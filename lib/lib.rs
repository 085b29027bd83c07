//! blob-fs shared library.
//!
//! Core of a cloud-object-storage-backed filesystem: a bounded on-disk cache
//! of immutable object contents, the download machinery that fills it, and
//! the per-read handles that serve it. The mount layer, CLI, and object-store
//! client live elsewhere and consume this crate through its public contracts.

/// Caching primitives for blob-fs.
pub mod cache;
/// File-cache configuration.
pub mod config;
pub mod io;
/// Remote object-store contract.
pub mod store;
