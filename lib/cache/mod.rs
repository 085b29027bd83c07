/// Asynchronous download jobs and their registry.
pub mod download;
/// File-backed cache coordinator.
pub mod fcache;
/// Cache key and per-object cache record.
pub mod file_info;
/// Per-read cache handle.
pub mod handle;
/// Bounded, byte-budgeted LRU index.
pub mod lru;
