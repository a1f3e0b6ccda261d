//! Persistent cache storage for the clcache compiler cache.
//!
//! This crate owns everything under the cache directory: the sharded
//! content-addressed object store, the per-source manifest store, the
//! statistics record, the cross-process lock manager, and the eviction
//! logic. All reads are fail-safe: corruption results in cache misses,
//! never in build failures.

#![warn(missing_docs)]

mod clean;
mod error;
mod locks;
mod manifest;
mod memo;
mod objects;
mod stats;

pub use clean::{clean_cache, clear_cache};
pub use error::CacheError;
pub use locks::{LockGuard, LockManager};
pub use manifest::{Manifest, ManifestEntry, ManifestStore, MAX_MANIFEST_ENTRIES};
pub use memo::{memoizer_from_config, HashMemoizer, LocalMemoizer};
pub use objects::{
    backend_from_config, ensure_mode, reset_mode, CachedArtifacts, EntryMeta, ObjectBackend,
    ObjectStore, StoredEntry,
};
pub use stats::{Statistics, StatsStore};
