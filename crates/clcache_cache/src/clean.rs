//! Cache eviction and clearing.
//!
//! Eviction removes least-recently-used object entries until the cache is
//! at or below 90% of its configured maximum, taking only per-shard locks
//! so concurrent builds keep running. Clearing removes all entries and
//! manifests while preserving the hit/miss counters.

use tracing::{debug, info};

use crate::error::CacheError;
use crate::locks::LockManager;
use crate::manifest::ManifestStore;
use crate::objects::{reset_mode, ObjectBackend};
use crate::stats::StatsStore;

/// Eviction stops once the cache shrinks to this fraction of the maximum,
/// so back-to-back builds do not re-trigger cleaning immediately.
const CLEAN_TARGET_FRACTION: f64 = 0.9;

/// Evicts least-recently-used entries until `CacheSize` is at or below
/// 90% of `MaxCacheSize`, then rewrites the size bookkeeping from what is
/// actually on disk.
pub fn clean_cache(
    objects: &dyn ObjectBackend,
    stats: &StatsStore,
    locks: &LockManager,
) -> Result<(), CacheError> {
    let max_size = stats.read().max_cache_size;
    let target = (max_size as f64 * CLEAN_TARGET_FRACTION) as u64;

    let mut entries = objects.entries();
    entries.sort_by_key(|e| e.meta.last_used_epoch);

    let mut remaining: u64 = entries.iter().map(|e| e.meta.stored_size).sum();
    let mut remaining_count = entries.len() as u64;
    let mut removed = 0usize;

    for entry in &entries {
        if remaining <= target {
            break;
        }
        // Entries can disappear mid-scan when a peer cleans concurrently;
        // removal of an absent directory is a no-op.
        let _shard_guard = locks.object_shard(&entry.shard)?;
        let _ = std::fs::remove_dir_all(&entry.dir);
        remaining = remaining.saturating_sub(entry.meta.stored_size);
        remaining_count -= 1;
        removed += 1;
        debug!(dir = %entry.dir.display(), "evicted cache entry");
    }

    stats.update(locks, |s| {
        s.cache_size = remaining;
        s.cache_entries = remaining_count;
    })?;

    info!(removed, remaining_bytes = remaining, "cache cleaned");
    Ok(())
}

/// Removes all object entries and manifests, resets the compression
/// sentinel, and zeroes the contents bookkeeping. Hit/miss counters are
/// preserved.
pub fn clear_cache(
    cache_dir: &std::path::Path,
    objects: &dyn ObjectBackend,
    manifests: &ManifestStore,
    stats: &StatsStore,
    locks: &LockManager,
) -> Result<(), CacheError> {
    objects.clear()?;
    manifests.clear()?;
    reset_mode(cache_dir);
    stats.update(locks, |s| {
        s.cache_size = 0;
        s.cache_entries = 0;
    })?;
    info!("cache cleared");
    Ok(())
}
