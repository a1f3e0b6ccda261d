//! The persistent statistics record.
//!
//! A single JSON record at `<cache>/stats` holds all counters plus the
//! configured maximum cache size. Updates are read-modify-write under the
//! global statistics lock; reads for display take no lock.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::locks::LockManager;

/// Default maximum cache size: 40 GiB.
const DEFAULT_MAX_CACHE_SIZE: u64 = 40 * 1024 * 1024 * 1024;

/// All cache counters and the size limit, persisted as one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Statistics {
    /// Every invocation that reached the driver.
    pub calls_total: u64,
    /// Passthroughs for `/E`, `/EP`, `/P`.
    pub calls_for_preprocessing: u64,
    /// Passthroughs with no source file on the command line.
    pub calls_without_source_file: u64,
    /// Passthroughs for link invocations.
    pub calls_for_linking: u64,
    /// Passthroughs for `/Zi`.
    pub calls_for_external_debug_info: u64,
    /// Invocations split into per-source child jobs.
    pub calls_for_multiple_sources: u64,
    /// Passthroughs for precompiled headers and malformed arguments.
    pub calls_unsupported: u64,
    /// Cache bypasses caused by lock-acquisition timeouts.
    pub lock_timeouts: u64,
    /// Replays from the cache.
    pub cache_hits: u64,
    /// Compiles that went to the real compiler on a cacheable invocation.
    pub cache_misses: u64,
    /// Misses where the manifest matched but the object had been evicted.
    pub evicted_misses: u64,
    /// Misses caused by changed header contents.
    pub header_changed_misses: u64,
    /// Misses with no manifest for the source at all.
    pub source_changed_misses: u64,
    /// Number of object entries currently stored.
    pub cache_entries: u64,
    /// Total stored object bytes.
    pub cache_size: u64,
    /// Configured maximum cache size in bytes.
    pub max_cache_size: u64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            calls_total: 0,
            calls_for_preprocessing: 0,
            calls_without_source_file: 0,
            calls_for_linking: 0,
            calls_for_external_debug_info: 0,
            calls_for_multiple_sources: 0,
            calls_unsupported: 0,
            lock_timeouts: 0,
            cache_hits: 0,
            cache_misses: 0,
            evicted_misses: 0,
            header_changed_misses: 0,
            source_changed_misses: 0,
            cache_entries: 0,
            cache_size: 0,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
        }
    }
}

impl Statistics {
    /// Zeroes all counters, preserving cache contents bookkeeping
    /// (`CacheEntries`, `CacheSize`) and `MaxCacheSize`.
    pub fn reset_counters(&mut self) {
        let keep = (self.cache_entries, self.cache_size, self.max_cache_size);
        *self = Self::default();
        (self.cache_entries, self.cache_size, self.max_cache_size) = keep;
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let accesses = self.cache_hits + self.cache_misses;
        let pct = |n: u64| {
            if accesses == 0 {
                0.0
            } else {
                100.0 * n as f64 / accesses as f64
            }
        };
        writeln!(f, "clcache statistics:")?;
        writeln!(f, "  cache size                   : {} bytes", self.cache_size)?;
        writeln!(f, "  maximum cache size           : {} bytes", self.max_cache_size)?;
        writeln!(f, "  cache entries                : {}", self.cache_entries)?;
        writeln!(
            f,
            "  cache hits                   : {} ({:.0}%)",
            self.cache_hits,
            pct(self.cache_hits)
        )?;
        writeln!(f, "  cache misses")?;
        writeln!(
            f,
            "    total                      : {} ({:.0}%)",
            self.cache_misses,
            pct(self.cache_misses)
        )?;
        writeln!(f, "    evicted                    : {}", self.evicted_misses)?;
        writeln!(f, "    header changed             : {}", self.header_changed_misses)?;
        writeln!(f, "    source changed             : {}", self.source_changed_misses)?;
        writeln!(f, "  passed to real compiler")?;
        writeln!(f, "    calls (total)              : {}", self.calls_total)?;
        writeln!(f, "    called for preprocessing   : {}", self.calls_for_preprocessing)?;
        writeln!(f, "    called for linking         : {}", self.calls_for_linking)?;
        writeln!(f, "    called for external debug  : {}", self.calls_for_external_debug_info)?;
        writeln!(f, "    called w/o source          : {}", self.calls_without_source_file)?;
        writeln!(f, "    called w/ multiple sources : {}", self.calls_for_multiple_sources)?;
        writeln!(f, "    called unsupported         : {}", self.calls_unsupported)?;
        write!(f, "    lock timeouts              : {}", self.lock_timeouts)
    }
}

/// Reads and atomically rewrites the statistics record.
#[derive(Debug, Clone)]
pub struct StatsStore {
    path: PathBuf,
}

impl StatsStore {
    /// Creates a store for `<cache_dir>/stats`.
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join("stats"),
        }
    }

    /// Reads the current record. Missing or corrupt records read as the
    /// default — the statistics file is never a reason to fail a build.
    pub fn read(&self) -> Statistics {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    /// Applies `mutate` to the record under the statistics lock and
    /// persists the result atomically.
    pub fn update<T>(
        &self,
        locks: &LockManager,
        mutate: impl FnOnce(&mut Statistics) -> T,
    ) -> Result<T, CacheError> {
        let _guard = locks.stats()?;
        let mut stats = self.read();
        let result = mutate(&mut stats);
        self.write(&stats)?;
        Ok(result)
    }

    fn write(&self, stats: &Statistics) -> Result<(), CacheError> {
        let parent = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        std::fs::create_dir_all(&parent).map_err(|e| CacheError::io(&parent, e))?;

        let json = serde_json::to_string_pretty(stats).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| CacheError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| CacheError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, StatsStore, LockManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::new(dir.path());
        let locks = LockManager::new(dir.path(), 1_000);
        (dir, store, locks)
    }

    #[test]
    fn missing_record_reads_as_default() {
        let (_dir, store, _locks) = fixture();
        let stats = store.read();
        assert_eq!(stats, Statistics::default());
        assert_eq!(stats.max_cache_size, DEFAULT_MAX_CACHE_SIZE);
    }

    #[test]
    fn corrupt_record_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stats"), "{{{ not json").unwrap();
        let store = StatsStore::new(dir.path());
        assert_eq!(store.read(), Statistics::default());
    }

    #[test]
    fn update_persists() {
        let (_dir, store, locks) = fixture();
        store
            .update(&locks, |s| {
                s.cache_hits += 1;
                s.calls_total += 1;
            })
            .unwrap();

        let stats = store.read();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.calls_total, 1);
    }

    #[test]
    fn update_returns_closure_value() {
        let (_dir, store, locks) = fixture();
        let over = store
            .update(&locks, |s| {
                s.cache_size = 100;
                s.cache_size > s.max_cache_size
            })
            .unwrap();
        assert!(!over);
    }

    #[test]
    fn reset_preserves_contents_and_limit() {
        let mut stats = Statistics {
            cache_hits: 7,
            cache_misses: 3,
            lock_timeouts: 1,
            cache_entries: 10,
            cache_size: 4096,
            max_cache_size: 1234,
            ..Statistics::default()
        };
        stats.reset_counters();

        assert_eq!(stats.cache_hits, 0);
        assert_eq!(stats.cache_misses, 0);
        assert_eq!(stats.lock_timeouts, 0);
        assert_eq!(stats.cache_entries, 10);
        assert_eq!(stats.cache_size, 4096);
        assert_eq!(stats.max_cache_size, 1234);
    }

    #[test]
    fn serializes_with_pascal_case_counter_names() {
        let json = serde_json::to_string(&Statistics::default()).unwrap();
        for name in [
            "CallsTotal",
            "CallsForPreprocessing",
            "CallsWithoutSourceFile",
            "CallsForLinking",
            "CallsForExternalDebugInfo",
            "CallsForMultipleSources",
            "CacheHits",
            "CacheMisses",
            "EvictedMisses",
            "HeaderChangedMisses",
            "SourceChangedMisses",
            "CacheEntries",
            "CacheSize",
            "MaxCacheSize",
        ] {
            assert!(json.contains(name), "missing {name} in {json}");
        }
    }

    #[test]
    fn partial_record_fills_defaults() {
        let stats: Statistics = serde_json::from_str(r#"{"CacheHits": 5}"#).unwrap();
        assert_eq!(stats.cache_hits, 5);
        assert_eq!(stats.max_cache_size, DEFAULT_MAX_CACHE_SIZE);
    }

    #[test]
    fn display_table_mentions_all_sections() {
        let text = Statistics::default().to_string();
        assert!(text.contains("clcache statistics"));
        assert!(text.contains("cache hits"));
        assert!(text.contains("cache misses"));
        assert!(text.contains("passed to real compiler"));
    }

    #[test]
    fn concurrent_updates_do_not_lose_increments() {
        let dir = tempfile::tempdir().unwrap();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = dir.path().to_path_buf();
            handles.push(std::thread::spawn(move || {
                let store = StatsStore::new(&path);
                let locks = LockManager::new(&path, 5_000);
                for _ in 0..10 {
                    store.update(&locks, |s| s.calls_total += 1).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let store = StatsStore::new(dir.path());
        assert_eq!(store.read().calls_total, 40);
    }
}
