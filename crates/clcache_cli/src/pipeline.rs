//! Shared cache context for the driver and maintenance commands.

use std::path::PathBuf;

use clcache_cache::{
    backend_from_config, memoizer_from_config, CacheError, HashMemoizer, LockManager,
    ManifestStore, ObjectBackend, StatsStore,
};
use clcache_cl::PathNormalizer;
use clcache_common::Config;

/// All cache stores, opened once per invocation from the configuration.
pub struct CacheContext {
    /// The cache root directory.
    pub cache_dir: PathBuf,
    /// The object backend (filesystem store by default).
    pub objects: Box<dyn ObjectBackend>,
    /// The per-source manifest store.
    pub manifests: ManifestStore,
    /// The statistics record.
    pub stats: StatsStore,
    /// The named lock manager.
    pub locks: LockManager,
    /// Include-hash memoizer.
    pub memoizer: Box<dyn HashMemoizer>,
    /// Base/build directory relativization.
    pub paths: PathNormalizer,
}

impl CacheContext {
    /// Opens the cache, creating its root directory on first use.
    pub fn open(config: &Config) -> Result<Self, CacheError> {
        let cache_dir = config.cache_dir.clone();
        std::fs::create_dir_all(&cache_dir).map_err(|e| CacheError::io(&cache_dir, e))?;

        Ok(Self {
            objects: backend_from_config(&cache_dir, config),
            manifests: ManifestStore::new(&cache_dir),
            stats: StatsStore::new(&cache_dir),
            locks: LockManager::new(&cache_dir, config.lock_timeout_ms),
            memoizer: memoizer_from_config(config),
            paths: PathNormalizer::from_config(config),
            cache_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let cache_dir_str = cache_dir.display().to_string();
        let config = Config::from_lookup(|name| {
            (name == "CLCACHE_DIR").then(|| cache_dir_str.clone())
        });

        let ctx = CacheContext::open(&config).unwrap();
        assert!(cache_dir.is_dir());
        assert_eq!(ctx.cache_dir, cache_dir);
    }
}
