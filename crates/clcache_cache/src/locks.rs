//! Named cross-process locks over advisory file locks.
//!
//! Three tiers protect shared cache state: one lock per object shard
//! (256 by first-two-hex-char), one lock per manifest hash, and a single
//! global statistics lock. Acquisition polls with a bounded timeout;
//! guards release on drop, and the OS releases advisory locks with the
//! file handle on any process exit, panics included.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clcache_common::Digest;
use fs2::FileExt;
use tracing::debug;

use crate::error::CacheError;

/// Poll interval while waiting for a contended lock.
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Creates and hands out named locks under `<cache>/locks/`.
#[derive(Debug, Clone)]
pub struct LockManager {
    locks_dir: PathBuf,
    timeout: Duration,
}

/// An acquired lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl LockManager {
    /// Creates a lock manager rooted at the given cache directory.
    pub fn new(cache_dir: &Path, timeout_ms: u64) -> Self {
        Self {
            locks_dir: cache_dir.join("locks"),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Acquires the global statistics lock.
    pub fn stats(&self) -> Result<LockGuard, CacheError> {
        self.acquire("stats")
    }

    /// Acquires the lock for one object shard (first two hex characters).
    pub fn object_shard(&self, shard: &str) -> Result<LockGuard, CacheError> {
        self.acquire(&format!("objects-{shard}"))
    }

    /// Acquires the lock for one manifest.
    pub fn manifest(&self, hash: Digest) -> Result<LockGuard, CacheError> {
        self.acquire(&format!("manifest-{hash}"))
    }

    fn acquire(&self, name: &str) -> Result<LockGuard, CacheError> {
        std::fs::create_dir_all(&self.locks_dir)
            .map_err(|e| CacheError::io(&self.locks_dir, e))?;

        let path = self.locks_dir.join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CacheError::io(&path, e))?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= self.timeout {
                        debug!(lock = name, "lock acquisition timed out");
                        return Err(CacheError::LockTimeout {
                            name: name.to_string(),
                            timeout_ms: self.timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(err) => return Err(CacheError::io(&path, err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> LockManager {
        LockManager::new(dir, 100)
    }

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let guard = locks.stats().unwrap();
        drop(guard);
        // Released lock can be taken again.
        let _guard = locks.stats().unwrap();
    }

    #[test]
    fn different_names_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let _a = locks.object_shard("aa").unwrap();
        let _b = locks.object_shard("bb").unwrap();
        let _c = locks.manifest(Digest::from_bytes(b"m")).unwrap();
        let _d = locks.stats().unwrap();
    }

    #[test]
    fn contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let _held = locks.stats().unwrap();

        // A second handle in another thread must time out while the first
        // guard is alive.
        let locks2 = manager(dir.path());
        let result = std::thread::spawn(move || locks2.stats()).join().unwrap();
        let err = result.unwrap_err();
        assert!(err.is_lock_timeout());
    }

    #[test]
    fn lock_files_live_under_locks_dir() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());
        let _guard = locks.object_shard("1f").unwrap();
        assert!(dir.path().join("locks").join("objects-1f.lock").exists());
    }
}
