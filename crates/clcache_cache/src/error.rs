//! Error types for cache storage operations.

use std::path::PathBuf;

/// Errors that can occur while reading or writing cache state.
///
/// Most callers treat these as cache misses; the only variant that aborts
/// an invocation is [`CacheError::ModeMismatch`], which signals a
/// misconfigured cache that must not be written to.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred on a cache file.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A record could not be serialized or deserialized.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the failure.
        reason: String,
    },

    /// A named lock could not be acquired within the configured timeout.
    #[error("failed to acquire lock '{name}' within {timeout_ms} ms")]
    LockTimeout {
        /// The lock name.
        name: String,
        /// The configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The cache was created with a different compression setting.
    #[error(
        "cache at {cache_dir} was created with compression {}, \
         but this invocation requests compression {}; \
         clear the cache (-C) or adjust CLCACHE_COMPRESS",
        if *cache_compressed { "on" } else { "off" },
        if *requested_compressed { "on" } else { "off" }
    )]
    ModeMismatch {
        /// The cache root directory.
        cache_dir: PathBuf,
        /// The compression setting recorded in the sentinel.
        cache_compressed: bool,
        /// The compression setting of the current invocation.
        requested_compressed: bool,
    },
}

impl CacheError {
    /// Convenience constructor for I/O errors.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` for lock-acquisition timeouts.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}
