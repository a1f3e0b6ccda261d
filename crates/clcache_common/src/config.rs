//! Runtime configuration from `CLCACHE_*` environment variables.
//!
//! All environment-driven settings collapse into a single immutable [`Config`]
//! record, loaded once at startup. Invalid values fall back to defaults; the
//! cache never refuses to run because of a malformed environment variable.

use std::path::PathBuf;

/// Default zlib compression level when `CLCACHE_COMPRESSLEVEL` is unset.
const DEFAULT_COMPRESS_LEVEL: u32 = 6;

/// Default lock acquisition timeout in milliseconds.
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

/// Immutable snapshot of all clcache settings.
///
/// Derived entirely from the environment; nothing else in the codebase reads
/// environment variables after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the cache (`CLCACHE_DIR`, default `~/clcache`).
    pub cache_dir: PathBuf,

    /// Explicit real-compiler path or filename (`CLCACHE_CL`).
    pub compiler: Option<PathBuf>,

    /// Diagnostic logging to stderr (`CLCACHE_LOG`).
    pub log: bool,

    /// Caching disabled entirely (`CLCACHE_DISABLE`).
    pub disabled: bool,

    /// Hardlink objects into the build tree instead of copying
    /// (`CLCACHE_HARDLINK`).
    pub hardlink: bool,

    /// Compress stored objects (`CLCACHE_COMPRESS`).
    pub compress: bool,

    /// Zlib compression level 1-9 (`CLCACHE_COMPRESSLEVEL`, default 6).
    pub compress_level: u32,

    /// Force indirect (preprocessor) mode (`CLCACHE_NODIRECT`).
    pub no_direct: bool,

    /// Source-tree root for path relativization (`CLCACHE_BASEDIR`).
    pub base_dir: Option<PathBuf>,

    /// Build-tree root for path relativization (`CLCACHE_BUILDDIR`).
    pub build_dir: Option<PathBuf>,

    /// Lock timeout in milliseconds (`CLCACHE_OBJECT_CACHE_TIMEOUT_MS`).
    pub lock_timeout_ms: u64,

    /// External hash-memoization server enabled (`CLCACHE_SERVER`).
    pub server: bool,

    /// `host:port` of the remote object backend (`CLCACHE_MEMCACHED`).
    pub memcached: Option<String>,
}

impl Config {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    ///
    /// Lets tests supply settings without mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let cache_dir = lookup("CLCACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir(&lookup).join("clcache"));

        let compress_level = lookup("CLCACHE_COMPRESSLEVEL")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|lvl| (1..=9).contains(lvl))
            .unwrap_or(DEFAULT_COMPRESS_LEVEL);

        let lock_timeout_ms = lookup("CLCACHE_OBJECT_CACHE_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_LOCK_TIMEOUT_MS);

        Self {
            cache_dir,
            compiler: lookup("CLCACHE_CL").map(PathBuf::from),
            log: lookup("CLCACHE_LOG").is_some(),
            disabled: lookup("CLCACHE_DISABLE").is_some(),
            hardlink: lookup("CLCACHE_HARDLINK").is_some(),
            compress: lookup("CLCACHE_COMPRESS").is_some(),
            compress_level,
            no_direct: lookup("CLCACHE_NODIRECT").is_some(),
            base_dir: lookup("CLCACHE_BASEDIR").map(PathBuf::from),
            build_dir: lookup("CLCACHE_BUILDDIR").map(PathBuf::from),
            lock_timeout_ms,
            server: lookup("CLCACHE_SERVER").is_some(),
            memcached: lookup("CLCACHE_MEMCACHED"),
        }
    }
}

/// The user's home directory, for the default cache location.
fn home_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("USERPROFILE")
        .or_else(|| lookup("HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
