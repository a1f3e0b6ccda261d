//! Header-hash memoization.
//!
//! Direct-mode lookups hash every include file of a translation unit on
//! every invocation. The memoizer caches digests keyed by `(path,
//! modification time, size)` so unchanged headers are read once per
//! process. The external hash-server adapter plugs in behind the same
//! trait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use clcache_common::{hash_file, Config, Digest};
use tracing::warn;

/// Supplies content digests for include files.
pub trait HashMemoizer {
    /// Returns the content digest of the file at `path`.
    fn file_digest(&self, path: &Path) -> std::io::Result<Digest>;
}

/// In-process memoizer: caches digests by `(mtime, size)` per path.
#[derive(Debug, Default)]
pub struct LocalMemoizer {
    known: Mutex<HashMap<PathBuf, (SystemTime, u64, Digest)>>,
}

impl LocalMemoizer {
    /// Creates an empty memoizer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl HashMemoizer for LocalMemoizer {
    fn file_digest(&self, path: &Path) -> std::io::Result<Digest> {
        let meta = std::fs::metadata(path)?;
        let mtime = meta.modified()?;
        let size = meta.len();

        if let Some((cached_mtime, cached_size, digest)) =
            self.known.lock().expect("memoizer lock").get(path)
        {
            if *cached_mtime == mtime && *cached_size == size {
                return Ok(*digest);
            }
        }

        let digest = hash_file(path)?;
        self.known
            .lock()
            .expect("memoizer lock")
            .insert(path.to_path_buf(), (mtime, size, digest));
        Ok(digest)
    }
}

/// Selects the memoizer for this configuration.
///
/// The external hash server is an out-of-process integration; when it is
/// requested but not wired in, the local memoizer is used and a warning
/// is logged.
pub fn memoizer_from_config(config: &Config) -> Box<dyn HashMemoizer> {
    if config.server {
        warn!("external hash server not available, using in-process memoizer");
    }
    Box::new(LocalMemoizer::new())
}
