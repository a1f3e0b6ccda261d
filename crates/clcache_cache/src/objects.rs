//! The content-addressed object store.
//!
//! Each cache key owns a directory `objects/<aa>/<rest>/` holding the
//! object file (optionally zlib-compressed), the captured compiler streams,
//! the exit code, and a JSON meta record. Entries are written to a sibling
//! temp directory and renamed into place, so readers observe either the
//! prior entry or the complete new one, never a partial write.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clcache_common::{Config, Digest};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;

const OBJECT_FILE: &str = "object";
const STDOUT_FILE: &str = "output.txt";
const STDERR_FILE: &str = "stderr.txt";
const EXIT_CODE_FILE: &str = "exit_code";
const META_FILE: &str = "meta";
const MODE_FILE: &str = "mode";

/// Per-entry metadata, stored as JSON in the entry directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Seconds since the Unix epoch the entry was created.
    pub created_epoch: u64,
    /// Seconds since the Unix epoch the entry was last replayed.
    pub last_used_epoch: u64,
    /// Size of the object file before compression.
    pub original_size: u64,
    /// Size of the object file as stored.
    pub stored_size: u64,
    /// Whether the object file is zlib-compressed.
    pub compressed: bool,
}

/// One enumerated entry, as seen by the cleaner.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    /// The entry directory.
    pub dir: PathBuf,
    /// The shard (first two hex characters of the key).
    pub shard: String,
    /// The entry's metadata.
    pub meta: EntryMeta,
}

/// A readable cache entry: metadata plus accessors for the stored files.
#[derive(Debug)]
pub struct CachedArtifacts {
    dir: PathBuf,
    /// The entry's metadata.
    pub meta: EntryMeta,
    hardlink: bool,
}

impl CachedArtifacts {
    /// Materializes the stored object at `dest`.
    ///
    /// Compressed objects are decompressed; uncompressed objects are
    /// hardlinked when enabled (falling back to a copy on any error) or
    /// copied.
    pub fn materialize(&self, dest: &Path) -> io::Result<()> {
        let object = self.dir.join(OBJECT_FILE);
        if self.meta.compressed {
            let mut decoder = ZlibDecoder::new(File::open(&object)?);
            let mut out = File::create(dest)?;
            io::copy(&mut decoder, &mut out)?;
            return Ok(());
        }
        if self.hardlink {
            match fs::hard_link(&object, dest) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(%err, "hardlink failed, copying instead");
                }
            }
        }
        fs::copy(&object, dest).map(|_| ())
    }

    /// The captured stdout of the original compile.
    pub fn stdout(&self) -> String {
        fs::read_to_string(self.dir.join(STDOUT_FILE)).unwrap_or_default()
    }

    /// The captured stderr of the original compile.
    pub fn stderr(&self) -> String {
        fs::read_to_string(self.dir.join(STDERR_FILE)).unwrap_or_default()
    }

    /// The captured exit code of the original compile.
    pub fn exit_code(&self) -> i32 {
        fs::read_to_string(self.dir.join(EXIT_CODE_FILE))
            .ok()
            .and_then(|text| text.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Capability interface over object storage.
///
/// The filesystem store below is the in-tree implementation; a remote
/// (memcached) adapter plugs in behind the same seam.
pub trait ObjectBackend {
    /// Returns `true` if an entry exists for the key.
    fn has(&self, key: Digest) -> bool;
    /// Opens the entry for the key, if present and readable.
    fn get(&self, key: Digest) -> Option<CachedArtifacts>;
    /// Stores an entry. The caller holds the shard lock.
    fn put(
        &self,
        key: Digest,
        object: &Path,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
    ) -> Result<EntryMeta, CacheError>;
    /// Bumps the entry's last-used stamp.
    fn touch(&self, key: Digest);
    /// Removes the entry, ignoring one that is already gone.
    fn remove(&self, key: Digest);
    /// Enumerates all entries. Tolerates concurrent removals.
    fn entries(&self) -> Vec<StoredEntry>;
    /// Removes every entry.
    fn clear(&self) -> Result<(), CacheError>;
}

/// The sharded filesystem object store at `<cache>/objects/`.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
    compress: bool,
    level: u32,
    hardlink: bool,
}

impl ObjectStore {
    /// Creates a store rooted at `<cache_dir>/objects` with the configured
    /// compression and materialization settings.
    pub fn new(cache_dir: &Path, config: &Config) -> Self {
        Self {
            root: cache_dir.join("objects"),
            compress: config.compress,
            level: config.compress_level,
            hardlink: config.hardlink,
        }
    }

    /// The directory owning the given key.
    pub fn entry_dir(&self, key: Digest) -> PathBuf {
        self.root.join(key.shard()).join(key.tail())
    }
}

impl ObjectBackend for ObjectStore {
    fn has(&self, key: Digest) -> bool {
        self.entry_dir(key).is_dir()
    }

    fn get(&self, key: Digest) -> Option<CachedArtifacts> {
        let dir = self.entry_dir(key);
        let meta = read_meta(&dir)?;
        if !dir.join(OBJECT_FILE).is_file() {
            return None;
        }
        Some(CachedArtifacts {
            dir,
            meta,
            hardlink: self.hardlink,
        })
    }

    fn put(
        &self,
        key: Digest,
        object: &Path,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
    ) -> Result<EntryMeta, CacheError> {
        let entry = self.entry_dir(key);
        let shard_dir = self.root.join(key.shard());
        fs::create_dir_all(&shard_dir).map_err(|e| CacheError::io(&shard_dir, e))?;

        // Stage the complete entry in a sibling directory first.
        let tmp = shard_dir.join(format!("{}.new", key.tail()));
        if tmp.exists() {
            let _ = fs::remove_dir_all(&tmp);
        }
        fs::create_dir_all(&tmp).map_err(|e| CacheError::io(&tmp, e))?;

        let result = self.stage_entry(&tmp, object, stdout, stderr, exit_code);
        let meta = match result {
            Ok(meta) => meta,
            Err(err) => {
                let _ = fs::remove_dir_all(&tmp);
                return Err(err);
            }
        };

        if entry.exists() {
            // A peer inserted the same key; identical inputs produce
            // identical outputs, so either copy is valid.
            let _ = fs::remove_dir_all(&entry);
        }
        if let Err(err) = fs::rename(&tmp, &entry) {
            let _ = fs::remove_dir_all(&tmp);
            if !entry.exists() {
                return Err(CacheError::io(&entry, err));
            }
        }
        debug!(key = %key, size = meta.stored_size, "stored object entry");
        Ok(meta)
    }

    fn touch(&self, key: Digest) {
        let dir = self.entry_dir(key);
        if let Some(mut meta) = read_meta(&dir) {
            meta.last_used_epoch = now_epoch();
            let _ = write_meta(&dir, &meta);
        }
    }

    fn remove(&self, key: Digest) {
        let _ = fs::remove_dir_all(self.entry_dir(key));
    }

    fn entries(&self) -> Vec<StoredEntry> {
        let mut found = Vec::new();
        let Ok(shards) = fs::read_dir(&self.root) else {
            return found;
        };
        for shard in shards.flatten() {
            let shard_name = shard.file_name().to_string_lossy().into_owned();
            let Ok(entries) = fs::read_dir(shard.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let dir = entry.path();
                if dir.extension().is_some_and(|ext| ext == "new") {
                    continue;
                }
                if let Some(meta) = read_meta(&dir) {
                    found.push(StoredEntry {
                        dir,
                        shard: shard_name.clone(),
                        meta,
                    });
                }
            }
        }
        found
    }

    fn clear(&self) -> Result<(), CacheError> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| CacheError::io(&self.root, e))?;
        }
        Ok(())
    }
}

impl ObjectStore {
    /// Writes all entry files into the staging directory, fsyncing each.
    fn stage_entry(
        &self,
        tmp: &Path,
        object: &Path,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
    ) -> Result<EntryMeta, CacheError> {
        let original_size = fs::metadata(object)
            .map_err(|e| CacheError::io(object, e))?
            .len();

        let stored = tmp.join(OBJECT_FILE);
        let mut src = File::open(object).map_err(|e| CacheError::io(object, e))?;
        if self.compress {
            let dest = File::create(&stored).map_err(|e| CacheError::io(&stored, e))?;
            let mut encoder = ZlibEncoder::new(dest, Compression::new(self.level));
            io::copy(&mut src, &mut encoder).map_err(|e| CacheError::io(&stored, e))?;
            let dest = encoder.finish().map_err(|e| CacheError::io(&stored, e))?;
            dest.sync_all().map_err(|e| CacheError::io(&stored, e))?;
        } else {
            let mut dest = File::create(&stored).map_err(|e| CacheError::io(&stored, e))?;
            io::copy(&mut src, &mut dest).map_err(|e| CacheError::io(&stored, e))?;
            dest.sync_all().map_err(|e| CacheError::io(&stored, e))?;
        }
        let stored_size = fs::metadata(&stored)
            .map_err(|e| CacheError::io(&stored, e))?
            .len();

        write_synced(&tmp.join(STDOUT_FILE), stdout.as_bytes())?;
        write_synced(&tmp.join(STDERR_FILE), stderr.as_bytes())?;
        write_synced(&tmp.join(EXIT_CODE_FILE), exit_code.to_string().as_bytes())?;

        let meta = EntryMeta {
            created_epoch: now_epoch(),
            last_used_epoch: now_epoch(),
            original_size,
            stored_size,
            compressed: self.compress,
        };
        write_meta(tmp, &meta)?;
        Ok(meta)
    }
}

/// Checks the compression sentinel, creating it on first use.
///
/// A cache populated without compression must never be mixed with
/// compressed entries, so a mismatch refuses the write path entirely.
pub fn ensure_mode(cache_dir: &Path, compress: bool) -> Result<(), CacheError> {
    let path = cache_dir.join(MODE_FILE);
    match fs::read_to_string(&path) {
        Ok(text) => {
            let cache_compressed = text.trim() == "compressed";
            if cache_compressed != compress {
                return Err(CacheError::ModeMismatch {
                    cache_dir: cache_dir.to_path_buf(),
                    cache_compressed,
                    requested_compressed: compress,
                });
            }
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(cache_dir).map_err(|e| CacheError::io(cache_dir, e))?;
            let text = if compress { "compressed" } else { "uncompressed" };
            fs::write(&path, text).map_err(|e| CacheError::io(&path, e))
        }
        Err(err) => Err(CacheError::io(&path, err)),
    }
}

/// Removes the compression sentinel; the next invocation re-creates it.
pub fn reset_mode(cache_dir: &Path) {
    let _ = fs::remove_file(cache_dir.join(MODE_FILE));
}

/// Selects the object backend for this configuration.
///
/// The remote (memcached) adapter is an external integration; when it is
/// requested but not wired in, the filesystem store is used and a warning
/// is logged.
pub fn backend_from_config(cache_dir: &Path, config: &Config) -> Box<dyn ObjectBackend> {
    if let Some(endpoint) = &config.memcached {
        warn!(%endpoint, "remote object backend not available, using filesystem store");
    }
    Box::new(ObjectStore::new(cache_dir, config))
}

fn read_meta(dir: &Path) -> Option<EntryMeta> {
    let text = fs::read_to_string(dir.join(META_FILE)).ok()?;
    serde_json::from_str(&text).ok()
}

fn write_meta(dir: &Path, meta: &EntryMeta) -> Result<(), CacheError> {
    let json = serde_json::to_string(meta).map_err(|e| CacheError::Serialization {
        reason: e.to_string(),
    })?;
    write_synced(&dir.join(META_FILE), json.as_bytes())
}

fn write_synced(path: &Path, data: &[u8]) -> Result<(), CacheError> {
    let mut file = File::create(path).map_err(|e| CacheError::io(path, e))?;
    io::Write::write_all(&mut file, data).map_err(|e| CacheError::io(path, e))?;
    file.sync_all().map_err(|e| CacheError::io(path, e))
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(compress: bool, hardlink: bool) -> Config {
        Config::from_lookup(|name| match name {
            "CLCACHE_COMPRESS" if compress => Some("1".to_string()),
            "CLCACHE_HARDLINK" if hardlink => Some("1".to_string()),
            _ => None,
        })
    }

    fn store_with(dir: &Path, compress: bool) -> ObjectStore {
        ObjectStore::new(dir, &config(compress, false))
    }

    fn write_object(dir: &Path, bytes: &[u8]) -> PathBuf {
        let path = dir.join("compiled.obj");
        fs::write(&path, bytes).unwrap();
        path
    }

    fn key(tag: &str) -> Digest {
        Digest::from_bytes(tag.as_bytes())
    }

    #[test]
    fn put_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), false);
        let obj = write_object(dir.path(), b"OBJECT BYTES");

        let meta = store
            .put(key("k"), &obj, "compiled a.c\n", "warn\n", 0)
            .unwrap();
        assert_eq!(meta.original_size, 12);
        assert_eq!(meta.stored_size, 12);
        assert!(!meta.compressed);

        let entry = store.get(key("k")).unwrap();
        assert_eq!(entry.stdout(), "compiled a.c\n");
        assert_eq!(entry.stderr(), "warn\n");
        assert_eq!(entry.exit_code(), 0);

        let dest = dir.path().join("out.obj");
        entry.materialize(&dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"OBJECT BYTES");
    }

    #[test]
    fn compressed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), true);
        let payload = vec![b'x'; 64 * 1024];
        let obj = write_object(dir.path(), &payload);

        let meta = store.put(key("k"), &obj, "", "", 0).unwrap();
        assert!(meta.compressed);
        assert_eq!(meta.original_size, payload.len() as u64);
        assert!(meta.stored_size < meta.original_size);

        let dest = dir.path().join("out.obj");
        store.get(key("k")).unwrap().materialize(&dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), payload);
    }

    #[test]
    fn get_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), false);
        assert!(store.get(key("missing")).is_none());
        assert!(!store.has(key("missing")));
    }

    #[test]
    fn get_entry_with_corrupt_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), false);
        let obj = write_object(dir.path(), b"data");
        store.put(key("k"), &obj, "", "", 0).unwrap();

        fs::write(store.entry_dir(key("k")).join(META_FILE), "junk").unwrap();
        assert!(store.get(key("k")).is_none());
    }

    #[test]
    fn get_entry_missing_object_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), false);
        let obj = write_object(dir.path(), b"data");
        store.put(key("k"), &obj, "", "", 0).unwrap();

        fs::remove_file(store.entry_dir(key("k")).join(OBJECT_FILE)).unwrap();
        assert!(store.get(key("k")).is_none());
    }

    #[test]
    fn touch_bumps_last_used() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), false);
        let obj = write_object(dir.path(), b"data");
        store.put(key("k"), &obj, "", "", 0).unwrap();

        // Backdate the entry, then touch it.
        let entry_dir = store.entry_dir(key("k"));
        let mut meta = read_meta(&entry_dir).unwrap();
        meta.last_used_epoch = 1;
        write_meta(&entry_dir, &meta).unwrap();

        store.touch(key("k"));
        assert!(read_meta(&entry_dir).unwrap().last_used_epoch > 1);
    }

    #[test]
    fn put_twice_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), false);
        let first = write_object(dir.path(), b"first");
        store.put(key("k"), &first, "one", "", 0).unwrap();

        let second = dir.path().join("second.obj");
        fs::write(&second, b"second").unwrap();
        store.put(key("k"), &second, "two", "", 0).unwrap();

        let entry = store.get(key("k")).unwrap();
        assert_eq!(entry.stdout(), "two");
        let dest = dir.path().join("out.obj");
        entry.materialize(&dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"second");
    }

    #[test]
    fn entries_enumeration_skips_staging_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), false);
        let obj = write_object(dir.path(), b"data");
        store.put(key("a"), &obj, "", "", 0).unwrap();
        store.put(key("b"), &obj, "", "", 0).unwrap();

        // A leftover staging directory must not be listed.
        let leftover = store.entry_dir(key("a"));
        let staging = leftover
            .parent()
            .unwrap()
            .join(format!("{}.new", key("a").tail()));
        fs::create_dir_all(&staging).unwrap();

        let entries = store.entries();
        assert_eq!(entries.len(), 2);
        for entry in &entries {
            assert_eq!(entry.shard.len(), 2);
            assert_eq!(entry.meta.original_size, 4);
        }
    }

    #[test]
    fn remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), false);
        let obj = write_object(dir.path(), b"data");
        store.put(key("a"), &obj, "", "", 0).unwrap();
        store.put(key("b"), &obj, "", "", 0).unwrap();

        store.remove(key("a"));
        assert!(!store.has(key("a")));
        assert!(store.has(key("b")));
        // Removing again is harmless.
        store.remove(key("a"));

        store.clear().unwrap();
        assert!(store.entries().is_empty());
    }

    #[test]
    fn hardlink_materialization_shares_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path(), &config(false, true));
        let obj = write_object(dir.path(), b"linked bytes");
        store.put(key("k"), &obj, "", "", 0).unwrap();

        let dest = dir.path().join("out.obj");
        store.get(key("k")).unwrap().materialize(&dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"linked bytes");
    }

    #[test]
    fn nonzero_exit_code_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), false);
        let obj = write_object(dir.path(), b"data");
        store.put(key("k"), &obj, "", "oops", 2).unwrap();
        assert_eq!(store.get(key("k")).unwrap().exit_code(), 2);
    }

    #[test]
    fn mode_sentinel_lifecycle() {
        let dir = tempfile::tempdir().unwrap();

        // First use records the setting.
        ensure_mode(dir.path(), false).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(MODE_FILE)).unwrap(),
            "uncompressed"
        );

        // Same setting passes; the opposite is refused.
        ensure_mode(dir.path(), false).unwrap();
        let err = ensure_mode(dir.path(), true).unwrap_err();
        assert!(matches!(err, CacheError::ModeMismatch { .. }));

        // Resetting lets a new setting take over.
        reset_mode(dir.path());
        ensure_mode(dir.path(), true).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(MODE_FILE)).unwrap(),
            "compressed"
        );
    }

    #[test]
    fn backend_from_config_returns_filesystem_store() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::from_lookup(|name| {
            (name == "CLCACHE_MEMCACHED").then(|| "localhost:11211".to_string())
        });
        let backend = backend_from_config(dir.path(), &cfg);
        assert!(!backend.has(key("anything")));
    }
}
