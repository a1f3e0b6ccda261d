//! The per-source manifest store for direct mode.
//!
//! A manifest groups cache entries for one `(source, normalized command
//! line)` pair. Each entry records the relativized include files the
//! compiler actually read, the fingerprint over their contents, and the
//! object key produced with that include set. Lookup re-hashes the current
//! contents of each entry's include list; a fingerprint match means the
//! stored object is valid.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clcache_common::Digest;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CacheError;

/// Maximum entries kept per manifest; the least recently used entry is
/// dropped on overflow.
pub const MAX_MANIFEST_ENTRIES: usize = 10;

/// One cached include-set variant of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Relativized paths of every header the compiler read.
    pub include_files: Vec<String>,
    /// Fingerprint over the source and include contents.
    pub fingerprint: Digest,
    /// Key of the object entry produced with this include set.
    pub object_key: Digest,
    /// Seconds since the Unix epoch this entry was last used.
    pub last_used_epoch: u64,
}

/// A manifest: entries ordered most recently used first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// The entries, newest first.
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Inserts an entry at the front, replacing any entry with the same
    /// fingerprint, and truncates to [`MAX_MANIFEST_ENTRIES`].
    pub fn insert(&mut self, include_files: Vec<String>, fingerprint: Digest, object_key: Digest) {
        self.entries.retain(|e| e.fingerprint != fingerprint);
        self.entries.insert(
            0,
            ManifestEntry {
                include_files,
                fingerprint,
                object_key,
                last_used_epoch: now_epoch(),
            },
        );
        self.entries.truncate(MAX_MANIFEST_ENTRIES);
    }

    /// Moves the entry with the given object key to the front and bumps
    /// its last-used stamp.
    pub fn touch(&mut self, object_key: Digest) {
        if let Some(pos) = self.entries.iter().position(|e| e.object_key == object_key) {
            let mut entry = self.entries.remove(pos);
            entry.last_used_epoch = now_epoch();
            self.entries.insert(0, entry);
        }
    }

    /// Drops entry groups that share a fingerprint but disagree on the
    /// object key — that can only arise from corruption, and neither copy
    /// can be trusted.
    fn sanitize(&mut self) {
        let conflicting: Vec<Digest> = self
            .entries
            .iter()
            .filter(|a| {
                self.entries
                    .iter()
                    .any(|b| b.fingerprint == a.fingerprint && b.object_key != a.object_key)
            })
            .map(|e| e.fingerprint)
            .collect();
        if !conflicting.is_empty() {
            warn!("discarding conflicting manifest entries");
            self.entries.retain(|e| !conflicting.contains(&e.fingerprint));
        }
    }
}

/// Reads and writes manifests under `<cache>/manifests/<aa>/<hash>.json`.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    /// Creates a store rooted at `<cache_dir>/manifests`.
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            root: cache_dir.join("manifests"),
        }
    }

    /// The file path for one manifest hash.
    pub fn manifest_path(&self, hash: Digest) -> PathBuf {
        self.root.join(hash.shard()).join(format!("{hash}.json"))
    }

    /// Loads a manifest. Missing or corrupt files read as `None`; a corrupt
    /// file is removed so it cannot shadow future inserts.
    pub fn load(&self, hash: Digest) -> Option<Manifest> {
        let path = self.manifest_path(hash);
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<Manifest>(&text) {
            Ok(mut manifest) => {
                manifest.sanitize();
                Some(manifest)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "removing unreadable manifest");
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    /// Writes a manifest atomically: temp file in the same directory,
    /// fsync, rename into place.
    pub fn store(&self, hash: Digest, manifest: &Manifest) -> Result<(), CacheError> {
        let dir = self.root.join(hash.shard());
        std::fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        let path = self.manifest_path(hash);

        let json =
            serde_json::to_string_pretty(manifest).map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp).map_err(|e| CacheError::io(&tmp, e))?;
            use std::io::Write;
            file.write_all(json.as_bytes())
                .map_err(|e| CacheError::io(&tmp, e))?;
            file.sync_all().map_err(|e| CacheError::io(&tmp, e))?;
        }
        std::fs::rename(&tmp, &path).map_err(|e| CacheError::io(&path, e))
    }

    /// Removes one manifest, ignoring a file that is already gone.
    pub fn remove(&self, hash: Digest) {
        let _ = std::fs::remove_file(self.manifest_path(hash));
    }

    /// Removes every manifest.
    pub fn clear(&self) -> Result<(), CacheError> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root).map_err(|e| CacheError::io(&self.root, e))?;
        }
        Ok(())
    }
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

    fn digest(tag: &str) -> Digest {
        Digest::from_bytes(tag.as_bytes())
    }

    fn entry_keys(m: &Manifest) -> Vec<Digest> {
        m.entries.iter().map(|e| e.object_key).collect()
    }

    #[test]
    fn insert_prepends() {
        let mut m = Manifest::default();
        m.insert(vec![], digest("fp1"), digest("obj1"));
        m.insert(vec![], digest("fp2"), digest("obj2"));
        assert_eq!(entry_keys(&m), vec![digest("obj2"), digest("obj1")]);
    }

    #[test]
    fn insert_truncates_to_limit_dropping_oldest() {
        let mut m = Manifest::default();
        for i in 0..MAX_MANIFEST_ENTRIES + 3 {
            m.insert(vec![], digest(&format!("fp{i}")), digest(&format!("obj{i}")));
        }
        assert_eq!(m.entries.len(), MAX_MANIFEST_ENTRIES);
        // The first inserts (oldest) are the ones that fell off.
        assert!(!entry_keys(&m).contains(&digest("obj0")));
        assert!(!entry_keys(&m).contains(&digest("obj2")));
        assert_eq!(m.entries[0].object_key, digest("obj12"));
    }

    #[test]
    fn insert_replaces_same_fingerprint() {
        let mut m = Manifest::default();
        m.insert(vec![], digest("fp"), digest("obj1"));
        m.insert(vec![], digest("fp"), digest("obj2"));
        assert_eq!(m.entries.len(), 1);
        assert_eq!(m.entries[0].object_key, digest("obj2"));
    }

    #[test]
    fn touch_moves_to_front() {
        let mut m = Manifest::default();
        m.insert(vec![], digest("fp1"), digest("obj1"));
        m.insert(vec![], digest("fp2"), digest("obj2"));
        m.touch(digest("obj1"));
        assert_eq!(entry_keys(&m), vec![digest("obj1"), digest("obj2")]);
    }

    #[test]
    fn touch_unknown_key_is_noop() {
        let mut m = Manifest::default();
        m.insert(vec![], digest("fp1"), digest("obj1"));
        m.touch(digest("missing"));
        assert_eq!(entry_keys(&m), vec![digest("obj1")]);
    }

    #[test]
    fn store_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let hash = digest("manifest");

        let mut m = Manifest::default();
        m.insert(
            vec!["<BASE_DIR>/a.h".to_string(), "<BASE_DIR>/b.h".to_string()],
            digest("fp"),
            digest("obj"),
        );
        store.store(hash, &m).unwrap();

        let loaded = store.load(hash).unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].include_files.len(), 2);
        assert_eq!(loaded.entries[0].object_key, digest("obj"));
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        assert!(store.load(digest("nothing")).is_none());
    }

    #[test]
    fn load_corrupt_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let hash = digest("broken");
        let path = store.manifest_path(hash);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{{{ nope").unwrap();

        assert!(store.load(hash).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn conflicting_fingerprints_are_discarded_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let hash = digest("conflict");

        // Hand-build a manifest with two entries sharing a fingerprint but
        // naming different objects, plus one healthy entry.
        let manifest = Manifest {
            entries: vec![
                ManifestEntry {
                    include_files: vec![],
                    fingerprint: digest("shared"),
                    object_key: digest("obj1"),
                    last_used_epoch: 1,
                },
                ManifestEntry {
                    include_files: vec![],
                    fingerprint: digest("shared"),
                    object_key: digest("obj2"),
                    last_used_epoch: 2,
                },
                ManifestEntry {
                    include_files: vec![],
                    fingerprint: digest("healthy"),
                    object_key: digest("obj3"),
                    last_used_epoch: 3,
                },
            ],
        };
        store.store(hash, &manifest).unwrap();

        let loaded = store.load(hash).unwrap();
        assert_eq!(entry_keys(&loaded), vec![digest("obj3")]);
    }

    #[test]
    fn manifests_are_sharded_by_hash_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let hash = digest("shard-check");
        let path = store.manifest_path(hash);
        let shard_dir = path.parent().unwrap();
        assert_eq!(shard_dir.file_name().unwrap().to_str(), Some(hash.shard().as_str()));
        assert_eq!(
            shard_dir.parent().unwrap().file_name().unwrap().to_str(),
            Some("manifests")
        );
    }

    #[test]
    fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        store.store(digest("m1"), &Manifest::default()).unwrap();
        store.store(digest("m2"), &Manifest::default()).unwrap();

        store.clear().unwrap();
        assert!(store.load(digest("m1")).is_none());
        assert!(store.load(digest("m2")).is_none());
    }
}
