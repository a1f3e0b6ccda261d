//! Cache-key derivation.
//!
//! All keys are SHA-256 digests over length-prefixed components, so no two
//! distinct input tuples can collide by concatenation. The compiler binary
//! participates through its file size and modification timestamp; a new
//! compiler invalidates everything cheaply.

use clcache_common::{Digest, Hasher};

use crate::compiler::CompilerInfo;

/// Bumped whenever the on-disk manifest or key format changes, so stale
/// entries from older versions are never misinterpreted.
const CACHE_FORMAT_VERSION: u32 = 1;

/// The manifest hash for one `(source, normalized command line)` pair.
///
/// Direct mode groups cache entries per source file under this hash; the
/// include-set fingerprint then selects an entry within the manifest.
pub fn manifest_hash(
    compiler: &CompilerInfo,
    normalized_args: &[String],
    source_relativized: &str,
) -> Digest {
    let mut hasher = key_hasher(b"manifest", compiler);
    for arg in normalized_args {
        hasher.update_component(arg.as_bytes());
    }
    hasher.update_component(source_relativized.as_bytes());
    hasher.finalize()
}

/// The object key for a direct-mode entry.
///
/// Combines the manifest hash with the include-set fingerprint so that two
/// different sources sharing an include set cannot collide.
pub fn direct_object_key(manifest: Digest, fingerprint: Digest) -> Digest {
    let mut hasher = Hasher::new();
    hasher.update_component(manifest.to_hex().as_bytes());
    hasher.update_component(fingerprint.to_hex().as_bytes());
    hasher.finalize()
}

/// The object key for an indirect-mode entry, derived from the normalized
/// command line and the preprocessed translation unit.
pub fn indirect_object_key(
    compiler: &CompilerInfo,
    normalized_args: &[String],
    preprocessed: &str,
) -> Digest {
    let mut hasher = key_hasher(b"object", compiler);
    for arg in normalized_args {
        hasher.update_component(arg.as_bytes());
    }
    hasher.update_component(preprocessed.as_bytes());
    hasher.finalize()
}

fn key_hasher(domain: &[u8], compiler: &CompilerInfo) -> Hasher {
    let mut hasher = Hasher::new();
    hasher.update_component(domain);
    hasher.update_component(&CACHE_FORMAT_VERSION.to_be_bytes());
    hasher.update_component(&compiler.size.to_be_bytes());
    hasher.update_component(&compiler.mtime_ms.to_be_bytes());
    hasher
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn compiler() -> CompilerInfo {
        CompilerInfo {
            path: PathBuf::from("cl.exe"),
            size: 123_456,
            mtime_ms: 1_700_000_000_000,
        }
    }

    fn norm(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn manifest_hash_stable() {
        let args = norm(&["/c", "/O2"]);
        let a = manifest_hash(&compiler(), &args, "<BASE_DIR>/a.c");
        let b = manifest_hash(&compiler(), &args, "<BASE_DIR>/a.c");
        assert_eq!(a, b);
    }

    #[test]
    fn manifest_hash_varies_with_source() {
        let args = norm(&["/c", "/O2"]);
        let a = manifest_hash(&compiler(), &args, "<BASE_DIR>/a.c");
        let b = manifest_hash(&compiler(), &args, "<BASE_DIR>/b.c");
        assert_ne!(a, b);
    }

    #[test]
    fn manifest_hash_varies_with_args() {
        let a = manifest_hash(&compiler(), &norm(&["/c", "/O2"]), "<BASE_DIR>/a.c");
        let b = manifest_hash(&compiler(), &norm(&["/c", "/O1"]), "<BASE_DIR>/a.c");
        assert_ne!(a, b);
    }

    #[test]
    fn manifest_hash_varies_with_compiler() {
        let args = norm(&["/c"]);
        let mut newer = compiler();
        newer.mtime_ms += 1;
        assert_ne!(
            manifest_hash(&compiler(), &args, "a.c"),
            manifest_hash(&newer, &args, "a.c")
        );

        let mut bigger = compiler();
        bigger.size += 1;
        assert_ne!(
            manifest_hash(&compiler(), &args, "a.c"),
            manifest_hash(&bigger, &args, "a.c")
        );
    }

    #[test]
    fn arg_boundaries_matter() {
        // ["/c", "/O2"] must not collide with ["/c/O2"].
        let a = manifest_hash(&compiler(), &norm(&["/c", "/O2"]), "a.c");
        let b = manifest_hash(&compiler(), &norm(&["/c/O2"]), "a.c");
        assert_ne!(a, b);
    }

    #[test]
    fn direct_key_combines_both_inputs() {
        let m1 = Digest::from_bytes(b"manifest one");
        let m2 = Digest::from_bytes(b"manifest two");
        let fp = Digest::from_bytes(b"fingerprint");
        assert_ne!(direct_object_key(m1, fp), direct_object_key(m2, fp));
        assert_ne!(
            direct_object_key(m1, fp),
            direct_object_key(m1, Digest::from_bytes(b"other"))
        );
    }

    #[test]
    fn indirect_key_varies_with_preprocessed_text() {
        let args = norm(&["/c", "/O2"]);
        let a = indirect_object_key(&compiler(), &args, "int main(){return 0;}");
        let b = indirect_object_key(&compiler(), &args, "int main(){return 1;}");
        assert_ne!(a, b);
    }

    #[test]
    fn manifest_and_object_domains_are_separated() {
        // Same inputs through both derivations must not produce the same key.
        let args = norm(&["/c"]);
        let m = manifest_hash(&compiler(), &args, "text");
        let o = indirect_object_key(&compiler(), &args, "text");
        assert_ne!(m, o);
    }
}
