//! Include discovery from `/showIncludes` compiler output.
//!
//! cl.exe reports each included header as a localized note line. The prefix
//! wording varies with the compiler locale, so matching is structural: one
//! word, a colon, a word-and-space phrase, a colon, whitespace, then the
//! path. English output looks like
//! `Note: including file:  C:\VC\INCLUDE\limits.h`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clcache_common::{Digest, Hasher};
use regex::Regex;

fn include_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+): ([ \w]+):( +)(?P<file_path>\S.*)$").unwrap())
}

/// Extracts the include set from captured compiler output.
///
/// Returns the reported header paths (sorted, deduplicated, the source file
/// itself excluded) and the output text. When `strip` is set, the note lines
/// are removed from the returned text — used when clcache injected
/// `/showIncludes` itself and the user should not see the notes.
pub fn parse_show_includes(
    output: &str,
    source: &Path,
    strip: bool,
) -> (Vec<PathBuf>, String) {
    let mut includes = BTreeSet::new();
    let mut filtered = String::with_capacity(output.len());
    let abs_source = absolute_folded(source);

    for line in output.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if let Some(caps) = include_line_re().captures(trimmed) {
            let path = PathBuf::from(&caps["file_path"]);
            if absolute_folded(&path) != abs_source {
                includes.insert(path);
            }
        } else if strip {
            filtered.push_str(line);
        }
    }

    let text = if strip { filtered } else { output.to_string() };
    (includes.into_iter().collect(), text)
}

/// Fingerprint over the include set of one translation unit.
///
/// Hashes the source content digest followed by every `(relativized path,
/// content digest)` pair in path order. Two TUs with the same source bytes
/// and the same header contents under the same names share a fingerprint.
pub fn include_fingerprint(source_digest: Digest, includes: &[(String, Digest)]) -> Digest {
    let mut sorted: Vec<&(String, Digest)> = includes.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Hasher::new();
    hasher.update_component(source_digest.to_hex().as_bytes());
    for (path, digest) in sorted {
        hasher.update_component(path.as_bytes());
        hasher.update_component(digest.to_hex().as_bytes());
    }
    hasher.finalize()
}

/// Absolute, case-folded comparison form of a path.
fn absolute_folded(path: &Path) -> String {
    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let s = abs.to_string_lossy().into_owned();
    if cfg!(windows) {
        s.to_lowercase()
    } else {
        s
    }
}
