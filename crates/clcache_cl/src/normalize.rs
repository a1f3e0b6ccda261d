//! Command-line normalization for cache-key derivation.
//!
//! The normalized command line is the subset of switches whose effect can
//! reach the object file, emitted in original order in canonical joined
//! form. Output locations and parallelism/diagnostic switches never affect
//! code generation and are dropped; in indirect mode the preprocessor
//! switches are dropped too because their effect is already present in the
//! preprocessed text.

use crate::analyze::Analysis;
use crate::paths::PathNormalizer;

/// Switches dropped in every mode: output locations, parallelism, and
/// diagnostics that cannot change the produced object.
const DROP_ALWAYS: &[&str] = &["Fo", "Fd", "Fp", "MP", "showIncludes", "nologo", "FS"];

/// Switches whose value is a filesystem path that must be relativized.
const PATH_VALUED: &[&str] = &["AI", "I", "FI", "FU", "external:I", "imsvc"];

/// Switches that only influence the preprocessor. Dropped in indirect mode;
/// kept (relativized where path-valued) in direct mode.
const PREPROCESSOR_ONLY: &[&str] = &[
    "AI", "C", "E", "EP", "P", "FI", "Fx", "FU", "D", "U", "I", "u", "X", "imsvc",
];

/// Normalizes for direct mode: preprocessor switches retained in original
/// order, path values relativized.
pub fn normalize_direct(analysis: &Analysis, paths: &PathNormalizer) -> Vec<String> {
    analysis
        .switches
        .iter()
        .filter(|s| !DROP_ALWAYS.contains(&s.name.as_str()))
        .map(|s| {
            if PATH_VALUED.contains(&s.name.as_str()) {
                format!("/{}{}", s.name, paths.canonicalize_str(&s.value))
            } else {
                format!("/{}{}", s.name, s.value)
            }
        })
        .collect()
}

/// Normalizes for indirect mode: preprocessor switches dropped entirely,
/// everything else retained verbatim in original order.
pub fn normalize_indirect(analysis: &Analysis) -> Vec<String> {
    analysis
        .switches
        .iter()
        .filter(|s| {
            !DROP_ALWAYS.contains(&s.name.as_str())
                && !PREPROCESSOR_ONLY.contains(&s.name.as_str())
                && !s.name.starts_with("external:")
                && !s.name.starts_with("experimental:external")
        })
        .map(|s| format!("/{}{}", s.name, s.value))
        .collect()
}
