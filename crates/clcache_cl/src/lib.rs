//! Command-line analysis and compiler invocation for the clcache cache.
//!
//! This crate understands the `cl.exe` argument surface: tokenization and
//! response-file expansion, classification into cacheable / split / pass-
//! through invocations, normalization into the canonical form that feeds the
//! cache key, include discovery from `/showIncludes` output, and spawning of
//! the real compiler with captured or inherited streams.

#![warn(missing_docs)]

mod analyze;
mod args;
mod compiler;
mod error;
mod includes;
mod keys;
mod normalize;
mod paths;

pub use analyze::{
    analyze, classify, job_count, parse_arguments, Analysis, Classification, ParsedSwitch,
    PassthroughReason, SingleInvocation, SourceFile,
};
pub use args::{expand_response_files, extend_from_env, split_command_text};
pub use compiler::{CompilerInfo, CompilerResult, find_compiler, invoke_captured, invoke_inherited, preprocess};
pub use error::AnalyzeError;
pub use includes::{include_fingerprint, parse_show_includes};
pub use keys::{direct_object_key, indirect_object_key, manifest_hash};
pub use normalize::{normalize_direct, normalize_indirect};
pub use paths::PathNormalizer;
