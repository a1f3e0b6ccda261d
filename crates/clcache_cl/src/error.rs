//! Error types for command-line analysis.

use std::path::PathBuf;

/// Errors raised while preparing a compiler command line for analysis.
///
/// All of these are non-fatal for the build: the driver maps them to a
/// passthrough invocation of the real compiler.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzeError {
    /// A response file could not be read.
    #[error("failed to read response file {path}: {source}")]
    ResponseFileIo {
        /// The response file path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A response file was not valid UTF-8 or UTF-16 text.
    #[error("response file {path} has an unsupported encoding")]
    ResponseFileEncoding {
        /// The response file path.
        path: PathBuf,
    },

    /// An expanded response file itself contained an `@file` argument.
    #[error("nested response file reference in {path}")]
    NestedResponseFile {
        /// The response file containing the nested reference.
        path: PathBuf,
    },

    /// A switch that requires a joined value was passed without one.
    #[error("parameter for /{switch} must not be empty")]
    EmptyParameter {
        /// The switch name.
        switch: String,
    },

    /// A switch expecting a separate value appeared last on the command line.
    #[error("missing value for /{switch}")]
    MissingValue {
        /// The switch name.
        switch: String,
    },
}
