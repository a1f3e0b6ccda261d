//! Locating and invoking the real compiler.
//!
//! The cache must be able to run cl.exe three ways: with inherited streams
//! (passthrough), with captured streams (miss path), and as a preprocessor
//! (`/EP`, indirect mode). Overlong command lines are spilled into a
//! temporary response file, matching cl.exe's own 32k limit.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

/// cl.exe rejects command lines past 32767 characters; stay well below.
const MAX_CMDLINE_LEN: usize = 32_000;

/// Identity of the real compiler binary as it participates in cache keys.
#[derive(Debug, Clone)]
pub struct CompilerInfo {
    /// Filesystem path to the compiler executable.
    pub path: PathBuf,
    /// Executable file size in bytes.
    pub size: u64,
    /// Modification timestamp in milliseconds since the Unix epoch.
    pub mtime_ms: u64,
}

impl CompilerInfo {
    /// Stats the compiler binary and records its cache-key identity.
    pub fn probe(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mtime_ms = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            mtime_ms,
        })
    }
}

/// Captured result of one compiler run.
#[derive(Debug, Clone)]
pub struct CompilerResult {
    /// Process exit code (`-1` if terminated without one).
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Locates the real compiler binary.
///
/// An explicitly configured path wins; a bare filename is searched on
/// `PATH`, as is the default `cl.exe`.
pub fn find_compiler(configured: Option<&Path>) -> Option<PathBuf> {
    match configured {
        Some(path) if path.components().count() > 1 => path.is_file().then(|| path.to_path_buf()),
        Some(name) => search_path(name),
        None => search_path(Path::new("cl.exe")),
    }
}

fn search_path(name: &Path) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Runs the compiler with inherited stdout/stderr and returns its exit code.
pub fn invoke_inherited(compiler: &Path, args: &[String]) -> std::io::Result<i32> {
    debug!(compiler = %compiler.display(), ?args, "forwarding to real compiler");
    let status = base_command(compiler, args)?.status()?;
    Ok(status.code().unwrap_or(-1))
}

/// Runs the compiler capturing stdout and stderr.
///
/// Captured invocations always use a command line that already had the
/// `CL` / `_CL_` extensions applied, so those variables are withheld from
/// the child to avoid applying them twice.
pub fn invoke_captured(compiler: &Path, args: &[String]) -> std::io::Result<CompilerResult> {
    debug!(compiler = %compiler.display(), ?args, "invoking real compiler (captured)");
    let output = base_command(compiler, args)?
        .env_remove("CL")
        .env_remove("_CL_")
        .stdin(Stdio::null())
        .output()?;
    Ok(CompilerResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs the compiler as a preprocessor (`/EP`), capturing the preprocessed
/// translation unit on stdout.
pub fn preprocess(compiler: &Path, args: &[String]) -> std::io::Result<CompilerResult> {
    let mut pp_args = vec!["/EP".to_string()];
    pp_args.extend(
        args.iter()
            .filter(|a| a.as_str() != "/c" && a.as_str() != "-c")
            .cloned(),
    );
    invoke_captured(compiler, &pp_args)
}

/// Builds the command, spilling into a response file when the rendered
/// command line would exceed the cl.exe length limit.
///
/// The response file is persisted (not deleted on drop): it must outlive
/// the child process, which may be waited on long after this returns.
fn base_command(compiler: &Path, args: &[String]) -> std::io::Result<Command> {
    let mut cmd = Command::new(compiler);
    // The Visual Studio IDE sets this to redirect cl.exe output to named
    // pipes, which would make capture impossible.
    cmd.env_remove("VS_UNICODE_OUTPUT");

    let total: usize = args.iter().map(|a| a.len() + 1).sum::<usize>()
        + compiler.as_os_str().len();
    if total < MAX_CMDLINE_LEN {
        cmd.args(args);
        return Ok(cmd);
    }

    let mut rsp = tempfile::Builder::new()
        .prefix("clcache")
        .suffix(".rsp")
        .tempfile()?;
    let mut line = String::new();
    for arg in args {
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(&quote_arg(arg));
    }
    rsp.write_all(line.as_bytes())?;
    rsp.write_all(b"\n")?;
    rsp.flush()?;
    let (_, path) = rsp.keep()?;
    debug!(rsp = %path.display(), "spilled overlong command line to response file");
    cmd.arg(format!("@{}", path.display()));
    Ok(cmd)
}

/// Quotes one argument for a response file, escaping embedded quotes.
fn quote_arg(arg: &str) -> String {
    if !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
