//! Argument model and invocation classifier for cl.exe command lines.
//!
//! Parses an expanded argv into structured switches and source files using
//! the fixed cl.exe switch arity table, derives object-file targets, and
//! classifies the invocation as cacheable, splittable, or passthrough.

use std::path::{Path, PathBuf};

use crate::error::AnalyzeError;

/// How a switch accepts its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    /// `/NAMEparameter` — joined, value required (e.g. `/Ob2`).
    Joined,
    /// `/NAME[parameter]` — joined, value optional (e.g. `/MP4`, `/Fo...`).
    JoinedOptional,
    /// `/NAME[ ]parameter` — joined or separate (e.g. `/I dir`, `/Idir`).
    JoinedOrSeparate,
    /// `/NAME parameter` — separate value required (e.g. `/Xclang`).
    Separate,
}

/// The fixed table of switches that take a value, with their arity.
///
/// Everything not listed here is a bare flag. Matching picks the longest
/// name that prefixes the argument body.
const SWITCH_TABLE: &[(&str, Arity)] = &[
    ("Ob", Arity::Joined),
    ("Yl", Arity::Joined),
    ("Zm", Arity::Joined),
    ("doc", Arity::JoinedOptional),
    ("FA", Arity::JoinedOptional),
    ("FR", Arity::JoinedOptional),
    ("Fr", Arity::JoinedOptional),
    ("Gs", Arity::JoinedOptional),
    ("MP", Arity::JoinedOptional),
    ("Yc", Arity::JoinedOptional),
    ("Yu", Arity::JoinedOptional),
    ("Zp", Arity::JoinedOptional),
    ("Fa", Arity::JoinedOptional),
    ("Fd", Arity::JoinedOptional),
    ("Fe", Arity::JoinedOptional),
    ("Fi", Arity::JoinedOptional),
    ("Fm", Arity::JoinedOptional),
    ("Fo", Arity::JoinedOptional),
    ("Fp", Arity::JoinedOptional),
    ("Wv", Arity::JoinedOptional),
    ("experimental:external", Arity::JoinedOptional),
    ("external:anglebrackets", Arity::JoinedOptional),
    ("external:W", Arity::JoinedOptional),
    ("external:templates", Arity::JoinedOptional),
    ("AI", Arity::JoinedOrSeparate),
    ("D", Arity::JoinedOrSeparate),
    ("Tc", Arity::JoinedOrSeparate),
    ("Tp", Arity::JoinedOrSeparate),
    ("FI", Arity::JoinedOrSeparate),
    ("U", Arity::JoinedOrSeparate),
    ("I", Arity::JoinedOrSeparate),
    ("F", Arity::JoinedOrSeparate),
    ("FU", Arity::JoinedOrSeparate),
    ("w1", Arity::JoinedOrSeparate),
    ("w2", Arity::JoinedOrSeparate),
    ("w3", Arity::JoinedOrSeparate),
    ("w4", Arity::JoinedOrSeparate),
    ("wd", Arity::JoinedOrSeparate),
    ("we", Arity::JoinedOrSeparate),
    ("wo", Arity::JoinedOrSeparate),
    ("V", Arity::JoinedOrSeparate),
    ("imsvc", Arity::JoinedOrSeparate),
    ("external:I", Arity::JoinedOrSeparate),
    ("external:env", Arity::JoinedOrSeparate),
    ("Xclang", Arity::Separate),
];

/// Bare flags that would otherwise be swallowed by a prefix in the table
/// (`/FS` and `/FC` are not `/F` with a stack-size value).
const BARE_FLAGS: &[&str] = &["FS", "FC"];

/// Finds the longest table entry whose name prefixes the argument body.
fn parametrized(body: &str) -> Option<(&'static str, Arity)> {
    if BARE_FLAGS.contains(&body) {
        return None;
    }
    SWITCH_TABLE
        .iter()
        .filter(|(name, _)| body.starts_with(name))
        .max_by_key(|(name, _)| name.len())
        .map(|&(name, arity)| (name, arity))
}

/// One parsed compiler switch, in command-line order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSwitch {
    /// The switch name without the leading `/` or `-`.
    pub name: String,
    /// The switch value; empty for bare flags and empty optional values.
    pub value: String,
}

/// One input source file with its optional language override token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// The path as given on the command line.
    pub path: PathBuf,
    /// `""`, `"/Tc"`, or `"/Tp"` — prepended when rebuilding an argv.
    pub lang_prefix: &'static str,
}

impl SourceFile {
    /// The argv token for this source (`/Tc` form when typed).
    pub fn token(&self) -> String {
        format!("{}{}", self.lang_prefix, self.path.display())
    }
}

/// A fully parsed command line: ordered switches, sources, object targets.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// All switches in their original order.
    pub switches: Vec<ParsedSwitch>,
    /// All source files, duplicates preserved.
    pub sources: Vec<SourceFile>,
    /// One derived object path per source, in the same order.
    pub objects: Vec<PathBuf>,
}

impl Analysis {
    /// Returns `true` if any switch with the given name is present.
    pub fn has(&self, name: &str) -> bool {
        self.switches.iter().any(|s| s.name == name)
    }

    /// All values of switches with the given name, in order.
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.switches
            .iter()
            .filter(move |s| s.name == name)
            .map(|s| s.value.as_str())
    }
}

/// Why an invocation is handed to the real compiler uncached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    /// `/link` present or `/c` absent.
    Linking,
    /// No source file on the command line.
    NoSourceFile,
    /// `/Zi` requests an external debug database.
    ExternalDebugInfo,
    /// `/E`, `/EP`, or `/P` — preprocessor-only run.
    PreprocessorOnly,
    /// Caching disabled by configuration.
    Disabled,
    /// Precompiled headers, malformed arguments, or anything else the
    /// cache does not model.
    Unsupported,
}

/// A single-source compile job extracted from the command line.
#[derive(Debug, Clone)]
pub struct SingleInvocation {
    /// The argv for this job (original switches plus exactly one source).
    pub cmdline: Vec<String>,
    /// The source file being compiled.
    pub source: PathBuf,
    /// The object file this job will produce.
    pub object: PathBuf,
}

/// The classifier verdict for one expanded command line.
#[derive(Debug, Clone)]
pub enum Classification {
    /// Exactly one source file; eligible for caching.
    Cacheable(Box<SingleInvocation>),
    /// Multiple sources; re-run as independent single-source jobs.
    SplitMulti(Vec<SingleInvocation>),
    /// Forward to the real compiler unchanged.
    Passthrough(PassthroughReason),
}

/// Parses switches and input files from an expanded argv.
pub fn parse_arguments(
    cmdline: &[String],
) -> Result<(Vec<ParsedSwitch>, Vec<SourceFile>), AnalyzeError> {
    let mut switches = Vec::new();
    let mut sources = Vec::new();
    let mut i = 0;

    while i < cmdline.len() {
        let token = &cmdline[i];
        if let Some(body) = token.strip_prefix(['/', '-']) {
            if let Some((name, arity)) = parametrized(body) {
                let rest = &body[name.len()..];
                let value = match arity {
                    Arity::Joined => {
                        if rest.is_empty() {
                            return Err(AnalyzeError::EmptyParameter {
                                switch: name.to_string(),
                            });
                        }
                        rest.to_string()
                    }
                    Arity::JoinedOptional => rest.to_string(),
                    Arity::JoinedOrSeparate => {
                        if rest.is_empty() {
                            i += 1;
                            cmdline
                                .get(i)
                                .ok_or_else(|| AnalyzeError::MissingValue {
                                    switch: name.to_string(),
                                })?
                                .clone()
                        } else {
                            rest.strip_prefix(' ').unwrap_or(rest).to_string()
                        }
                    }
                    Arity::Separate => {
                        i += 1;
                        cmdline
                            .get(i)
                            .ok_or_else(|| AnalyzeError::MissingValue {
                                switch: name.to_string(),
                            })?
                            .clone()
                    }
                };
                match name {
                    "Tc" => sources.push(SourceFile {
                        path: PathBuf::from(&value),
                        lang_prefix: "/Tc",
                    }),
                    "Tp" => sources.push(SourceFile {
                        path: PathBuf::from(&value),
                        lang_prefix: "/Tp",
                    }),
                    _ => switches.push(ParsedSwitch {
                        name: name.to_string(),
                        value,
                    }),
                }
            } else {
                switches.push(ParsedSwitch {
                    name: body.to_string(),
                    value: String::new(),
                });
            }
        } else {
            sources.push(SourceFile {
                path: PathBuf::from(token),
                lang_prefix: "",
            });
        }
        i += 1;
    }

    Ok((switches, sources))
}

/// Parses an expanded argv and derives the object target per source.
pub fn analyze(cmdline: &[String]) -> Result<Analysis, AnalyzeError> {
    let (switches, sources) = parse_arguments(cmdline)?;

    // /Fo may name the object file (single source) or a target directory.
    let fo = switches
        .iter()
        .find(|s| s.name == "Fo")
        .map(|s| s.value.clone())
        .filter(|v| !v.is_empty());

    let mut prefix = PathBuf::new();
    let mut explicit_object = None;
    if let Some(fo) = fo {
        let fo_path = PathBuf::from(&fo);
        if fo.ends_with(['/', '\\']) || fo_path.is_dir() {
            prefix = fo_path;
        } else if sources.len() == 1 {
            explicit_object = Some(fo_path);
        }
    }

    let objects = match explicit_object {
        Some(obj) => vec![obj],
        None => sources
            .iter()
            .map(|src| prefix.join(object_name(&src.path)))
            .collect(),
    };

    Ok(Analysis {
        switches,
        sources,
        objects,
    })
}

/// The default object file name for a source: `<stem>.obj`.
fn object_name(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string_lossy().into_owned());
    PathBuf::from(format!("{stem}.obj"))
}

/// Classifies an expanded command line.
///
/// Mirrors the order cl.exe itself reports problems in: missing sources,
/// preprocessor-only runs, external debug info, precompiled headers, then
/// link-vs-compile.
pub fn classify(cmdline: &[String]) -> Result<Classification, AnalyzeError> {
    let analysis = analyze(cmdline)?;

    if analysis.sources.is_empty() {
        return Ok(Classification::Passthrough(PassthroughReason::NoSourceFile));
    }
    if analysis.has("E") || analysis.has("EP") || analysis.has("P") {
        return Ok(Classification::Passthrough(
            PassthroughReason::PreprocessorOnly,
        ));
    }
    if analysis.has("Zi") {
        return Ok(Classification::Passthrough(
            PassthroughReason::ExternalDebugInfo,
        ));
    }
    if analysis.has("Yc") || analysis.has("Yu") {
        return Ok(Classification::Passthrough(PassthroughReason::Unsupported));
    }
    if analysis.has("link") || !analysis.has("c") {
        return Ok(Classification::Passthrough(PassthroughReason::Linking));
    }

    let base = base_cmdline(cmdline, &analysis.sources);
    let mut jobs: Vec<SingleInvocation> = analysis
        .sources
        .iter()
        .zip(&analysis.objects)
        .map(|(src, obj)| {
            let mut job = base.clone();
            job.push(src.token());
            SingleInvocation {
                cmdline: job,
                source: src.path.clone(),
                object: obj.clone(),
            }
        })
        .collect();

    if jobs.len() == 1 {
        Ok(Classification::Cacheable(Box::new(jobs.remove(0))))
    } else {
        Ok(Classification::SplitMulti(jobs))
    }
}

/// The command line with all source tokens and `/MP` switches removed.
fn base_cmdline(cmdline: &[String], sources: &[SourceFile]) -> Vec<String> {
    let source_tokens: Vec<String> = sources
        .iter()
        .map(|s| s.path.display().to_string())
        .collect();
    cmdline
        .iter()
        .filter(|arg| {
            !source_tokens.contains(arg)
                && !arg.starts_with("/Tc")
                && !arg.starts_with("/Tp")
                && !arg.starts_with("-Tc")
                && !arg.starts_with("-Tp")
                && !arg.starts_with("/MP")
                && !arg.starts_with("-MP")
        })
        .cloned()
        .collect()
}

/// Number of parallel jobs requested by `/MP[n]`; the last instance wins.
///
/// A bare `/MP` means one job per available core.
pub fn job_count(cmdline: &[String]) -> usize {
    let mp = cmdline
        .iter()
        .filter_map(|arg| arg.strip_prefix(['/', '-']))
        .filter_map(|body| body.strip_prefix("MP"))
        .filter(|rest| rest.is_empty() || rest.chars().all(|c| c.is_ascii_digit()))
        .last();

    match mp {
        None => 1,
        Some("") => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2),
        Some(digits) => digits.parse().unwrap_or(1),
    }
}
