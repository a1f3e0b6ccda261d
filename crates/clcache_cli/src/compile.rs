//! The invocation driver: classify → key → lookup → replay or compile+store.
//!
//! The overriding rule is that cache trouble never fails a build that would
//! otherwise succeed. Lock timeouts and storage errors fall back to the
//! real compiler; the only fatal conditions are a missing compiler and a
//! compression-sentinel mismatch.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use clcache_cache::{ensure_mode, CacheError, Statistics};
use clcache_cl::{
    analyze, classify, direct_object_key, expand_response_files, extend_from_env,
    include_fingerprint, indirect_object_key, invoke_captured, invoke_inherited, job_count,
    manifest_hash, normalize_direct, normalize_indirect, parse_show_includes, preprocess,
    Analysis, Classification, CompilerInfo, CompilerResult, PassthroughReason, SingleInvocation,
};
use clcache_common::{Config, Digest};
use tracing::{debug, warn};

use crate::pipeline::CacheContext;

/// Exit code when the real compiler cannot be located.
pub const EXIT_NO_COMPILER: i32 = 2;

/// Exit code for a compression-sentinel mismatch.
pub const EXIT_MODE_MISMATCH: i32 = 3;

/// Why a cacheable invocation went to the real compiler.
#[derive(Debug, Clone, Copy)]
enum MissReason {
    /// No manifest existed for this source and command line.
    SourceChanged,
    /// A manifest existed but no entry's include set matched.
    HeaderChanged,
    /// A manifest entry matched but its object had been evicted.
    Evicted,
    /// Indirect mode or a demoted direct-mode call; no sub-counter.
    Uncategorized,
}

impl MissReason {
    fn apply(self, stats: &mut Statistics) {
        stats.cache_misses += 1;
        match self {
            Self::SourceChanged => stats.source_changed_misses += 1,
            Self::HeaderChanged => stats.header_changed_misses += 1,
            Self::Evicted => stats.evicted_misses += 1,
            Self::Uncategorized => {}
        }
    }
}

/// A manifest insert to perform after a successful store.
struct ManifestUpdate {
    hash: Digest,
    include_files: Vec<String>,
    fingerprint: Digest,
}

/// Handles a compiler invocation end to end and returns the exit code.
pub fn run(config: &Config, argv: Vec<String>) -> i32 {
    let (compiler_override, args) = split_compiler_arg(argv);
    let configured = compiler_override.or_else(|| config.compiler.clone());
    let Some(compiler_path) = clcache_cl::find_compiler(configured.as_deref()) else {
        eprintln!(
            "clcache: failed to locate the real compiler; set CLCACHE_CL or extend PATH"
        );
        return EXIT_NO_COMPILER;
    };

    if config.disabled {
        return invoke_inherited(&compiler_path, &args).unwrap_or(EXIT_NO_COMPILER);
    }

    let ctx = match CacheContext::open(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            warn!(%err, "cannot open cache, bypassing");
            return invoke_inherited(&compiler_path, &args).unwrap_or(EXIT_NO_COMPILER);
        }
    };

    if let Err(err) = ensure_mode(&ctx.cache_dir, config.compress) {
        eprintln!("clcache: {err}");
        return EXIT_MODE_MISMATCH;
    }

    let cmdline = extend_from_env(args.clone(), |name| std::env::var(name).ok());
    let cmdline = match expand_response_files(&cmdline) {
        Ok(cmdline) => cmdline,
        Err(err) => {
            warn!(%err, "response file expansion failed");
            record_passthrough(&ctx, PassthroughReason::Unsupported);
            return invoke_inherited(&compiler_path, &args).unwrap_or(EXIT_NO_COMPILER);
        }
    };

    let classification = match classify(&cmdline) {
        Ok(classification) => classification,
        Err(err) => {
            debug!(%err, "unparseable command line");
            Classification::Passthrough(PassthroughReason::Unsupported)
        }
    };

    match classification {
        Classification::Passthrough(reason) => {
            debug!(?reason, "passing through to real compiler");
            record_passthrough(&ctx, reason);
            invoke_inherited(&compiler_path, &args).unwrap_or(EXIT_NO_COMPILER)
        }
        Classification::SplitMulti(jobs) => run_split(&ctx, &compiler_path, &cmdline, jobs),
        Classification::Cacheable(inv) => {
            match process_single(&ctx, config, &compiler_path, &inv) {
                Ok(code) => code,
                Err(err) => {
                    if err.is_lock_timeout() {
                        warn!(%err, "lock timeout, bypassing cache");
                        let _ = ctx.stats.update(&ctx.locks, |s| {
                            s.calls_total += 1;
                            s.lock_timeouts += 1;
                        });
                    } else {
                        warn!(%err, "cache unavailable, bypassing");
                    }
                    // The original argv: cl.exe applies CL/_CL_ and expands
                    // response files itself on this path.
                    invoke_inherited(&compiler_path, &args).unwrap_or(EXIT_NO_COMPILER)
                }
            }
        }
    }
}

/// Peels a leading `something.exe` token off the argv: build systems may
/// pass the compiler executable as the first argument.
fn split_compiler_arg(mut argv: Vec<String>) -> (Option<PathBuf>, Vec<String>) {
    let leading_exe = argv
        .first()
        .is_some_and(|a| !a.starts_with(['/', '-', '@']) && a.to_lowercase().ends_with(".exe"));
    if leading_exe {
        let compiler = argv.remove(0);
        (Some(PathBuf::from(compiler)), argv)
    } else {
        (None, argv)
    }
}

fn record_passthrough(ctx: &CacheContext, reason: PassthroughReason) {
    let result = ctx.stats.update(&ctx.locks, |s| {
        s.calls_total += 1;
        match reason {
            PassthroughReason::Linking => s.calls_for_linking += 1,
            PassthroughReason::NoSourceFile => s.calls_without_source_file += 1,
            PassthroughReason::ExternalDebugInfo => s.calls_for_external_debug_info += 1,
            PassthroughReason::PreprocessorOnly => s.calls_for_preprocessing += 1,
            PassthroughReason::Unsupported => s.calls_unsupported += 1,
            PassthroughReason::Disabled => {}
        }
    });
    if let Err(err) = result {
        warn!(%err, "statistics update skipped");
    }
}

/// Runs one multi-source invocation as per-source children of this
/// executable, up to the `/MP` job count in parallel, failing fast on the
/// first non-zero exit.
fn run_split(
    ctx: &CacheContext,
    compiler_path: &Path,
    cmdline: &[String],
    jobs: Vec<SingleInvocation>,
) -> i32 {
    let _ = ctx.stats.update(&ctx.locks, |s| {
        s.calls_total += 1;
        s.calls_for_multiple_sources += 1;
    });

    let parallelism = job_count(cmdline).max(1);
    debug!(jobs = jobs.len(), parallelism, "splitting multi-source invocation");

    let Ok(own_exe) = std::env::current_exe() else {
        // Cannot re-invoke ourselves; compile everything uncached instead.
        return invoke_inherited(compiler_path, cmdline).unwrap_or(EXIT_NO_COMPILER);
    };

    let mut queue = jobs.into_iter();
    let mut running: VecDeque<Child> = VecDeque::new();
    let mut exit_code = 0;

    loop {
        while exit_code == 0 && running.len() < parallelism {
            let Some(job) = queue.next() else { break };
            let spawned = Command::new(&own_exe)
                .args(&job.cmdline)
                .env("CLCACHE_CL", compiler_path)
                .env_remove("CL")
                .env_remove("_CL_")
                .spawn();
            match spawned {
                Ok(child) => running.push_back(child),
                Err(err) => {
                    warn!(%err, "failed to spawn child invocation");
                    exit_code = EXIT_NO_COMPILER;
                }
            }
        }
        let Some(mut child) = running.pop_front() else { break };
        let code = child
            .wait()
            .ok()
            .and_then(|status| status.code())
            .unwrap_or(-1);
        if exit_code == 0 && code != 0 {
            exit_code = code;
        }
    }
    exit_code
}

fn process_single(
    ctx: &CacheContext,
    config: &Config,
    compiler_path: &Path,
    inv: &SingleInvocation,
) -> Result<i32, CacheError> {
    let compiler =
        CompilerInfo::probe(compiler_path).map_err(|e| CacheError::io(compiler_path, e))?;
    let analysis = analyze(&inv.cmdline).map_err(|e| CacheError::Serialization {
        reason: e.to_string(),
    })?;

    if config.no_direct {
        process_indirect(ctx, &compiler, &analysis, inv)
    } else {
        process_direct(ctx, &compiler, &analysis, inv)
    }
}

/// Direct mode: manifest lookup first, compile with `/showIncludes` on a
/// miss so the include set for the new manifest entry is learned from the
/// same compile.
fn process_direct(
    ctx: &CacheContext,
    compiler: &CompilerInfo,
    analysis: &Analysis,
    inv: &SingleInvocation,
) -> Result<i32, CacheError> {
    let normalized = normalize_direct(analysis, &ctx.paths);
    let source_rel = ctx.paths.canonicalize(&inv.source);
    let m_hash = manifest_hash(compiler, &normalized, &source_rel);

    let mut reason = MissReason::SourceChanged;
    let mut evicted_key = None;
    {
        let _manifest_guard = ctx.locks.manifest(m_hash)?;
        if let Some(mut manifest) = ctx.manifests.load(m_hash) {
            reason = MissReason::HeaderChanged;
            if let Some(key) = find_valid_entry(ctx, &manifest, &inv.source) {
                manifest.touch(key);
                if let Err(err) = ctx.manifests.store(m_hash, &manifest) {
                    warn!(%err, "manifest LRU update skipped");
                }

                let _shard_guard = ctx.locks.object_shard(&key.shard())?;
                if let Some(artifacts) = ctx.objects.get(key) {
                    if let Some(code) = try_replay(ctx, inv, key, &artifacts) {
                        return Ok(code);
                    }
                    // Unreadable entry: drop it and recompile under its key.
                    ctx.objects.remove(key);
                }
                reason = MissReason::Evicted;
                evicted_key = Some(key);
            }
        }
    }

    if let Some(key) = evicted_key {
        // The include set is unchanged, so the existing key is still right.
        let result = invoke_captured(&compiler.path, &inv.cmdline)
            .map_err(|e| CacheError::io(&compiler.path, e))?;
        return store_and_finish(ctx, key, reason, inv, result, None);
    }

    let strip = !analysis.has("showIncludes");
    let mut cmdline = inv.cmdline.clone();
    if strip {
        cmdline.insert(0, "/showIncludes".to_string());
    }
    let mut result = invoke_captured(&compiler.path, &cmdline)
        .map_err(|e| CacheError::io(&compiler.path, e))?;
    let (includes, stdout) = parse_show_includes(&result.stdout, &inv.source, strip);
    result.stdout = stdout;

    if includes.is_empty() {
        debug!("no include notes found, demoting this call to indirect mode");
        return store_demoted(ctx, compiler, analysis, inv, result);
    }

    match current_fingerprint(ctx, &inv.source, &includes) {
        Ok((include_files, fingerprint)) => {
            let key = direct_object_key(m_hash, fingerprint);
            store_and_finish(
                ctx,
                key,
                reason,
                inv,
                result,
                Some(ManifestUpdate {
                    hash: m_hash,
                    include_files,
                    fingerprint,
                }),
            )
        }
        Err(err) => {
            warn!(%err, "include set unhashable, result not cached");
            let _ = ctx.stats.update(&ctx.locks, |s| {
                s.calls_total += 1;
                reason.apply(s);
            });
            emit_result(&result);
            Ok(result.exit_code)
        }
    }
}

/// Indirect mode: the preprocessed text is the key.
fn process_indirect(
    ctx: &CacheContext,
    compiler: &CompilerInfo,
    analysis: &Analysis,
    inv: &SingleInvocation,
) -> Result<i32, CacheError> {
    let pp = preprocess(&compiler.path, &inv.cmdline)
        .map_err(|e| CacheError::io(&compiler.path, e))?;
    if pp.exit_code != 0 {
        // Preprocessing failed; let the real compile report the problem.
        let result = invoke_captured(&compiler.path, &inv.cmdline)
            .map_err(|e| CacheError::io(&compiler.path, e))?;
        let _ = ctx.stats.update(&ctx.locks, |s| {
            s.calls_total += 1;
            MissReason::Uncategorized.apply(s);
        });
        emit_result(&result);
        return Ok(result.exit_code);
    }

    let normalized = normalize_indirect(analysis);
    let text = ctx.paths.collapse_output(&pp.stdout);
    let key = indirect_object_key(compiler, &normalized, &text);

    {
        let _shard_guard = ctx.locks.object_shard(&key.shard())?;
        if let Some(artifacts) = ctx.objects.get(key) {
            if let Some(code) = try_replay(ctx, inv, key, &artifacts) {
                return Ok(code);
            }
            ctx.objects.remove(key);
        }
    }

    let result = invoke_captured(&compiler.path, &inv.cmdline)
        .map_err(|e| CacheError::io(&compiler.path, e))?;
    store_and_finish(ctx, key, MissReason::Uncategorized, inv, result, None)
}

/// A direct-mode call whose `/showIncludes` output yielded nothing falls
/// back to the preprocessor for key derivation, for this call only.
fn store_demoted(
    ctx: &CacheContext,
    compiler: &CompilerInfo,
    analysis: &Analysis,
    inv: &SingleInvocation,
    result: CompilerResult,
) -> Result<i32, CacheError> {
    if result.exit_code == 0 {
        if let Ok(pp) = preprocess(&compiler.path, &inv.cmdline) {
            if pp.exit_code == 0 {
                let normalized = normalize_indirect(analysis);
                let text = ctx.paths.collapse_output(&pp.stdout);
                let key = indirect_object_key(compiler, &normalized, &text);
                return store_and_finish(ctx, key, MissReason::Uncategorized, inv, result, None);
            }
        }
    }
    let _ = ctx.stats.update(&ctx.locks, |s| {
        s.calls_total += 1;
        MissReason::Uncategorized.apply(s);
    });
    emit_result(&result);
    Ok(result.exit_code)
}

/// Re-hashes the include list of each manifest entry against the current
/// header contents; returns the object key of the first entry whose
/// fingerprint still matches.
fn find_valid_entry(
    ctx: &CacheContext,
    manifest: &clcache_cache::Manifest,
    source: &Path,
) -> Option<Digest> {
    let source_digest = ctx.memoizer.file_digest(source).ok()?;
    'entries: for entry in &manifest.entries {
        let mut pairs = Vec::with_capacity(entry.include_files.len());
        for stored in &entry.include_files {
            let path = ctx.paths.expand(stored);
            match ctx.memoizer.file_digest(&path) {
                Ok(digest) => pairs.push((stored.clone(), digest)),
                // A header vanished; this entry cannot match anymore.
                Err(_) => continue 'entries,
            }
        }
        if include_fingerprint(source_digest, &pairs) == entry.fingerprint {
            return Some(entry.object_key);
        }
    }
    None
}

/// Hashes the just-observed include set for a new manifest entry.
fn current_fingerprint(
    ctx: &CacheContext,
    source: &Path,
    includes: &[PathBuf],
) -> std::io::Result<(Vec<String>, Digest)> {
    let source_digest = ctx.memoizer.file_digest(source)?;
    let mut pairs = Vec::with_capacity(includes.len());
    for path in includes {
        let digest = ctx.memoizer.file_digest(path)?;
        pairs.push((ctx.paths.canonicalize(path), digest));
    }
    let fingerprint = include_fingerprint(source_digest, &pairs);
    let include_files = pairs.into_iter().map(|(path, _)| path).collect();
    Ok((include_files, fingerprint))
}

/// Replays a hit: materializes the object, emits the captured streams with
/// sentinels expanded, and updates statistics. Returns `None` when the
/// entry turns out to be unreadable.
fn try_replay(
    ctx: &CacheContext,
    inv: &SingleInvocation,
    key: Digest,
    artifacts: &clcache_cache::CachedArtifacts,
) -> Option<i32> {
    remove_existing(&inv.object);
    if let Err(err) = artifacts.materialize(&inv.object) {
        warn!(%err, key = %key, "cached object unreadable");
        return None;
    }
    debug!(key = %key, object = %inv.object.display(), "cache hit");

    let _ = ctx.stats.update(&ctx.locks, |s| {
        s.calls_total += 1;
        s.cache_hits += 1;
    });
    ctx.objects.touch(key);

    emit(&ctx.paths.expand_output(&artifacts.stdout()), false);
    emit(&ctx.paths.expand_output(&artifacts.stderr()), true);
    Some(artifacts.exit_code())
}

/// Stores a successful compile result, updates the manifest and counters,
/// kicks off background cleaning when over budget, and emits the captured
/// streams. Storage trouble is logged and swallowed: the compile result is
/// returned to the caller regardless.
fn store_and_finish(
    ctx: &CacheContext,
    key: Digest,
    reason: MissReason,
    inv: &SingleInvocation,
    result: CompilerResult,
    manifest_update: Option<ManifestUpdate>,
) -> Result<i32, CacheError> {
    let compiled_ok = result.exit_code == 0 && inv.object.exists();
    let mut stored_size = None;

    if compiled_ok {
        match ctx.locks.object_shard(&key.shard()) {
            Ok(_shard_guard) => {
                let stdout = ctx.paths.collapse_output(&result.stdout);
                let stderr = ctx.paths.collapse_output(&result.stderr);
                match ctx
                    .objects
                    .put(key, &inv.object, &stdout, &stderr, result.exit_code)
                {
                    Ok(meta) => stored_size = Some(meta.stored_size),
                    Err(err) => warn!(%err, "cache write abandoned"),
                }
            }
            Err(err) if err.is_lock_timeout() => {
                warn!(%err, "cache write abandoned after lock timeout");
                let _ = ctx.stats.update(&ctx.locks, |s| s.lock_timeouts += 1);
            }
            Err(err) => warn!(%err, "cache write abandoned"),
        }

        if stored_size.is_some() {
            if let Some(update) = manifest_update {
                store_manifest_entry(ctx, key, update);
            }
        }
    }

    let over_budget = ctx
        .stats
        .update(&ctx.locks, |s| {
            s.calls_total += 1;
            reason.apply(s);
            if let Some(size) = stored_size {
                s.cache_entries += 1;
                s.cache_size += size;
            }
            s.cache_size > s.max_cache_size
        })
        .unwrap_or(false);
    if over_budget {
        spawn_background_clean();
    }

    emit_result(&result);
    Ok(result.exit_code)
}

fn store_manifest_entry(ctx: &CacheContext, key: Digest, update: ManifestUpdate) {
    match ctx.locks.manifest(update.hash) {
        Ok(_guard) => {
            let mut manifest = ctx.manifests.load(update.hash).unwrap_or_default();
            manifest.insert(update.include_files, update.fingerprint, key);
            if let Err(err) = ctx.manifests.store(update.hash, &manifest) {
                warn!(%err, "manifest update skipped");
            }
        }
        Err(err) => warn!(%err, "manifest update skipped"),
    }
}

/// Best-effort removal of a stale object file before materialization.
/// Retries briefly: on Windows another process may still hold the file.
fn remove_existing(path: &Path) {
    for _ in 0..5 {
        match std::fs::remove_file(path) {
            Ok(()) => return,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(_) => std::thread::sleep(std::time::Duration::from_millis(100)),
        }
    }
}

/// Fire-and-forget `clcache -c` child for automatic cleaning.
fn spawn_background_clean() {
    let Ok(own_exe) = std::env::current_exe() else {
        return;
    };
    debug!("cache over budget, spawning background clean");
    let _ = Command::new(own_exe)
        .arg("-c")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
}

fn emit_result(result: &CompilerResult) {
    emit(&result.stdout, false);
    emit(&result.stderr, true);
}

fn emit(text: &str, to_stderr: bool) {
    if text.is_empty() {
        return;
    }
    if to_stderr {
        let _ = std::io::stderr().write_all(text.as_bytes());
    } else {
        let _ = std::io::stdout().write_all(text.as_bytes());
    }
}
