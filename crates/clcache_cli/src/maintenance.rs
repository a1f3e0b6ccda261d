//! Cache maintenance commands: `-s`, `-c`, `-C`, `-z`, `-M`.

use clcache_cache::{clean_cache, clear_cache};
use clcache_common::Config;

use crate::pipeline::CacheContext;
use crate::MaintenanceCli;

/// Dispatches one maintenance command and returns the process exit code.
pub fn run(cli: &MaintenanceCli, config: &Config) -> i32 {
    if cli.show_stats {
        return show_stats(config);
    }
    if cli.clean {
        return clean(config);
    }
    if cli.clear {
        return clear(config);
    }
    if cli.reset_stats {
        return reset_stats(config);
    }
    if let Some(bytes) = cli.set_size {
        return set_max_size(config, bytes);
    }
    0
}

fn show_stats(config: &Config) -> i32 {
    let ctx = match CacheContext::open(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("clcache: {err}");
            return 1;
        }
    };
    println!("cache directory: {}", ctx.cache_dir.display());
    println!("{}", ctx.stats.read());
    0
}

fn clean(config: &Config) -> i32 {
    let ctx = match CacheContext::open(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("clcache: {err}");
            return 1;
        }
    };
    match clean_cache(ctx.objects.as_ref(), &ctx.stats, &ctx.locks) {
        Ok(()) => {
            println!("Cache cleaned");
            0
        }
        Err(err) => {
            eprintln!("clcache: {err}");
            1
        }
    }
}

fn clear(config: &Config) -> i32 {
    let ctx = match CacheContext::open(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("clcache: {err}");
            return 1;
        }
    };
    match clear_cache(
        &ctx.cache_dir,
        ctx.objects.as_ref(),
        &ctx.manifests,
        &ctx.stats,
        &ctx.locks,
    ) {
        Ok(()) => {
            println!("Cache cleared");
            0
        }
        Err(err) => {
            eprintln!("clcache: {err}");
            1
        }
    }
}

fn reset_stats(config: &Config) -> i32 {
    let ctx = match CacheContext::open(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("clcache: {err}");
            return 1;
        }
    };
    match ctx.stats.update(&ctx.locks, |s| s.reset_counters()) {
        Ok(()) => {
            println!("Statistics reset");
            0
        }
        Err(err) => {
            eprintln!("clcache: {err}");
            1
        }
    }
}

fn set_max_size(config: &Config, bytes: u64) -> i32 {
    if bytes == 0 {
        eprintln!("Max size argument must be greater than 0.");
        return 1;
    }
    let ctx = match CacheContext::open(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("clcache: {err}");
            return 1;
        }
    };
    match ctx.stats.update(&ctx.locks, |s| s.max_cache_size = bytes) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("clcache: {err}");
            1
        }
    }
}
