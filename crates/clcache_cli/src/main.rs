//! clcache — a compiler cache for the MSVC cl.exe compiler.
//!
//! Invoked in place of cl.exe: a handful of maintenance flags are handled
//! here, and any other command line is treated as a compiler invocation
//! and dispatched to the cache driver.

#![warn(missing_docs)]

mod compile;
mod maintenance;
mod pipeline;

use clap::Parser;
use clcache_common::Config;

/// The maintenance command surface.
///
/// Exactly one of these flags is used per invocation; command lines that do
/// not start with one of them are compiler invocations.
#[derive(Parser, Debug)]
#[command(
    name = "clcache",
    version,
    about = "clcache — a compiler cache for MSVC cl.exe",
    after_help = "Any other command line is forwarded as a compiler invocation."
)]
pub struct MaintenanceCli {
    /// Print cache statistics.
    #[arg(short = 's', long = "stats")]
    pub show_stats: bool,

    /// Evict least recently used entries down to 90% of the maximum size.
    #[arg(short = 'c', long = "clean")]
    pub clean: bool,

    /// Remove all cached objects and manifests; statistics are kept.
    #[arg(short = 'C', long = "clear")]
    pub clear: bool,

    /// Reset the hit/miss counters; cache contents are kept.
    #[arg(short = 'z', long = "reset")]
    pub reset_stats: bool,

    /// Set the maximum cache size in bytes.
    #[arg(short = 'M', long = "set-size", value_name = "BYTES")]
    pub set_size: Option<u64>,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let config = Config::from_env();
    init_logging(&config);

    let argv: Vec<String> = std::env::args().skip(1).collect();
    if argv.is_empty() {
        use clap::CommandFactory;
        let _ = MaintenanceCli::command().print_help();
        return 0;
    }

    if is_maintenance_flag(&argv[0]) {
        let full = std::iter::once("clcache".to_string()).chain(argv);
        return match MaintenanceCli::try_parse_from(full) {
            Ok(cli) => maintenance::run(&cli, &config),
            Err(err) => {
                // clap renders --help/--version through this path too.
                let is_error = err.use_stderr();
                let _ = err.print();
                i32::from(is_error)
            }
        };
    }

    compile::run(&config, argv)
}

/// The flags that make an invocation a maintenance command rather than a
/// compiler command line.
fn is_maintenance_flag(first: &str) -> bool {
    matches!(
        first,
        "-s" | "--stats"
            | "-c" | "--clean"
            | "-C" | "--clear"
            | "-z" | "--reset"
            | "-M" | "--set-size"
            | "-h" | "--help"
            | "-V" | "--version"
    )
}

/// Diagnostic logging to stderr, enabled by `CLCACHE_LOG`.
///
/// The variable's value is used as a tracing filter when it parses as one
/// (`CLCACHE_LOG=clcache_cache=trace`); anything else enables debug level.
fn init_logging(config: &Config) {
    if !config.log {
        return;
    }
    let filter = std::env::var("CLCACHE_LOG")
        .ok()
        .and_then(|value| value.parse::<tracing_subscriber::EnvFilter>().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_flags_recognized() {
        for flag in ["-s", "-c", "-C", "-z", "-M", "--stats", "--clear", "--help"] {
            assert!(is_maintenance_flag(flag), "{flag}");
        }
    }

    #[test]
    fn compiler_switches_are_not_maintenance() {
        for arg in ["/c", "/O2", "a.c", "cl.exe", "-O2", "/Zi", "@args.rsp"] {
            assert!(!is_maintenance_flag(arg), "{arg}");
        }
    }

    #[test]
    fn parse_set_size() {
        let cli = MaintenanceCli::try_parse_from(["clcache", "-M", "1048576"]).unwrap();
        assert_eq!(cli.set_size, Some(1_048_576));
        assert!(!cli.show_stats);
    }

    #[test]
    fn parse_single_flags() {
        assert!(MaintenanceCli::try_parse_from(["clcache", "-s"]).unwrap().show_stats);
        assert!(MaintenanceCli::try_parse_from(["clcache", "-c"]).unwrap().clean);
        assert!(MaintenanceCli::try_parse_from(["clcache", "-C"]).unwrap().clear);
        assert!(MaintenanceCli::try_parse_from(["clcache", "-z"]).unwrap().reset_stats);
    }

    #[test]
    fn negative_size_is_rejected_by_parser() {
        assert!(MaintenanceCli::try_parse_from(["clcache", "-M", "-5"]).is_err());
    }
}
