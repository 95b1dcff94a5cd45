//! Command-line front end: argument parsing, logging setup, and mapping
//! the driver's `Result` onto a process exit code.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;

use crate::config::Config;

/// External merge sort for files of fixed-width binary keys.
#[derive(Debug, Parser)]
#[command(name = "extsort", version, about)]
struct Args {
    /// Path to the input file of packed little-endian keys.
    input: PathBuf,

    /// Path to write the sorted output to.
    output: PathBuf,

    /// Prefix for intermediate run files. Defaults to the output path
    /// with a `.run-` suffix in the same directory.
    #[arg(long)]
    prefix: Option<PathBuf>,

    /// Buffer capacity in keys (`B`).
    #[arg(short = 'b', long = "buffer-capacity", default_value_t = 1024)]
    buffer_capacity: usize,

    /// Merge fan-in (`K`): how many runs a single stage-2 job consumes.
    #[arg(short = 'k', long = "fan-in", default_value_t = 8)]
    fan_in: usize,

    /// Key width in bytes: 4 for `u32`, 8 for `u64`.
    #[arg(long = "key-bytes", default_value_t = 4)]
    key_bytes: u8,

    /// Re-check sortedness and multiset equality after each stage.
    #[arg(long)]
    validate: bool,

    /// Increase log verbosity (repeatable: -v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Parses `std::env::args`, runs the sort, and returns a `Result` ready
/// to be unwrapped at `main`'s boundary.
pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::new().filter_level(level_for(args.verbose)).init();

    let prefix = args.prefix.clone().unwrap_or_else(|| Config::default_prefix(&args.output));
    let config = Config {
        input: args.input,
        output: args.output,
        prefix,
        buffer_capacity: args.buffer_capacity,
        fan_in: args.fan_in,
        validate: args.validate,
        key_bytes: args.key_bytes,
    };
    config.validate().context("invalid configuration")?;

    match config.key_bytes {
        4 => crate::sort::<u32>(&config).context("sort failed")?,
        8 => crate::sort::<u64>(&config).context("sort failed")?,
        other => anyhow::bail!("unsupported key width: {other}"),
    }

    Ok(())
}
