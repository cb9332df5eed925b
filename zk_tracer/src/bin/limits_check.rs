//! Checks a set of module line counts against a limits file, the way the
//! sequencer checks a transaction.
//!
//! Counts are JSON objects mapping module names to line counts. Without
//! `--previous`, the counts are validated in isolation.
//!
//! Example usage:
//! ```
//! RUST_LOG=info cargo run --bin limits_check -- --limits ./limits.toml --counts ./after.json --previous ./before.json
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use tracing::info;
use zk_tracer::{validate, LineCounts, ModuleLimits};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Limits file, `.toml` or `.json`.
    #[arg(short, long, env = "ZK_TRACER_LIMITS", value_hint = ValueHint::FilePath)]
    limits: PathBuf,
    /// Line counts after the transaction.
    #[arg(short, long, env = "ZK_TRACER_COUNTS", value_hint = ValueHint::FilePath)]
    counts: PathBuf,
    /// Line counts before the transaction.
    #[arg(short, long, env = "ZK_TRACER_PREVIOUS", value_hint = ValueHint::FilePath)]
    previous: Option<PathBuf>,
    /// Pretty-print the verdict.
    #[arg(long, env = "ZK_TRACER_PRETTY", default_value_t = false)]
    pretty: bool,
}

fn read_counts(path: &Path) -> Result<LineCounts> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let des = &mut serde_json::Deserializer::from_reader(BufReader::new(file));
    let counts = serde_path_to_error::deserialize(des)
        .with_context(|| format!("malformed line counts in {}", path.display()))?;
    Ok(counts)
}

fn main() -> Result<ExitCode> {
    zk_tracer::tracing::init();

    let args = Cli::parse();
    let limits = ModuleLimits::from_file(&args.limits)?;
    let current = read_counts(&args.counts)?;
    let previous = match &args.previous {
        Some(path) => read_counts(path)?,
        None => LineCounts::new(),
    };
    info!(
        "checking {} modules against {} limits",
        current.len(),
        limits.len()
    );

    let verdict = validate(&limits, &current, &previous);
    let out = if args.pretty {
        serde_json::to_string_pretty(&verdict)?
    } else {
        serde_json::to_string(&verdict)?
    };
    println!("{out}");

    Ok(if verdict.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
