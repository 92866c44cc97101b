//! bbk - Command-line driver for the block backup engine.
//!
//! Runs a script of JSON commands (one per line) against an in-process engine
//! and prints every response and job event as a JSON line on stdout. Lines
//! that are blank or start with `#` are skipped.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use blockbackup_engine::{execute_json, init_logging, BackupEngine, EngineConfig, LogFormat, Subscription};
use clap::Parser;
use tracing::{debug, info};

/// bbk - Run backup engine command scripts
#[derive(Parser, Debug)]
#[command(name = "bbk")]
#[command(version = "0.1.0")]
#[command(about = "Run JSON command scripts against a dirty-bitmap backup engine")]
struct Args {
    /// Script of JSON commands, one per line; `-` reads stdin
    #[arg(long, value_name = "FILE")]
    script: PathBuf,

    /// Engine configuration file (JSON)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format on stderr: human or json
    #[arg(long, value_name = "FORMAT", default_value = "human")]
    log_format: String,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,

    /// Exit with status 2 if any command returned an error
    #[arg(long)]
    strict: bool,
}

/// Totals for one script run.
#[derive(Debug, Default, PartialEq, Eq)]
struct RunSummary {
    commands: usize,
    errors: usize,
    events: usize,
}

fn main() {
    let args = Args::parse();

    let format = LogFormat::from_str(&args.log_format).unwrap_or_default();
    init_logging(format, if args.verbose { "debug" } else { "info" });

    let stdout = io::stdout();
    let exit_code = match run_cli(&args, &mut stdout.lock()) {
        Ok(summary) if args.strict && summary.errors > 0 => 2,
        Ok(_) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args, out: &mut impl Write) -> Result<RunSummary> {
    if LogFormat::from_str(&args.log_format).is_none() {
        bail!(
            "Invalid log format '{}'. Must be 'human' or 'json'",
            args.log_format
        );
    }

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Invalid config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let engine = BackupEngine::new(config).context("Engine configuration rejected")?;
    let events = engine.subscribe();

    let reader: Box<dyn BufRead> = if args.script.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&args.script)
            .with_context(|| format!("Failed to open script {}", args.script.display()))?;
        Box::new(BufReader::new(file))
    };

    let mut summary = RunSummary::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read script line {}", index + 1))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        debug!(line = index + 1, "running command");
        let response = execute_json(&engine, line);
        summary.commands += 1;
        if response.is_error() {
            summary.errors += 1;
        }
        writeln!(out, "{}", serde_json::to_string(&response)?)?;
        summary.events += print_events(&events, out)?;
    }
    summary.events += print_events(&events, out)?;

    info!(
        commands = summary.commands,
        errors = summary.errors,
        events = summary.events,
        "script finished"
    );
    Ok(summary)
}

/// Print every event delivered so far; returns how many were printed.
fn print_events(events: &Subscription, out: &mut impl Write) -> Result<usize> {
    let drained = events.drain();
    for event in &drained {
        writeln!(out, "{}", serde_json::to_string(event)?)?;
    }
    Ok(drained.len())
}
