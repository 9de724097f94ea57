use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use drive_guard_rs::events::{EventSink, JsonLinesSink};
use drive_guard_rs::recording::{load_recording, replay, ReplaySummary};
use drive_guard_rs::{MonitorConfig, MonitorEvent};

#[derive(Parser, Debug)]
struct Args {
    /// Path to inputs_*.jsonl[.gz] recording
    #[arg(long)]
    log: PathBuf,

    /// JSON config file (defaults if omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write events to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print only the summary
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

struct NullSink;

impl EventSink for NullSink {
    fn deliver(&mut self, _event: &MonitorEvent) {}
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => MonitorConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => MonitorConfig::default(),
    };
    let entries = load_recording(&args.log)
        .with_context(|| format!("loading recording {}", args.log.display()))?;

    let summary: ReplaySummary = if args.quiet {
        replay(&entries, &config, &mut NullSink)?
    } else if let Some(path) = &args.output {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut sink = JsonLinesSink::new(BufWriter::new(file));
        replay(&entries, &config, &mut sink)?
    } else {
        let mut sink = JsonLinesSink::new(io::stdout());
        replay(&entries, &config, &mut sink)?
    };

    let mut out = io::stderr().lock();
    writeln!(out, "=== Replay summary: {} ===", args.log.display())?;
    writeln!(out, "{}", serde_json::to_string_pretty(&summary)?)?;
    Ok(())
}
