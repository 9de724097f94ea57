use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use tokio::time::{interval, Duration, Instant};

use drive_guard_rs::events::{JsonLinesSink, LogNotifier};
use drive_guard_rs::probe::ConnectivityProbe;
use drive_guard_rs::recording::JsonLinesRecorder;
use drive_guard_rs::sensors::{NetworkDriver, SensorDriver, TermuxAccelDriver, TermuxLocationDriver};
use drive_guard_rs::traffic::ProcNetDevCounter;
use drive_guard_rs::{spawn_monitor, spawn_recording_monitor, MonitorConfig};

#[derive(Parser, Debug)]
#[command(name = "drive_guard")]
#[command(about = "Detects phone use while driving from tilt, speed and network activity", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON config file; fields it omits keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(long, default_value = "drive_guard_sessions")]
    output_dir: String,

    /// Count traffic on this interface only (default: all but loopback)
    #[arg(long)]
    interface: Option<String>,

    /// Connectivity probe URL (overrides the config file)
    #[arg(long)]
    probe_url: Option<String>,

    /// Accelerometer sampling delay in milliseconds
    #[arg(long, default_value = "100")]
    accel_delay_ms: u64,

    /// Seconds between location requests
    #[arg(long, default_value = "5")]
    gps_interval: f64,

    /// Also record raw inputs for the replay tool
    #[arg(long)]
    record: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MonitorConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => MonitorConfig::default(),
    };
    if let Some(url) = &args.probe_url {
        config.network.probe_url = url.clone();
    }
    config.validate()?;

    info!("Drive Guard starting");
    info!("  Duration: {} seconds (0=continuous)", args.duration);
    info!("  Output Dir: {}", args.output_dir);
    info!("  Probe: {}", config.network.probe_url);

    std::fs::create_dir_all(&args.output_dir)?;
    let session = ts_now_clean();
    let events_path = format!("{}/events_{}.jsonl", args.output_dir, session);
    let events_file = File::create(&events_path).with_context(|| format!("creating {}", events_path))?;
    let sink = JsonLinesSink::new(BufWriter::new(events_file));

    let drivers: Vec<Box<dyn SensorDriver>> = vec![
        Box::new(TermuxAccelDriver::new(args.accel_delay_ms)),
        Box::new(TermuxLocationDriver::new(args.gps_interval)),
        Box::new(NetworkDriver::new(
            ProcNetDevCounter::new(args.interface.clone()),
            ConnectivityProbe::new(&config.network.probe_url, config.network.probe_timeout_secs),
            config.network.sample_interval_secs,
        )),
    ];

    let mut handle = if args.record {
        let inputs_path = format!("{}/inputs_{}.jsonl", args.output_dir, session);
        let inputs_file = File::create(&inputs_path).with_context(|| format!("creating {}", inputs_path))?;
        info!("  Recording inputs to {}", inputs_path);
        spawn_recording_monitor(
            config,
            sink,
            LogNotifier,
            drivers,
            JsonLinesRecorder::new(BufWriter::new(inputs_file)),
        )?
    } else {
        spawn_monitor(config, sink, LogNotifier, drivers)?
    };
    info!("Writing events to {}", events_path);

    let status_path = format!("{}/live_status.json", args.output_dir);
    let start = Instant::now();
    let mut status_tick = interval(Duration::from_secs(2));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping...");
                break;
            }
            _ = status_tick.tick() => {
                let status = handle.status().await?;
                if let Err(e) = status.save(&status_path) {
                    warn!("Failed to write {}: {}", status_path, e);
                }
                if args.duration > 0 && start.elapsed().as_secs() >= args.duration {
                    info!("Duration reached, stopping...");
                    break;
                }
            }
        }
    }

    let final_status = handle.stop().await?;
    let final_path = format!("{}/live_status_final.json", args.output_dir);
    final_status.save(&final_path)?;

    let counters = final_status.counters;
    println!("\n=== Final Stats ===");
    println!("Uptime: {} s", final_status.uptime_seconds);
    println!("Tilt samples: {}", counters.tilt_samples);
    println!(
        "Location fixes: {} accepted, {} rejected",
        counters.accepted_fixes, counters.rejected_fixes
    );
    println!(
        "Traffic samples: {}, probes: {}",
        counters.traffic_samples, counters.probes
    );
    println!("Events: {}, danger alerts: {}", counters.events_emitted, counters.alerts_emitted);
    for sensor in &final_status.sensors {
        println!(
            "  {}: {} restart(s){}",
            sensor.sensor.name(),
            sensor.restart_count,
            if sensor.abandoned { ", abandoned" } else { "" }
        );
    }

    Ok(())
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
