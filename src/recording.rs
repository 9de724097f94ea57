use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::events::EventSink;
use crate::monitor::{EngineCounters, FusionEngine};
use crate::sensors::SensorInput;

/// One line of a recorded session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedInput {
    pub timestamp_ms: i64,
    pub input: SensorInput,
}

impl RecordedInput {
    pub fn new(input: SensorInput, at: DateTime<Utc>) -> Self {
        Self {
            timestamp_ms: at.timestamp_millis(),
            input,
        }
    }

    pub fn observed_at(&self) -> MonitorResult<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp_ms)
            .single()
            .ok_or_else(|| MonitorError::Parse(format!("timestamp {} out of range", self.timestamp_ms)))
    }
}

/// Receives every raw input exactly as the engine saw it
pub trait InputRecorder: Send {
    fn record(&mut self, entry: &RecordedInput);
}

pub struct JsonLinesRecorder<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesRecorder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> InputRecorder for JsonLinesRecorder<W> {
    fn record(&mut self, entry: &RecordedInput) {
        let result = serde_json::to_writer(&mut self.writer, entry)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"));
        if let Err(e) = result {
            warn!("Failed to record input: {}", e);
        }
    }
}

/// Parse a recording; blank lines are skipped, anything else malformed is an error
pub fn parse_recording<R: BufRead>(reader: R) -> MonitorResult<Vec<RecordedInput>> {
    let mut entries = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: RecordedInput = serde_json::from_str(&line)
            .map_err(|e| MonitorError::Parse(format!("line {}: {}", index + 1, e)))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Load a `.jsonl` recording, gzip-compressed when the name ends in `.gz`
pub fn load_recording(path: &Path) -> MonitorResult<Vec<RecordedInput>> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        parse_recording(BufReader::new(GzDecoder::new(file)))
    } else {
        parse_recording(BufReader::new(file))
    }
}

/// Outcome of replaying a recording through a fresh engine
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub inputs: usize,
    pub span_secs: f64,
    pub out_of_order_inputs: u64,
    /// Event counts keyed by wire type
    pub events: BTreeMap<String, u64>,
    pub counters: EngineCounters,
    pub final_speed_kmh: f64,
    pub final_is_driving: bool,
}

/// Feed recorded inputs through a new [`FusionEngine`] at their recorded
/// timestamps, delivering every event to `sink`.
pub fn replay(
    entries: &[RecordedInput],
    config: &MonitorConfig,
    sink: &mut dyn EventSink,
) -> MonitorResult<ReplaySummary> {
    config.validate()?;
    let mut engine = FusionEngine::new(config);
    let mut summary = ReplaySummary {
        inputs: entries.len(),
        ..ReplaySummary::default()
    };
    let mut last_ts: Option<i64> = None;

    for entry in entries {
        if last_ts.map(|ts| entry.timestamp_ms < ts).unwrap_or(false) {
            summary.out_of_order_inputs += 1;
        }
        last_ts = Some(entry.timestamp_ms);

        let now = entry.observed_at()?;
        for event in engine.handle(&entry.input, now) {
            *summary.events.entry(event.type_name().to_string()).or_insert(0) += 1;
            sink.deliver(&event);
        }
    }

    if let (Some(first), Some(last)) = (entries.first(), entries.last()) {
        summary.span_secs = (last.timestamp_ms - first.timestamp_ms) as f64 / 1000.0;
    }
    let speed = engine.speed_state();
    summary.counters = engine.counters();
    summary.final_speed_kmh = speed.smoothed_kmh;
    summary.final_is_driving = speed.is_driving;
    Ok(summary)
}
