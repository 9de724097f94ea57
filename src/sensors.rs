use std::process::Stdio;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::error::{MonitorError, MonitorResult};
use crate::network::{ProbeOutcome, TrafficSample};
use crate::probe::ConnectivityProbe;
use crate::speed::LocationFix;
use crate::traffic::{TrafficCounter, TrafficMeter};

const STANDARD_GRAVITY: f64 = 9.80665;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Accelerometer,
    Location,
    Network,
    Lock,
    Call,
    Connectivity,
}

impl SensorKind {
    pub fn name(&self) -> &'static str {
        match self {
            SensorKind::Accelerometer => "accelerometer",
            SensorKind::Location => "location",
            SensorKind::Network => "network",
            SensorKind::Lock => "lock",
            SensorKind::Call => "call",
            SensorKind::Connectivity => "connectivity",
        }
    }

    /// Streams the supervisor watches for silence and read errors.
    /// Lock/call/connectivity are edge notifications and may legitimately
    /// stay quiet for hours.
    pub fn is_supervised(&self) -> bool {
        matches!(
            self,
            SensorKind::Accelerometer | SensorKind::Location | SensorKind::Network
        )
    }
}

/// Accelerometer reading, in units of g
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccelSample {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Ringing,
    OffHook,
}

impl CallState {
    pub fn in_call(&self) -> bool {
        matches!(self, CallState::OffHook)
    }
}

/// One raw input to the fusion core
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorInput {
    Accel(AccelSample),
    Location(LocationFix),
    Traffic {
        sample: TrafficSample,
        elapsed_secs: f64,
    },
    Probe {
        outcome: ProbeOutcome,
    },
    Connectivity {
        available: bool,
    },
    Lock {
        unlocked: bool,
    },
    Call {
        state: CallState,
    },
}

impl SensorInput {
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorInput::Accel(_) => SensorKind::Accelerometer,
            SensorInput::Location(_) => SensorKind::Location,
            SensorInput::Traffic { .. } | SensorInput::Probe { .. } => SensorKind::Network,
            SensorInput::Connectivity { .. } => SensorKind::Connectivity,
            SensorInput::Lock { .. } => SensorKind::Lock,
            SensorInput::Call { .. } => SensorKind::Call,
        }
    }
}

// ─── Hand-off to the monitor task ────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum SensorPayload {
    Sample(SensorInput),
    Error(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SensorMessage {
    pub kind: SensorKind,
    pub generation: u64,
    pub payload: SensorPayload,
}

/// Cross-thread sender handed to a driver on every (re)start.
///
/// Tagged with the subscription generation so the monitor can discard
/// anything an earlier, torn-down subscription still has in flight.
#[derive(Clone, Debug)]
pub struct SampleSender {
    kind: SensorKind,
    generation: u64,
    tx: Sender<SensorMessage>,
}

impl SampleSender {
    pub fn new(kind: SensorKind, generation: u64, tx: Sender<SensorMessage>) -> Self {
        Self {
            kind,
            generation,
            tx,
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the monitor is gone. A full queue drops the sample.
    pub fn deliver(&self, input: SensorInput) -> bool {
        self.send(SensorPayload::Sample(input))
    }

    pub fn report_error(&self, reason: impl Into<String>) -> bool {
        self.send(SensorPayload::Error(reason.into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, payload: SensorPayload) -> bool {
        let message = SensorMessage {
            kind: self.kind,
            generation: self.generation,
            payload,
        };
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("[{}] queue full, dropping message", self.kind.name());
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Platform subscription for one raw-sample stream.
///
/// `start` is always called from inside the monitor's tokio runtime;
/// `stop` must leave nothing running that could still deliver.
pub trait SensorDriver: Send {
    fn kind(&self) -> SensorKind;
    fn start(&mut self, sender: SampleSender) -> MonitorResult<()>;
    fn stop(&mut self);
}

fn abort_all(tasks: &mut Vec<JoinHandle<()>>) {
    for task in tasks.drain(..) {
        task.abort();
    }
}

// ─── Termux accelerometer ────────────────────────────────────────────────────

/// Streams `termux-sensor -s accelerometer` and converts m/s² to g
pub struct TermuxAccelDriver {
    delay_ms: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl TermuxAccelDriver {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            tasks: Vec::new(),
        }
    }
}

impl SensorDriver for TermuxAccelDriver {
    fn kind(&self) -> SensorKind {
        SensorKind::Accelerometer
    }

    fn start(&mut self, sender: SampleSender) -> MonitorResult<()> {
        abort_all(&mut self.tasks);
        let mut child = Command::new("termux-sensor")
            .arg("-s")
            .arg("accelerometer")
            .arg("-d")
            .arg(self.delay_ms.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MonitorError::SensorFailed(format!("termux-sensor: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MonitorError::SensorFailed("termux-sensor: no stdout".to_string()))?;

        let task = tokio::spawn(async move {
            // Owned here so aborting the task kills the process
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            let mut accumulator = JsonObjectAccumulator::default();
            let mut sample_count = 0u64;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        sender.report_error("termux-sensor stream ended");
                        break;
                    }
                    Err(e) => {
                        sender.report_error(format!("termux-sensor read failed: {}", e));
                        break;
                    }
                };
                let object = match accumulator.push_line(&line) {
                    Some(object) => object,
                    None => continue,
                };
                let delivered = match parse_accel_reading(&object, current_timestamp()) {
                    Some(sample) => {
                        sample_count += 1;
                        if sample_count % 1000 == 0 {
                            debug!("[accel] {} samples", sample_count);
                        }
                        sender.deliver(SensorInput::Accel(sample))
                    }
                    None => sender.report_error("unparseable accelerometer reading"),
                };
                if !delivered {
                    break;
                }
            }
        });
        self.tasks.push(task);
        info!("Accelerometer stream started ({} ms)", self.delay_ms);
        Ok(())
    }

    fn stop(&mut self) {
        abort_all(&mut self.tasks);
    }
}

/// Reassembles the pretty-printed objects `termux-sensor` writes, one line
/// at a time, by tracking brace depth.
#[derive(Default)]
pub struct JsonObjectAccumulator {
    buffer: String,
    depth: i32,
}

impl JsonObjectAccumulator {
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        for c in line.chars() {
            match c {
                '{' => self.depth += 1,
                '}' => self.depth -= 1,
                _ => {}
            }
        }
        if self.depth < 0 {
            self.reset();
            return None;
        }
        if self.buffer.is_empty() && self.depth == 0 {
            let trimmed = line.trim();
            return (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        self.buffer.push_str(line);
        self.buffer.push('\n');
        if self.depth == 0 {
            let object = std::mem::take(&mut self.buffer);
            return Some(object);
        }
        None
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.depth = 0;
    }
}

/// `{"<sensor name>": {"values": [x, y, z]}}` in m/s²
pub fn parse_accel_reading(text: &str, timestamp: f64) -> Option<AccelSample> {
    let root: Value = serde_json::from_str(text).ok()?;
    let values = root
        .as_object()?
        .values()
        .find_map(|sensor| sensor.get("values"))?
        .as_array()?;
    if values.len() < 3 {
        return None;
    }
    let axis = |i: usize| values[i].as_f64().map(|v| v / STANDARD_GRAVITY);
    Some(AccelSample {
        timestamp,
        x: axis(0)?,
        y: axis(1)?,
        z: axis(2)?,
    })
}

// ─── Termux location ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TermuxLocation {
    latitude: f64,
    longitude: f64,
    accuracy: f64,
    speed: Option<f64>,
}

/// Polls `termux-location` for single fixes
pub struct TermuxLocationDriver {
    period: Duration,
    request_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl TermuxLocationDriver {
    pub fn new(period_secs: f64) -> Self {
        Self {
            period: Duration::from_secs_f64(period_secs.max(0.5)),
            request_timeout: Duration::from_secs(20),
            tasks: Vec::new(),
        }
    }
}

impl SensorDriver for TermuxLocationDriver {
    fn kind(&self) -> SensorKind {
        SensorKind::Location
    }

    fn start(&mut self, sender: SampleSender) -> MonitorResult<()> {
        abort_all(&mut self.tasks);
        let period = self.period;
        let request_timeout = self.request_timeout;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let request = Command::new("termux-location")
                    .arg("-p")
                    .arg("gps")
                    .arg("-r")
                    .arg("once")
                    .kill_on_drop(true)
                    .output();

                let delivered = match tokio::time::timeout(request_timeout, request).await {
                    Ok(Ok(output)) => {
                        let text = String::from_utf8_lossy(&output.stdout);
                        match parse_location_fix(&text, current_timestamp()) {
                            Some(fix) => sender.deliver(SensorInput::Location(fix)),
                            None => sender.report_error("unparseable location fix"),
                        }
                    }
                    Ok(Err(e)) => sender.report_error(format!("termux-location: {}", e)),
                    Err(_) => sender.report_error("termux-location timed out"),
                };
                if !delivered {
                    break;
                }
            }
        });
        self.tasks.push(task);
        info!("Location polling started every {:.1}s", period.as_secs_f64());
        Ok(())
    }

    fn stop(&mut self) {
        abort_all(&mut self.tasks);
    }
}

pub fn parse_location_fix(text: &str, timestamp: f64) -> Option<LocationFix> {
    let raw: TermuxLocation = serde_json::from_str(text.trim()).ok()?;
    Some(LocationFix {
        timestamp,
        latitude: raw.latitude,
        longitude: raw.longitude,
        reported_speed: raw.speed,
        horizontal_accuracy_m: raw.accuracy,
    })
}

// ─── Network ─────────────────────────────────────────────────────────────────

/// Samples interface counters and probes latency on independent timers
pub struct NetworkDriver<C: TrafficCounter + 'static> {
    meter: Arc<Mutex<TrafficMeter<C>>>,
    probe: Arc<ConnectivityProbe>,
    period: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: TrafficCounter + 'static> NetworkDriver<C> {
    pub fn new(counter: C, probe: ConnectivityProbe, period_secs: f64) -> Self {
        Self {
            meter: Arc::new(Mutex::new(TrafficMeter::new(counter))),
            probe: Arc::new(probe),
            period: Duration::from_secs_f64(period_secs.max(0.1)),
            tasks: Vec::new(),
        }
    }
}

impl<C: TrafficCounter + 'static> SensorDriver for NetworkDriver<C> {
    fn kind(&self) -> SensorKind {
        SensorKind::Network
    }

    fn start(&mut self, sender: SampleSender) -> MonitorResult<()> {
        abort_all(&mut self.tasks);
        match self.meter.lock() {
            Ok(mut meter) => meter.reset(),
            Err(_) => return Err(MonitorError::SensorFailed("traffic meter poisoned".to_string())),
        }

        let meter = self.meter.clone();
        let traffic_sender = sender.clone();
        let period = self.period;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let reading = match meter.lock() {
                    Ok(mut meter) => meter.sample_at(std::time::Instant::now()),
                    Err(_) => Err(MonitorError::SensorFailed("traffic meter poisoned".to_string())),
                };
                let delivered = match reading {
                    Ok(Some((sample, elapsed_secs))) => traffic_sender.deliver(SensorInput::Traffic {
                        sample,
                        elapsed_secs,
                    }),
                    Ok(None) => !traffic_sender.is_closed(),
                    Err(e) => traffic_sender.report_error(e.to_string()),
                };
                if !delivered {
                    break;
                }
            }
        }));

        let probe = self.probe.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let outcome = probe.measure().await;
                if !sender.deliver(SensorInput::Probe { outcome }) {
                    break;
                }
            }
        }));

        info!(
            "Network sampling started every {:.1}s, probing {}",
            period.as_secs_f64(),
            self.probe.url()
        );
        Ok(())
    }

    fn stop(&mut self) {
        if !self.tasks.is_empty() {
            debug!("Stopping network sampling");
        }
        abort_all(&mut self.tasks);
    }
}

pub fn current_timestamp() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
