// events.rs: typed event records delivered to the host application.
//
// One JSON object per event, tagged by `type`. The sink is write-only: nothing
// in the monitor reads back what it delivered.

use std::io::Write;

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::danger::DangerCause;
use crate::network::ActivityKind;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiltTelemetry {
    pub timestamp: i64,
    pub tilt_value: f64,
    pub tilt_percent: f64,
    pub speed: f64,
    pub is_active_browsing: bool,
    pub is_in_call: bool,
    pub z_stability: f64,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrivingStatus {
    pub timestamp: i64,
    pub speed: f64,
    pub is_driving: bool,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub is_driving: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAnalysis {
    pub timestamp: i64,
    pub is_active_browsing: bool,
    pub network_download_speed: f64,
    pub network_upload_speed: f64,
    pub activity_type: ActivityKind,
    pub latency_ms: f64,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockNotice {
    pub timestamp: i64,
    pub message: String,
    pub is_unlocked: bool,
    pub speed: f64,
    pub is_driving: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallNotice {
    pub timestamp: i64,
    pub message: String,
    pub is_in_call: bool,
    /// "connected" or "disconnected"
    pub call_state: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DangerAlert {
    pub timestamp: i64,
    pub message: String,
    pub cause: DangerCause,
    pub tilt_value: f64,
    pub tilt_percent: f64,
    pub z_stability: f64,
    pub speed: f64,
    pub is_driving: bool,
    pub is_active_browsing: bool,
    pub network_download_speed: f64,
    pub network_upload_speed: f64,
    pub is_unlocked: bool,
    pub is_in_call: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub timestamp: i64,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorEvent {
    TiltEvent(TiltTelemetry),
    DrivingStatus(DrivingStatus),
    LocationUpdate(LocationUpdate),
    #[serde(alias = "TRAFFIC_ANALYSIS")]
    NetworkAnalysis(NetworkAnalysis),
    LockEvent(LockNotice),
    CallEvent(CallNotice),
    DangerEvent(DangerAlert),
    MonitorStatus(MonitorStatus),
}

impl MonitorEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            MonitorEvent::TiltEvent(_) => "TILT_EVENT",
            MonitorEvent::DrivingStatus(_) => "DRIVING_STATUS",
            MonitorEvent::LocationUpdate(_) => "LOCATION_UPDATE",
            MonitorEvent::NetworkAnalysis(_) => "NETWORK_ANALYSIS",
            MonitorEvent::LockEvent(_) => "LOCK_EVENT",
            MonitorEvent::CallEvent(_) => "CALL_EVENT",
            MonitorEvent::DangerEvent(_) => "DANGER_EVENT",
            MonitorEvent::MonitorStatus(_) => "MONITOR_STATUS",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            MonitorEvent::TiltEvent(e) => e.timestamp,
            MonitorEvent::DrivingStatus(e) => e.timestamp,
            MonitorEvent::LocationUpdate(e) => e.timestamp,
            MonitorEvent::NetworkAnalysis(e) => e.timestamp,
            MonitorEvent::LockEvent(e) => e.timestamp,
            MonitorEvent::CallEvent(e) => e.timestamp,
            MonitorEvent::DangerEvent(e) => e.timestamp,
            MonitorEvent::MonitorStatus(e) => e.timestamp,
        }
    }

    pub fn is_danger(&self) -> bool {
        matches!(self, MonitorEvent::DangerEvent(_))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ─── Sinks ───────────────────────────────────────────────────────────────────

/// Receives fully formed events. Delivery must not fail the monitor.
pub trait EventSink: Send {
    fn deliver(&mut self, event: &MonitorEvent);
}

/// High-priority user notification raised alongside each danger event
pub trait AlertNotifier: Send {
    fn notify(&mut self, alert: &DangerAlert);
}

impl EventSink for Vec<MonitorEvent> {
    fn deliver(&mut self, event: &MonitorEvent) {
        self.push(event.clone());
    }
}

/// Writes one JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn deliver(&mut self, event: &MonitorEvent) {
        let result = serde_json::to_writer(&mut self.writer, event)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush());
        if let Err(e) = result {
            warn!("Failed to write {} event: {}", event.type_name(), e);
        }
    }
}

/// Forwards events to the host over an unbounded channel
pub struct ChannelSink {
    tx: UnboundedSender<MonitorEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<MonitorEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&mut self, event: &MonitorEvent) {
        if self.tx.send(event.clone()).is_err() {
            warn!("Event receiver dropped, discarding {}", event.type_name());
        }
    }
}

/// Notifier for hosts without a notification surface
pub struct LogNotifier;

impl AlertNotifier for LogNotifier {
    fn notify(&mut self, alert: &DangerAlert) {
        warn!(
            "{} (speed {:.1} km/h, tilt {:.0}%)",
            alert.message, alert.speed, alert.tilt_percent
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn tilt_event() -> MonitorEvent {
        MonitorEvent::TiltEvent(TiltTelemetry {
            timestamp: 1_700_000_000_123,
            tilt_value: 0.42,
            tilt_percent: 42.0,
            speed: 35.5,
            is_active_browsing: true,
            is_in_call: false,
            z_stability: 0.05,
            message: "Device: VIEWING".to_string(),
        })
    }

    #[test]
    fn test_tilt_event_wire_shape() {
        let json: Value = serde_json::from_str(&tilt_event().to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "TILT_EVENT");
        assert_eq!(json["timestamp"], 1_700_000_000_123i64);
        assert_eq!(json["tiltValue"], 0.42);
        assert_eq!(json["tiltPercent"], 42.0);
        assert_eq!(json["speed"], 35.5);
        assert_eq!(json["isActiveBrowsing"], true);
        assert_eq!(json["zStability"], 0.05);
        assert_eq!(json["message"], "Device: VIEWING");
    }

    #[test]
    fn test_location_accuracy_is_optional() {
        let event = MonitorEvent::LocationUpdate(LocationUpdate {
            timestamp: 1,
            latitude: 10.0,
            longitude: 106.0,
            speed: 12.0,
            is_driving: true,
            accuracy: None,
        });
        let json: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "LOCATION_UPDATE");
        assert!(json.get("accuracy").is_none());
        assert_eq!(json["isDriving"], true);
    }

    #[test]
    fn test_traffic_analysis_alias_reads_back() {
        let raw = r#"{"type":"TRAFFIC_ANALYSIS","timestamp":5,"isActiveBrowsing":false,
            "networkDownloadSpeed":1.5,"networkUploadSpeed":0.2,"activityType":"Light",
            "latencyMs":0.0,"message":"No web activity"}"#;
        let event: MonitorEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.type_name(), "NETWORK_ANALYSIS");
        assert_eq!(event.timestamp(), 5);
    }

    #[test]
    fn test_danger_event_shape() {
        let event = MonitorEvent::DangerEvent(DangerAlert {
            timestamp: 9,
            message: DangerCause::Browsing.message().to_string(),
            cause: DangerCause::Browsing,
            tilt_value: 0.3,
            tilt_percent: 30.0,
            z_stability: 0.1,
            speed: 40.0,
            is_driving: true,
            is_active_browsing: true,
            network_download_speed: 400.0,
            network_upload_speed: 100.0,
            is_unlocked: true,
            is_in_call: false,
        });
        let json: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "DANGER_EVENT");
        assert_eq!(json["cause"], "Browsing");
        assert_eq!(json["networkDownloadSpeed"], 400.0);
        assert!(event.is_danger());
    }

    #[test]
    fn test_json_lines_sink_writes_one_line_per_event() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.deliver(&tilt_event());
        sink.deliver(&tilt_event());
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: MonitorEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(back, tilt_event());
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx);
        drop(rx);
        sink.deliver(&tilt_event());
    }
}
