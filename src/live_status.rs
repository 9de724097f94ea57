use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::MonitorResult;
use crate::health_monitor::SensorHealthReport;
use crate::monitor::{EngineCounters, FusionEngine};
use crate::sensors::current_timestamp;

/// Snapshot of the running monitor, polled by the host and written to disk
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub counters: EngineCounters,
    // Current verdict inputs
    pub is_driving: bool,
    pub is_active_browsing: bool,
    pub is_unlocked: bool,
    pub is_in_call: bool,
    pub speed_kmh: f64,
    pub tilt_percent: f64,
    pub z_stability: f64,
    pub download_rate_kbs: f64,
    pub upload_rate_kbs: f64,
    pub latency_ms: f64,
    pub is_noisy: bool,
    // Supervision
    pub sensors: Vec<SensorHealthReport>,
}

impl LiveStatus {
    pub fn from_engine(engine: &FusionEngine, uptime_seconds: u64) -> Self {
        let speed = engine.speed_state();
        let network = engine.network_state();
        let tilt = engine.tilt_state();
        Self {
            timestamp: current_timestamp(),
            uptime_seconds,
            counters: engine.counters(),
            is_driving: speed.is_driving,
            is_active_browsing: network.is_active_browsing,
            is_unlocked: engine.lock_state().is_unlocked,
            is_in_call: engine.in_call(),
            speed_kmh: speed.smoothed_kmh,
            tilt_percent: tilt.map(|t| t.viewing_percent).unwrap_or(0.0),
            z_stability: tilt.map(|t| t.stability_score).unwrap_or(0.0),
            download_rate_kbs: network.download_rate_kbs,
            upload_rate_kbs: network.upload_rate_kbs,
            latency_ms: network.latency_ms,
            is_noisy: network.is_noisy,
            sensors: Vec::new(),
        }
    }

    pub fn with_sensors(mut self, sensors: Vec<SensorHealthReport>) -> Self {
        self.sensors = sensors;
        self
    }

    pub fn all_sensors_healthy(&self) -> bool {
        self.sensors.iter().all(|s| s.healthy)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> MonitorResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
