use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::config::SupervisorConfig;
use crate::restart_manager::RestartManager;
use crate::sensors::SensorKind;

/// Tracks liveness of one supervised sensor stream
#[derive(Clone, Debug)]
pub struct SensorHealth {
    pub kind: SensorKind,
    last_update: Instant,
    consecutive_errors: u32,
    total_errors: u64,
    samples: u64,
    silence_threshold: Duration,
    max_consecutive_errors: u32,
}

impl SensorHealth {
    pub fn new(kind: SensorKind, config: &SupervisorConfig, now: Instant) -> Self {
        SensorHealth {
            kind,
            last_update: now,
            consecutive_errors: 0,
            total_errors: 0,
            samples: 0,
            silence_threshold: Duration::from_secs_f64(config.silence_threshold_secs),
            max_consecutive_errors: config.max_consecutive_errors,
        }
    }

    pub fn record_sample(&mut self, now: Instant) {
        self.last_update = now;
        self.consecutive_errors = 0;
        self.samples += 1;
    }

    pub fn record_error(&mut self) {
        self.consecutive_errors += 1;
        self.total_errors += 1;
    }

    /// Fresh subscription: the silence clock and error streak start over
    pub fn reset(&mut self, now: Instant) {
        self.last_update = now;
        self.consecutive_errors = 0;
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_update)
    }

    pub fn is_silent(&self, now: Instant) -> bool {
        self.silence(now) > self.silence_threshold
    }

    pub fn too_many_errors(&self) -> bool {
        self.consecutive_errors >= self.max_consecutive_errors
    }

    pub fn needs_restart(&self, now: Instant) -> bool {
        self.too_many_errors() || self.is_silent(now)
    }

    /// Human-readable reason for a restart, if one is due
    pub fn restart_reason(&self, now: Instant) -> Option<String> {
        if self.too_many_errors() {
            Some(format!("{} consecutive read errors", self.consecutive_errors))
        } else if self.is_silent(now) {
            Some(format!("silent for {:.1}s", self.silence(now).as_secs_f64()))
        } else {
            None
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Per-sensor line of the health report
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorHealthReport {
    pub sensor: SensorKind,
    pub healthy: bool,
    pub silence_secs: f64,
    pub consecutive_errors: u32,
    pub total_errors: u64,
    pub samples: u64,
    pub restart_count: u32,
    pub abandoned: bool,
}

/// Health of every supervised sensor, checked on the monitor's tick
#[derive(Default)]
pub struct HealthMonitor {
    sensors: BTreeMap<SensorKind, SensorHealth>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, kind: SensorKind, config: &SupervisorConfig, now: Instant) {
        self.sensors
            .insert(kind, SensorHealth::new(kind, config, now));
    }

    pub fn get(&self, kind: SensorKind) -> Option<&SensorHealth> {
        self.sensors.get(&kind)
    }

    pub fn get_mut(&mut self, kind: SensorKind) -> Option<&mut SensorHealth> {
        self.sensors.get_mut(&kind)
    }

    pub fn kinds(&self) -> Vec<SensorKind> {
        self.sensors.keys().copied().collect()
    }

    pub fn check_health(&self, now: Instant, restarts: &RestartManager) -> Vec<SensorHealthReport> {
        self.sensors
            .values()
            .map(|health| {
                let restart = restarts.get(health.kind);
                let abandoned = restart.map(|r| r.is_abandoned()).unwrap_or(false);
                SensorHealthReport {
                    sensor: health.kind,
                    healthy: !abandoned && !health.needs_restart(now),
                    silence_secs: health.silence(now).as_secs_f64(),
                    consecutive_errors: health.consecutive_errors,
                    total_errors: health.total_errors,
                    samples: health.samples,
                    restart_count: restart.map(|r| r.total_restarts()).unwrap_or(0),
                    abandoned,
                }
            })
            .collect()
    }

    /// One-line summary for logging
    pub fn format_status(&self, now: Instant, restarts: &RestartManager) -> String {
        let parts: Vec<String> = self
            .check_health(now, restarts)
            .iter()
            .map(|report| {
                let status = if report.abandoned {
                    "abandoned".to_string()
                } else if report.healthy {
                    "ok".to_string()
                } else {
                    format!("silent {:.1}s", report.silence_secs)
                };
                format!("{} {}", report.sensor.name(), status)
            })
            .collect();
        format!("Health: {}", parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SupervisorConfig {
        SupervisorConfig::default()
    }

    #[test]
    fn test_sensor_health_detection() {
        let start = Instant::now();
        let mut health = SensorHealth::new(SensorKind::Accelerometer, &config(), start);

        assert!(!health.is_silent(start + Duration::from_secs(25)));
        assert!(health.is_silent(start + Duration::from_millis(25_001)));

        health.record_sample(start + Duration::from_secs(30));
        assert!(!health.needs_restart(start + Duration::from_secs(31)));
        assert_eq!(health.samples(), 1);
    }

    #[test]
    fn test_consecutive_errors_trigger_restart() {
        let now = Instant::now();
        let mut health = SensorHealth::new(SensorKind::Location, &config(), now);

        health.record_error();
        health.record_error();
        assert!(!health.needs_restart(now));
        health.record_error();
        assert!(health.needs_restart(now));
        assert_eq!(
            health.restart_reason(now).as_deref(),
            Some("3 consecutive read errors")
        );

        // A good sample breaks the streak
        health.record_sample(now);
        assert!(!health.too_many_errors());
        assert_eq!(health.total_errors(), 3);
    }

    #[test]
    fn test_health_monitor_report() {
        let now = Instant::now();
        let mut monitor = HealthMonitor::new();
        let restarts = RestartManager::new();
        monitor.track(SensorKind::Accelerometer, &config(), now);
        monitor.track(SensorKind::Network, &config(), now);

        let report = monitor.check_health(now + Duration::from_secs(1), &restarts);
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|r| r.healthy));

        let status = monitor.format_status(now + Duration::from_secs(40), &restarts);
        assert_eq!(status, "Health: accelerometer silent 40.0s | network silent 40.0s");
    }
}
