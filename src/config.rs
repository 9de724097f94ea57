// config.rs: single authoritative set of thresholds for every estimator.
//
// All structs are `#[serde(default)]` so a JSON file only needs to name the
// values it overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, MonitorResult};

// ─── Tilt ────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiltConfig {
    /// |z| that maps to 100% viewing
    pub full_scale: f64,
    /// percent ≤ this → Viewing
    pub viewing_threshold: f64,
    /// percent < this (and above viewing) → Intermediate
    pub intermediate_threshold: f64,
    pub stability_buffer_size: usize,
    /// z stddev below this counts as a steady hold
    pub stability_threshold: f64,
}

impl Default for TiltConfig {
    fn default() -> Self {
        Self {
            full_scale: 1.0,
            viewing_threshold: 80.0,
            intermediate_threshold: 90.0,
            stability_buffer_size: 50,
            stability_threshold: 1.5,
        }
    }
}

// ─── Speed ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    pub max_accuracy_m: f64,
    pub max_plausible_speed_ms: f64,
    pub history_size: usize,
    /// Accepted fixes kept for distance/time speed
    pub fix_history_size: usize,
    /// Older fixes than this no longer anchor a distance/time speed
    pub max_fix_gap_secs: f64,
    pub max_delta_kmh: f64,
    /// Held outputs in a row before a sustained jump is accepted
    pub max_consecutive_holds: u32,
    pub driving_threshold_kmh: f64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            max_accuracy_m: 50.0,
            max_plausible_speed_ms: 50.0,
            history_size: 5,
            fix_history_size: 3,
            max_fix_gap_secs: 30.0,
            max_delta_kmh: 36.0,
            max_consecutive_holds: 2,
            driving_threshold_kmh: 10.0,
        }
    }
}

// ─── Network ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub sample_size: usize,
    /// Sustained average download (KB/s) after the location baseline
    pub min_download_kbps: f64,
    pub min_upload_kbps: f64,
    pub confirmation_window: usize,
    pub confirmation_required: usize,
    pub sample_interval_secs: f64,
    pub probe_timeout_secs: f64,
    pub probe_url: String,
    pub latency_window: usize,
    pub noisy_latency_ms: f64,

    // ── Location-service background traffic ──
    pub location_traffic_window_secs: f64,
    pub driving_location_download_kbps: f64,
    pub driving_location_upload_kbps: f64,
    pub idle_location_download_kbps: f64,
    pub idle_location_upload_kbps: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            sample_size: 6,
            min_download_kbps: 300.0,
            min_upload_kbps: 10.0,
            confirmation_window: 5,
            confirmation_required: 3,
            sample_interval_secs: 3.0,
            probe_timeout_secs: 5.0,
            probe_url: "http://connectivitycheck.gstatic.com/generate_204".to_string(),
            latency_window: 5,
            noisy_latency_ms: 1000.0,
            location_traffic_window_secs: 10.0,
            driving_location_download_kbps: 8.0,
            driving_location_upload_kbps: 2.0,
            idle_location_download_kbps: 2.0,
            idle_location_upload_kbps: 0.5,
        }
    }
}

// ─── Fusion ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub cooldown_secs: f64,
    /// Lock state assumed before the first lock/unlock notification
    pub initially_unlocked: bool,
    pub call_alerts: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 5.0,
            initially_unlocked: true,
            call_alerts: true,
        }
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_consecutive_errors: u32,
    pub restart_backoff_secs: f64,
    /// 1.0 keeps the backoff fixed
    pub restart_backoff_multiplier: f64,
    pub restart_backoff_cap_secs: f64,
    pub max_restart_attempts: u32,
    pub silence_threshold_secs: f64,
    pub health_check_interval_ms: u64,
    pub channel_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 3,
            restart_backoff_secs: 3.0,
            restart_backoff_multiplier: 1.0,
            restart_backoff_cap_secs: 30.0,
            max_restart_attempts: 60,
            silence_threshold_secs: 25.0,
            health_check_interval_ms: 1000,
            channel_capacity: 512,
        }
    }
}

// ─── Root ────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub tilt: TiltConfig,
    pub speed: SpeedConfig,
    pub network: NetworkConfig,
    pub fusion: FusionConfig,
    pub supervisor: SupervisorConfig,
}

impl MonitorConfig {
    pub fn from_json_str(json: &str) -> MonitorResult<Self> {
        let config: MonitorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> MonitorResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject values the estimators cannot work with
    pub fn validate(&self) -> MonitorResult<()> {
        let t = &self.tilt;
        require(t.full_scale > 0.0, "tilt.full_scale must be positive")?;
        require(
            t.viewing_threshold <= t.intermediate_threshold,
            "tilt.viewing_threshold must not exceed tilt.intermediate_threshold",
        )?;
        require(
            (0.0..=100.0).contains(&t.viewing_threshold)
                && (0.0..=100.0).contains(&t.intermediate_threshold),
            "tilt thresholds must lie in [0, 100]",
        )?;
        require(t.stability_buffer_size >= 2, "tilt.stability_buffer_size must be at least 2")?;
        require(t.stability_threshold >= 0.0, "tilt.stability_threshold must not be negative")?;

        let s = &self.speed;
        require(s.max_accuracy_m >= 0.0, "speed.max_accuracy_m must not be negative")?;
        require(s.max_plausible_speed_ms > 0.0, "speed.max_plausible_speed_ms must be positive")?;
        require(s.history_size > 0, "speed.history_size must be positive")?;
        require(s.fix_history_size >= 2, "speed.fix_history_size must be at least 2")?;
        require(s.max_fix_gap_secs > 0.0, "speed.max_fix_gap_secs must be positive")?;
        require(s.max_delta_kmh > 0.0, "speed.max_delta_kmh must be positive")?;
        require(s.driving_threshold_kmh >= 0.0, "speed.driving_threshold_kmh must not be negative")?;

        let n = &self.network;
        require(n.sample_size > 0, "network.sample_size must be positive")?;
        require(n.confirmation_window > 0, "network.confirmation_window must be positive")?;
        require(
            n.confirmation_required > 0 && n.confirmation_required <= n.confirmation_window,
            "network.confirmation_required must be in 1..=confirmation_window",
        )?;
        require(
            n.min_download_kbps >= 0.0 && n.min_upload_kbps >= 0.0,
            "network rate thresholds must not be negative",
        )?;
        require(n.sample_interval_secs > 0.0, "network.sample_interval_secs must be positive")?;
        require(n.probe_timeout_secs > 0.0, "network.probe_timeout_secs must be positive")?;
        require(n.latency_window > 0, "network.latency_window must be positive")?;
        require(
            n.location_traffic_window_secs >= 0.0,
            "network.location_traffic_window_secs must not be negative",
        )?;

        require(self.fusion.cooldown_secs > 0.0, "fusion.cooldown_secs must be positive")?;

        let v = &self.supervisor;
        require(v.max_consecutive_errors > 0, "supervisor.max_consecutive_errors must be positive")?;
        require(v.restart_backoff_secs > 0.0, "supervisor.restart_backoff_secs must be positive")?;
        require(
            v.restart_backoff_multiplier >= 1.0,
            "supervisor.restart_backoff_multiplier must be at least 1.0",
        )?;
        require(
            v.restart_backoff_cap_secs >= v.restart_backoff_secs,
            "supervisor.restart_backoff_cap_secs must not be below restart_backoff_secs",
        )?;
        require(v.silence_threshold_secs > 0.0, "supervisor.silence_threshold_secs must be positive")?;
        require(v.health_check_interval_ms > 0, "supervisor.health_check_interval_ms must be positive")?;
        require(v.channel_capacity > 0, "supervisor.channel_capacity must be positive")?;
        Ok(())
    }
}

fn require(ok: bool, message: &str) -> MonitorResult<()> {
    if ok {
        Ok(())
    } else {
        Err(MonitorError::InvalidConfig(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        MonitorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_overrides_only_named_values() {
        let config = MonitorConfig::from_json_str(
            r#"{ "fusion": { "cooldown_secs": 10.0 }, "tilt": { "viewing_threshold": 70 } }"#,
        )
        .unwrap();
        assert_eq!(config.fusion.cooldown_secs, 10.0);
        assert_eq!(config.tilt.viewing_threshold, 70.0);
        assert_eq!(config.tilt.intermediate_threshold, 90.0);
        assert_eq!(config.speed, SpeedConfig::default());
    }

    #[test]
    fn test_inverted_tilt_thresholds_rejected() {
        let err = MonitorConfig::from_json_str(
            r#"{ "tilt": { "viewing_threshold": 95, "intermediate_threshold": 90 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidConfig(_)));
    }

    #[test]
    fn test_confirmation_larger_than_window_rejected() {
        let mut config = MonitorConfig::default();
        config.network.confirmation_required = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_cooldown_rejected() {
        let mut config = MonitorConfig::default();
        config.fusion.cooldown_secs = 0.0;
        assert!(config.validate().is_err());
    }
}
