use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::NetworkConfig;
use crate::smoothing::SampleWindow;

/// Traffic rates averaged over one sampling interval
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub download_kbps: f64,
    pub upload_kbps: f64,
}

impl TrafficSample {
    pub fn new(download_kbps: f64, upload_kbps: f64) -> Self {
        Self {
            download_kbps,
            upload_kbps,
        }
    }
}

/// Result of one connectivity latency probe
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Latency { ms: f64 },
    /// Timeout, DNS failure, refused connection...
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    Light,
    Browsing,
    MediaBrowsing,
    LargeDownload,
}

impl ActivityKind {
    /// Classify by kilobytes received during one sampling interval
    pub fn from_interval_kb(kb: f64) -> Self {
        if kb > 150.0 {
            ActivityKind::LargeDownload
        } else if kb > 80.0 {
            ActivityKind::MediaBrowsing
        } else if kb > 50.0 {
            ActivityKind::Browsing
        } else {
            ActivityKind::Light
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ActivityKind::Light => "Light traffic",
            ActivityKind::Browsing => "Browsing",
            ActivityKind::MediaBrowsing => "Browsing with media",
            ActivityKind::LargeDownload => "Large download",
        }
    }
}

/// What the location service is doing, for background-traffic estimation
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LocationContext {
    pub is_driving: bool,
    pub secs_since_location_update: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub download_rate_kbs: f64,
    pub upload_rate_kbs: f64,
    pub is_active_browsing: bool,
    pub activity: ActivityKind,
    pub latency_ms: f64,
    pub is_noisy: bool,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            download_rate_kbs: 0.0,
            upload_rate_kbs: 0.0,
            is_active_browsing: false,
            activity: ActivityKind::Light,
            latency_ms: 0.0,
            is_noisy: false,
        }
    }
}

/// Decides whether traffic looks like a user actively browsing.
///
/// A verdict needs all three of: a sustained average download above
/// `min_download_kbps`, an average upload above `min_upload_kbps`, and at
/// least `confirmation_required` of the last `confirmation_window` samples
/// individually active. Estimated location-service traffic is subtracted
/// first so GPS assistance polling never reads as browsing.
pub struct NetworkActivityEstimator {
    config: NetworkConfig,
    downloads: SampleWindow<f64>,
    uploads: SampleWindow<f64>,
    active: SampleWindow<bool>,
    latencies: SampleWindow<f64>,
    context: LocationContext,
    connected: bool,
    state: NetworkState,
    sample_count: u64,
    probe_count: u64,
}

impl NetworkActivityEstimator {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            downloads: SampleWindow::new(config.sample_size),
            uploads: SampleWindow::new(config.sample_size),
            active: SampleWindow::new(config.confirmation_window),
            latencies: SampleWindow::new(config.latency_window),
            config,
            context: LocationContext::default(),
            connected: true,
            state: NetworkState::default(),
            sample_count: 0,
            probe_count: 0,
        }
    }

    pub fn observe(&mut self, sample: TrafficSample, elapsed_seconds: f64) -> NetworkState {
        if !(elapsed_seconds.is_finite() && elapsed_seconds > 0.0) {
            debug!("Dropping traffic sample with elapsed {}s", elapsed_seconds);
            return self.state;
        }
        self.sample_count += 1;

        let download = sanitize_rate(sample.download_kbps);
        let upload = sanitize_rate(sample.upload_kbps);
        let (base_down, base_up) = self.location_baseline();
        let effective_down = (download - base_down).max(0.0);
        let effective_up = (upload - base_up).max(0.0);

        self.downloads.add_sample(effective_down);
        self.uploads.add_sample(effective_up);
        // Offline samples never count toward a confirmation
        if self.connected {
            self.active.add_sample(
                effective_down >= self.config.min_download_kbps
                    && effective_up >= self.config.min_upload_kbps,
            );
        }

        self.state.download_rate_kbs = self.downloads.mean();
        self.state.upload_rate_kbs = self.uploads.mean();
        self.state.activity = ActivityKind::from_interval_kb(download * elapsed_seconds);
        self.state.is_active_browsing = self.connected && self.browsing_confirmed();
        self.state
    }

    fn browsing_confirmed(&self) -> bool {
        let sustained = self.downloads.mean() >= self.config.min_download_kbps;
        let bidirectional = self.uploads.mean() >= self.config.min_upload_kbps;
        let confirmations = self
            .active
            .count_recent_true(self.config.confirmation_window);
        sustained && bidirectional && confirmations >= self.config.confirmation_required
    }

    /// Background (down, up) KB/s attributed to location services right now.
    ///
    /// Full rate right after a location update, fading linearly to zero over
    /// `location_traffic_window_secs`; higher while driving.
    pub fn location_baseline(&self) -> (f64, f64) {
        let window = self.config.location_traffic_window_secs;
        let age = match self.context.secs_since_location_update {
            Some(age) => age.max(0.0),
            None => return (0.0, 0.0),
        };
        if window <= 0.0 || age >= window {
            return (0.0, 0.0);
        }

        let weight = 1.0 - age / window;
        let (down, up) = if self.context.is_driving {
            (
                self.config.driving_location_download_kbps,
                self.config.driving_location_upload_kbps,
            )
        } else {
            (
                self.config.idle_location_download_kbps,
                self.config.idle_location_upload_kbps,
            )
        };
        (down * weight, up * weight)
    }

    /// Fold a latency probe into the noisy-network signal
    pub fn observe_probe(&mut self, outcome: ProbeOutcome) -> NetworkState {
        self.probe_count += 1;
        let latency_ms = match outcome {
            ProbeOutcome::Latency { ms } if ms.is_finite() && ms >= 0.0 => ms,
            _ => self.config.probe_timeout_secs * 1000.0,
        };
        self.latencies.add_sample(latency_ms);
        self.state.latency_ms = self.latencies.mean();
        self.state.is_noisy = self.state.latency_ms >= self.config.noisy_latency_ms;
        self.state
    }

    /// Connectivity path changed. Confirmations start over from the first
    /// sample after the path comes back.
    pub fn set_connectivity(&mut self, available: bool) -> NetworkState {
        if self.connected != available {
            self.active.clear();
        }
        self.connected = available;
        if !available {
            self.state.is_active_browsing = false;
        }
        self.state
    }

    pub fn set_location_context(&mut self, context: LocationContext) {
        self.context = context;
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn probe_count(&self) -> u64 {
        self.probe_count
    }
}

fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.max(0.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn estimator() -> NetworkActivityEstimator {
        NetworkActivityEstimator::new(NetworkConfig::default())
    }

    #[test]
    fn test_idle_traffic_is_not_browsing() {
        let mut est = estimator();
        let mut state = est.state();
        for _ in 0..10 {
            state = est.observe(TrafficSample::new(0.0, 0.0), 3.0);
        }
        assert!(!state.is_active_browsing);
        assert_eq!(state.activity, ActivityKind::Light);
    }

    #[test]
    fn test_sustained_bidirectional_traffic_confirms_on_third_sample() {
        let mut est = estimator();
        let verdicts: Vec<bool> = (0..5)
            .map(|_| est.observe(TrafficSample::new(400.0, 100.0), 3.0).is_active_browsing)
            .collect();
        assert_eq!(verdicts, vec![false, false, true, true, true]);
        assert_abs_diff_eq!(est.state().download_rate_kbs, 400.0, epsilon = 1e-9);
        assert_eq!(est.state().activity, ActivityKind::LargeDownload);
    }

    #[test]
    fn test_download_without_upload_is_passive() {
        let mut est = estimator();
        let mut state = est.state();
        for _ in 0..6 {
            state = est.observe(TrafficSample::new(900.0, 1.0), 3.0);
        }
        assert!(!state.is_active_browsing);
    }

    #[test]
    fn test_single_spike_is_suppressed() {
        let mut est = estimator();
        est.observe(TrafficSample::new(0.0, 0.0), 3.0);
        est.observe(TrafficSample::new(0.0, 0.0), 3.0);
        let state = est.observe(TrafficSample::new(5000.0, 300.0), 3.0);
        assert!(!state.is_active_browsing);
        let state = est.observe(TrafficSample::new(0.0, 0.0), 3.0);
        assert!(!state.is_active_browsing);
    }

    #[test]
    fn test_location_baseline_is_subtracted() {
        let mut est = estimator();
        est.set_location_context(LocationContext {
            is_driving: true,
            secs_since_location_update: Some(0.0),
        });
        assert_eq!(est.location_baseline(), (8.0, 2.0));

        let state = est.observe(TrafficSample::new(8.0, 2.0), 3.0);
        assert_eq!(state.download_rate_kbs, 0.0);
        assert_eq!(state.upload_rate_kbs, 0.0);
    }

    #[test]
    fn test_location_baseline_fades_out() {
        let mut est = estimator();
        est.set_location_context(LocationContext {
            is_driving: false,
            secs_since_location_update: Some(5.0),
        });
        let (down, up) = est.location_baseline();
        assert_abs_diff_eq!(down, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(up, 0.25, epsilon = 1e-9);

        est.set_location_context(LocationContext {
            is_driving: true,
            secs_since_location_update: Some(30.0),
        });
        assert_eq!(est.location_baseline(), (0.0, 0.0));
    }

    #[test]
    fn test_non_positive_elapsed_dropped() {
        let mut est = estimator();
        let before = est.state();
        let after = est.observe(TrafficSample::new(400.0, 100.0), 0.0);
        assert_eq!(before, after);
        assert_eq!(est.sample_count(), 0);
    }

    #[test]
    fn test_probe_failure_counts_as_high_latency() {
        let mut est = estimator();
        est.observe_probe(ProbeOutcome::Latency { ms: 40.0 });
        let state = est.observe_probe(ProbeOutcome::Failed);
        assert_abs_diff_eq!(state.latency_ms, 2520.0, epsilon = 1e-9);
        assert!(state.is_noisy);
        assert_eq!(est.probe_count(), 2);
    }

    #[test]
    fn test_connectivity_loss_resets_confirmation() {
        let mut est = estimator();
        for _ in 0..3 {
            est.observe(TrafficSample::new(400.0, 100.0), 3.0);
        }
        assert!(est.state().is_active_browsing);

        let state = est.set_connectivity(false);
        assert!(!state.is_active_browsing);
        est.set_connectivity(true);
        let state = est.observe(TrafficSample::new(400.0, 100.0), 3.0);
        assert!(!state.is_active_browsing);
    }

    #[test]
    fn test_offline_samples_do_not_confirm_after_reconnect() {
        let mut est = estimator();
        est.set_connectivity(false);
        for _ in 0..2 {
            let state = est.observe(TrafficSample::new(400.0, 100.0), 3.0);
            assert!(!state.is_active_browsing);
        }

        est.set_connectivity(true);
        let verdicts: Vec<bool> = (0..3)
            .map(|_| est.observe(TrafficSample::new(400.0, 100.0), 3.0).is_active_browsing)
            .collect();
        assert_eq!(verdicts, vec![false, false, true]);
    }

    #[test]
    fn test_activity_kind_thresholds() {
        assert_eq!(ActivityKind::from_interval_kb(40.0), ActivityKind::Light);
        assert_eq!(ActivityKind::from_interval_kb(60.0), ActivityKind::Browsing);
        assert_eq!(ActivityKind::from_interval_kb(100.0), ActivityKind::MediaBrowsing);
        assert_eq!(ActivityKind::from_interval_kb(151.0), ActivityKind::LargeDownload);
    }
}
