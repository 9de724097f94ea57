use serde::{Deserialize, Serialize};

use crate::config::TiltConfig;
use crate::smoothing::SampleWindow;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TiltClassification {
    Viewing,
    Intermediate,
    NotViewing,
}

impl TiltClassification {
    pub fn message(&self) -> &'static str {
        match self {
            TiltClassification::Viewing => "Device: VIEWING",
            TiltClassification::Intermediate => "Device: INTERMEDIATE",
            TiltClassification::NotViewing => "Device: NOT VIEWING",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TiltState {
    pub raw_axis_value: f64,
    /// 0 = upright (edge-on), 100 = flat
    pub viewing_percent: f64,
    /// stddev of recent raw z samples
    pub stability_score: f64,
    pub classification: TiltClassification,
}

impl TiltState {
    pub fn is_stable(&self, threshold: f64) -> bool {
        self.stability_score < threshold
    }
}

/// Turns raw z-axis acceleration into a viewing percentage and stability score.
pub struct TiltEstimator {
    config: TiltConfig,
    z_history: SampleWindow<f64>,
    last: Option<TiltState>,
    sample_count: u64,
}

impl TiltEstimator {
    pub fn new(config: TiltConfig) -> Self {
        Self {
            z_history: SampleWindow::new(config.stability_buffer_size),
            config,
            last: None,
            sample_count: 0,
        }
    }

    /// Feed one accelerometer z reading and recompute the tilt state.
    pub fn observe(&mut self, z_acceleration: f64) -> TiltState {
        // A non-finite reading still takes a slot, but as the previous value
        let windowed = if z_acceleration.is_finite() {
            z_acceleration
        } else {
            self.z_history
                .last()
                .copied()
                .unwrap_or(self.config.full_scale)
        };
        self.z_history.add_sample(windowed);
        self.sample_count += 1;

        let viewing_percent = self.viewing_percent(z_acceleration);
        let state = TiltState {
            raw_axis_value: z_acceleration,
            viewing_percent,
            stability_score: self.z_history.stddev(),
            classification: self.classify(viewing_percent),
        };
        self.last = Some(state);
        state
    }

    /// `clamp(|z| / full_scale * 100, 0, 100)`; non-finite input reads as flat
    pub fn viewing_percent(&self, z_acceleration: f64) -> f64 {
        let percent = z_acceleration.abs() / self.config.full_scale * 100.0;
        if percent.is_nan() {
            return 100.0;
        }
        percent.clamp(0.0, 100.0)
    }

    pub fn classify(&self, viewing_percent: f64) -> TiltClassification {
        if viewing_percent <= self.config.viewing_threshold {
            TiltClassification::Viewing
        } else if viewing_percent < self.config.intermediate_threshold {
            TiltClassification::Intermediate
        } else {
            TiltClassification::NotViewing
        }
    }

    /// Latest state, `None` until the first sample
    pub fn state(&self) -> Option<TiltState> {
        self.last
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn stability_threshold(&self) -> f64 {
        self.config.stability_threshold
    }
}
