use std::collections::VecDeque;

use geo::{HaversineDistance, Point};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::SpeedConfig;
use crate::smoothing::SampleWindow;

const MS_TO_KMH: f64 = 3.6;

/// Position fix as delivered by the platform location service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    /// seconds since epoch
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// m/s as reported by the device, if any
    pub reported_speed: Option<f64>,
    pub horizontal_accuracy_m: f64,
}

impl LocationFix {
    fn point(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }

    fn has_valid_position(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.timestamp.is_finite()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedState {
    pub smoothed_kmh: f64,
    pub is_driving: bool,
}

/// What happened to a single fix
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixOutcome {
    /// Speed sample inserted and the new average published
    Accepted,
    /// Speed sample inserted but the average jumped too far; previous value kept
    Held,
    /// Fix kept as a distance anchor, no speed available yet
    NoSpeed,
    RejectedAccuracy,
    RejectedPosition,
    RejectedTimestamp,
    RejectedSpeed,
}

impl FixOutcome {
    /// Whether the fix was taken into the estimator at all
    pub fn is_accepted(&self) -> bool {
        matches!(self, FixOutcome::Accepted | FixOutcome::Held | FixOutcome::NoSpeed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeedUpdate {
    pub state: SpeedState,
    pub outcome: FixOutcome,
    pub driving_changed: bool,
}

/// Smoothed, outlier-rejecting speed from GPS fixes.
pub struct SpeedEstimator {
    config: SpeedConfig,
    speeds_ms: SampleWindow<f64>,
    fixes: VecDeque<LocationFix>,
    state: SpeedState,
    has_estimate: bool,
    consecutive_holds: u32,
    accepted_fixes: u64,
    rejected_fixes: u64,
}

impl SpeedEstimator {
    pub fn new(config: SpeedConfig) -> Self {
        Self {
            speeds_ms: SampleWindow::new(config.history_size),
            fixes: VecDeque::with_capacity(config.fix_history_size),
            config,
            state: SpeedState::default(),
            has_estimate: false,
            consecutive_holds: 0,
            accepted_fixes: 0,
            rejected_fixes: 0,
        }
    }

    pub fn observe(&mut self, fix: &LocationFix) -> SpeedState {
        self.observe_fix(fix).state
    }

    pub fn observe_fix(&mut self, fix: &LocationFix) -> SpeedUpdate {
        let outcome = self.apply(fix);
        if outcome.is_accepted() {
            self.accepted_fixes += 1;
        } else {
            self.rejected_fixes += 1;
            debug!("Dropping location fix ({:?}): {:?}", outcome, fix);
        }

        let was_driving = self.state.is_driving;
        if matches!(outcome, FixOutcome::Accepted | FixOutcome::Held) {
            self.state.is_driving = self.state.smoothed_kmh >= self.config.driving_threshold_kmh;
        }

        SpeedUpdate {
            state: self.state,
            outcome,
            driving_changed: was_driving != self.state.is_driving,
        }
    }

    fn apply(&mut self, fix: &LocationFix) -> FixOutcome {
        let accuracy_ok = (0.0..=self.config.max_accuracy_m).contains(&fix.horizontal_accuracy_m);
        if !accuracy_ok {
            return FixOutcome::RejectedAccuracy;
        }
        if !fix.has_valid_position() {
            return FixOutcome::RejectedPosition;
        }

        if let Some(last) = self.fixes.back() {
            let gap = fix.timestamp - last.timestamp;
            if gap <= 0.0 {
                return FixOutcome::RejectedTimestamp;
            }
            if gap > self.config.max_fix_gap_secs {
                self.fixes.clear();
            }
        }

        let speed_ms = match self.derived_speed(fix).or_else(|| reported_speed(fix)) {
            Some(speed) => speed,
            None => {
                self.remember_fix(fix);
                return FixOutcome::NoSpeed;
            }
        };

        if !(0.0..=self.config.max_plausible_speed_ms).contains(&speed_ms) {
            return FixOutcome::RejectedSpeed;
        }

        self.remember_fix(fix);
        self.speeds_ms.add_sample(speed_ms);
        let candidate_kmh = self.speeds_ms.mean() * MS_TO_KMH;

        let jump = (candidate_kmh - self.state.smoothed_kmh).abs();
        if self.has_estimate && jump > self.config.max_delta_kmh {
            self.consecutive_holds += 1;
            if self.consecutive_holds <= self.config.max_consecutive_holds {
                debug!(
                    "Holding speed at {:.1} km/h (candidate {:.1} km/h)",
                    self.state.smoothed_kmh, candidate_kmh
                );
                return FixOutcome::Held;
            }
        }

        self.consecutive_holds = 0;
        self.has_estimate = true;
        self.state.smoothed_kmh = candidate_kmh;
        FixOutcome::Accepted
    }

    /// Path length over the retained fixes plus this one, divided by the span.
    fn derived_speed(&self, fix: &LocationFix) -> Option<f64> {
        let oldest = self.fixes.front()?;
        let span = fix.timestamp - oldest.timestamp;
        if span <= 0.0 {
            return None;
        }

        let mut distance = 0.0;
        let mut prev = oldest.point();
        for anchor in self.fixes.iter().skip(1) {
            let p = anchor.point();
            distance += prev.haversine_distance(&p);
            prev = p;
        }
        distance += prev.haversine_distance(&fix.point());

        Some(distance / span)
    }

    fn remember_fix(&mut self, fix: &LocationFix) {
        self.fixes.push_back(fix.clone());
        while self.fixes.len() > self.config.fix_history_size {
            self.fixes.pop_front();
        }
    }

    pub fn state(&self) -> SpeedState {
        self.state
    }

    pub fn last_fix(&self) -> Option<&LocationFix> {
        self.fixes.back()
    }

    pub fn accepted_fixes(&self) -> u64 {
        self.accepted_fixes
    }

    pub fn rejected_fixes(&self) -> u64 {
        self.rejected_fixes
    }
}

fn reported_speed(fix: &LocationFix) -> Option<f64> {
    fix.reported_speed.filter(|s| s.is_finite())
}
