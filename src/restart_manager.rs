use std::collections::BTreeMap;

use log::{info, warn};
use tokio::time::{Duration, Instant};

use crate::config::SupervisorConfig;
use crate::sensors::SensorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartPhase {
    Running,
    /// Torn down, waiting for the backoff to elapse
    Pending { due: Instant },
    /// Out of attempts; the estimator keeps its last state
    Abandoned,
}

/// Tracks restart state for a single sensor
#[derive(Clone, Debug)]
pub struct RestartState {
    pub kind: SensorKind,
    phase: RestartPhase,
    attempts: u32,
    total_restarts: u32,
    max_attempts: u32,
    base_backoff: Duration,
    current_backoff: Duration,
    multiplier: f64,
    cap: Duration,
}

impl RestartState {
    pub fn new(kind: SensorKind, config: &SupervisorConfig) -> Self {
        let base_backoff = Duration::from_secs_f64(config.restart_backoff_secs);
        RestartState {
            kind,
            phase: RestartPhase::Running,
            attempts: 0,
            total_restarts: 0,
            max_attempts: config.max_restart_attempts,
            base_backoff,
            current_backoff: base_backoff,
            multiplier: config.restart_backoff_multiplier,
            cap: Duration::from_secs_f64(config.restart_backoff_cap_secs),
        }
    }

    /// Schedule the next restart attempt. Returns the backoff, or `None`
    /// once attempts are exhausted and the sensor is abandoned.
    pub fn schedule(&mut self, now: Instant) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            warn!(
                "{} abandoned after {} restart attempts",
                self.kind.name(),
                self.attempts
            );
            self.phase = RestartPhase::Abandoned;
            return None;
        }

        let backoff = self.current_backoff;
        self.attempts += 1;
        self.phase = RestartPhase::Pending { due: now + backoff };
        self.current_backoff = Duration::from_secs_f64(
            (self.current_backoff.as_secs_f64() * self.multiplier).min(self.cap.as_secs_f64()),
        );
        warn!(
            "{} restart {}/{} in {:.1}s",
            self.kind.name(),
            self.attempts,
            self.max_attempts,
            backoff.as_secs_f64()
        );
        Some(backoff)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.phase, RestartPhase::Pending { due } if now >= due)
    }

    /// Subscription re-established; attempts only reset once data flows again
    pub fn record_started(&mut self) {
        self.phase = RestartPhase::Running;
        self.total_restarts += 1;
    }

    pub fn record_sample(&mut self) {
        if self.attempts > 0 && self.phase == RestartPhase::Running {
            info!(
                "{} recovered after {} attempt(s)",
                self.kind.name(),
                self.attempts
            );
            self.attempts = 0;
            self.current_backoff = self.base_backoff;
        }
    }

    pub fn phase(&self) -> RestartPhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.phase == RestartPhase::Running
    }

    pub fn is_abandoned(&self) -> bool {
        self.phase == RestartPhase::Abandoned
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn total_restarts(&self) -> u32 {
        self.total_restarts
    }

    pub fn status(&self, now: Instant) -> String {
        match self.phase {
            RestartPhase::Running => format!("{}: OK", self.kind.name()),
            RestartPhase::Pending { due } => format!(
                "{}: RESTART_PENDING (waiting {:.1}s, attempt {}/{})",
                self.kind.name(),
                due.saturating_duration_since(now).as_secs_f64(),
                self.attempts,
                self.max_attempts
            ),
            RestartPhase::Abandoned => format!("{}: MAX_ATTEMPTS_EXCEEDED", self.kind.name()),
        }
    }
}

/// Restart state for every supervised sensor
#[derive(Default)]
pub struct RestartManager {
    states: BTreeMap<SensorKind, RestartState>,
}

impl RestartManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, kind: SensorKind, config: &SupervisorConfig) {
        self.states.insert(kind, RestartState::new(kind, config));
    }

    pub fn get(&self, kind: SensorKind) -> Option<&RestartState> {
        self.states.get(&kind)
    }

    pub fn get_mut(&mut self, kind: SensorKind) -> Option<&mut RestartState> {
        self.states.get_mut(&kind)
    }

    /// Sensors whose backoff has elapsed
    pub fn due(&self, now: Instant) -> Vec<SensorKind> {
        self.states
            .values()
            .filter(|s| s.is_due(now))
            .map(|s| s.kind)
            .collect()
    }

    pub fn status_report(&self, now: Instant) -> String {
        self.states
            .values()
            .map(|s| s.status(now))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}
