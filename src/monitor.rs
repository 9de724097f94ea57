// monitor.rs: the fusion core as a single, pure state machine.
//
// Every raw input goes through `FusionEngine::handle` on one timeline and
// comes back out as the events it caused. Nothing here knows about tokio,
// processes or files, so recorded sessions replay bit-for-bit.
//
// Each estimator owns its own state; the engine only reads their latest
// outputs ("most recently observed value wins").

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::MonitorConfig;
use crate::danger::{DangerCause, DangerFusionEngine, DangerVerdict, LockState};
use crate::events::{
    CallNotice, DangerAlert, DrivingStatus, LocationUpdate, LockNotice, MonitorEvent,
    MonitorStatus, NetworkAnalysis, TiltTelemetry,
};
use crate::network::{LocationContext, NetworkActivityEstimator, NetworkState, ProbeOutcome, TrafficSample};
use crate::sensors::{AccelSample, CallState, SensorInput};
use crate::speed::{LocationFix, SpeedEstimator, SpeedState};
use crate::tilt::{TiltEstimator, TiltState};

/// Running totals, surfaced in the live status file
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineCounters {
    pub tilt_samples: u64,
    pub accepted_fixes: u64,
    pub rejected_fixes: u64,
    pub traffic_samples: u64,
    pub probes: u64,
    pub events_emitted: u64,
    pub alerts_emitted: u64,
}

pub struct FusionEngine {
    tilt: TiltEstimator,
    speed: SpeedEstimator,
    network: NetworkActivityEstimator,
    danger: DangerFusionEngine,
    lock: LockState,
    in_call: bool,
    last_fix_at: Option<DateTime<Utc>>,
    events_emitted: u64,
}

impl FusionEngine {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            tilt: TiltEstimator::new(config.tilt.clone()),
            speed: SpeedEstimator::new(config.speed.clone()),
            network: NetworkActivityEstimator::new(config.network.clone()),
            danger: DangerFusionEngine::new(&config.fusion, config.tilt.stability_threshold),
            lock: LockState {
                is_unlocked: config.fusion.initially_unlocked,
            },
            in_call: false,
            last_fix_at: None,
            events_emitted: 0,
        }
    }

    /// Apply one raw input observed at `now` and return the events it caused,
    /// in emission order.
    pub fn handle(&mut self, input: &SensorInput, now: DateTime<Utc>) -> Vec<MonitorEvent> {
        let events = match input {
            SensorInput::Accel(sample) => self.on_accel(sample, now),
            SensorInput::Location(fix) => self.on_location(fix, now),
            SensorInput::Traffic {
                sample,
                elapsed_secs,
            } => self.on_traffic(*sample, *elapsed_secs, now),
            SensorInput::Probe { outcome } => self.on_probe(*outcome),
            SensorInput::Connectivity { available } => self.on_connectivity(*available, now),
            SensorInput::Lock { unlocked } => self.on_lock(*unlocked, now),
            SensorInput::Call { state } => self.on_call(*state, now),
        };
        self.events_emitted += events.len() as u64;
        events
    }

    pub fn status_notice(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> MonitorEvent {
        self.events_emitted += 1;
        MonitorEvent::MonitorStatus(MonitorStatus {
            timestamp: now.timestamp_millis(),
            message: message.into(),
        })
    }

    // ─── Per-input handlers ─────────────────────────────────────────────────

    fn on_accel(&mut self, sample: &AccelSample, now: DateTime<Utc>) -> Vec<MonitorEvent> {
        let tilt = self.tilt.observe(sample.z);
        let speed = self.speed.state();
        let network = self.network.state();

        let mut events = vec![MonitorEvent::TiltEvent(TiltTelemetry {
            timestamp: now.timestamp_millis(),
            tilt_value: tilt.raw_axis_value,
            tilt_percent: tilt.viewing_percent,
            speed: speed.smoothed_kmh,
            is_active_browsing: network.is_active_browsing,
            is_in_call: self.in_call,
            z_stability: tilt.stability_score,
            message: tilt.classification.message().to_string(),
        })];

        let verdict = self.danger.evaluate(&tilt, &speed, &network, &self.lock, now);
        events.extend(self.alert_for(verdict, now));
        events
    }

    fn on_location(&mut self, fix: &LocationFix, now: DateTime<Utc>) -> Vec<MonitorEvent> {
        let update = self.speed.observe_fix(fix);
        if !update.outcome.is_accepted() {
            return Vec::new();
        }
        self.last_fix_at = Some(now);

        let mut events = vec![MonitorEvent::LocationUpdate(LocationUpdate {
            timestamp: now.timestamp_millis(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed: update.state.smoothed_kmh,
            is_driving: update.state.is_driving,
            accuracy: Some(fix.horizontal_accuracy_m),
        })];

        if update.driving_changed {
            events.push(self.driving_status(update.state, now));
            if update.state.is_driving && self.in_call {
                let verdict = self.danger.evaluate_call(true, &update.state, now);
                events.extend(self.alert_for(verdict, now));
            }
        }
        events
    }

    fn driving_status(&self, state: SpeedState, now: DateTime<Utc>) -> MonitorEvent {
        let message = if state.is_driving {
            format!("Driving detected at {:.1} km/h", state.smoothed_kmh)
        } else {
            "Vehicle stopped".to_string()
        };
        info!("{}", message);
        MonitorEvent::DrivingStatus(DrivingStatus {
            timestamp: now.timestamp_millis(),
            speed: state.smoothed_kmh,
            is_driving: state.is_driving,
            message,
        })
    }

    fn on_traffic(
        &mut self,
        sample: TrafficSample,
        elapsed_secs: f64,
        now: DateTime<Utc>,
    ) -> Vec<MonitorEvent> {
        let before = self.network.sample_count();
        self.network.set_location_context(self.location_context(now));
        let state = self.network.observe(sample, elapsed_secs);
        if self.network.sample_count() == before {
            return Vec::new();
        }

        let message = if state.is_active_browsing {
            format!("Active browsing: {}", state.activity.label())
        } else {
            format!("No active browsing: {}", state.activity.label())
        };
        vec![self.network_analysis(state, message, now)]
    }

    fn location_context(&self, now: DateTime<Utc>) -> LocationContext {
        LocationContext {
            is_driving: self.speed.state().is_driving,
            secs_since_location_update: self
                .last_fix_at
                .map(|at| (now - at).num_milliseconds() as f64 / 1000.0),
        }
    }

    fn network_analysis(&self, state: NetworkState, message: String, now: DateTime<Utc>) -> MonitorEvent {
        MonitorEvent::NetworkAnalysis(NetworkAnalysis {
            timestamp: now.timestamp_millis(),
            is_active_browsing: state.is_active_browsing,
            network_download_speed: state.download_rate_kbs,
            network_upload_speed: state.upload_rate_kbs,
            activity_type: state.activity,
            latency_ms: state.latency_ms,
            message,
        })
    }

    fn on_probe(&mut self, outcome: ProbeOutcome) -> Vec<MonitorEvent> {
        let state = self.network.observe_probe(outcome);
        debug!("Probe {:?}, mean latency {:.0} ms", outcome, state.latency_ms);
        Vec::new()
    }

    fn on_connectivity(&mut self, available: bool, now: DateTime<Utc>) -> Vec<MonitorEvent> {
        if self.network.is_connected() == available {
            return Vec::new();
        }
        let state = self.network.set_connectivity(available);
        let message = if available {
            "Connectivity restored"
        } else {
            "Connectivity lost"
        };
        info!("{}", message);
        vec![self.network_analysis(state, message.to_string(), now)]
    }

    fn on_lock(&mut self, unlocked: bool, now: DateTime<Utc>) -> Vec<MonitorEvent> {
        if self.lock.is_unlocked == unlocked {
            return Vec::new();
        }
        self.lock.is_unlocked = unlocked;

        let speed = self.speed.state();
        let message = if unlocked {
            "Device unlocked"
        } else {
            "Device locked"
        };
        info!("{}", message);
        vec![MonitorEvent::LockEvent(LockNotice {
            timestamp: now.timestamp_millis(),
            message: message.to_string(),
            is_unlocked: unlocked,
            speed: speed.smoothed_kmh,
            is_driving: speed.is_driving,
        })]
    }

    fn on_call(&mut self, state: CallState, now: DateTime<Utc>) -> Vec<MonitorEvent> {
        let in_call = state.in_call();
        if self.in_call == in_call {
            return Vec::new();
        }
        self.in_call = in_call;

        let (message, call_state) = if in_call {
            ("Call connected", "connected")
        } else {
            ("Call ended", "disconnected")
        };
        info!("{}", message);
        let mut events = vec![MonitorEvent::CallEvent(CallNotice {
            timestamp: now.timestamp_millis(),
            message: message.to_string(),
            is_in_call: in_call,
            call_state: call_state.to_string(),
        })];

        if in_call {
            let verdict = self.danger.evaluate_call(true, &self.speed.state(), now);
            events.extend(self.alert_for(verdict, now));
        }
        events
    }

    fn alert_for(&self, verdict: DangerVerdict, now: DateTime<Utc>) -> Option<MonitorEvent> {
        let cause = verdict.cause.filter(|_| verdict.triggered)?;
        Some(MonitorEvent::DangerEvent(self.danger_alert(cause, now)))
    }

    fn danger_alert(&self, cause: DangerCause, now: DateTime<Utc>) -> DangerAlert {
        let tilt = self.tilt.state();
        let speed = self.speed.state();
        let network = self.network.state();
        info!("{}", cause.message());
        DangerAlert {
            timestamp: now.timestamp_millis(),
            message: cause.message().to_string(),
            cause,
            tilt_value: tilt.map(|t| t.raw_axis_value).unwrap_or(0.0),
            tilt_percent: tilt.map(|t| t.viewing_percent).unwrap_or(0.0),
            z_stability: tilt.map(|t| t.stability_score).unwrap_or(0.0),
            speed: speed.smoothed_kmh,
            is_driving: speed.is_driving,
            is_active_browsing: network.is_active_browsing,
            network_download_speed: network.download_rate_kbs,
            network_upload_speed: network.upload_rate_kbs,
            is_unlocked: self.lock.is_unlocked,
            is_in_call: self.in_call,
        }
    }

    // ─── Read-only views ────────────────────────────────────────────────────

    pub fn tilt_state(&self) -> Option<TiltState> {
        self.tilt.state()
    }

    pub fn speed_state(&self) -> SpeedState {
        self.speed.state()
    }

    pub fn network_state(&self) -> NetworkState {
        self.network.state()
    }

    pub fn lock_state(&self) -> LockState {
        self.lock
    }

    pub fn in_call(&self) -> bool {
        self.in_call
    }

    pub fn counters(&self) -> EngineCounters {
        EngineCounters {
            tilt_samples: self.tilt.sample_count(),
            accepted_fixes: self.speed.accepted_fixes(),
            rejected_fixes: self.speed.rejected_fixes(),
            traffic_samples: self.network.sample_count(),
            probes: self.network.probe_count(),
            events_emitted: self.events_emitted,
            alerts_emitted: self.danger.alerts_emitted(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn engine() -> FusionEngine {
        FusionEngine::new(&MonitorConfig::default())
    }

    fn accel(z: f64) -> SensorInput {
        SensorInput::Accel(AccelSample {
            timestamp: 0.0,
            x: 0.0,
            y: 0.9,
            z,
        })
    }

    fn fix(timestamp: f64, speed: f64, accuracy: f64) -> SensorInput {
        SensorInput::Location(LocationFix {
            timestamp,
            latitude: 10.0,
            longitude: 106.0,
            reported_speed: Some(speed),
            horizontal_accuracy_m: accuracy,
        })
    }

    fn browsing_traffic() -> SensorInput {
        SensorInput::Traffic {
            sample: TrafficSample::new(400.0, 100.0),
            elapsed_secs: 3.0,
        }
    }

    fn types(events: &[MonitorEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.type_name()).collect()
    }

    /// Driving, actively browsing, unlocked: only the tilt is missing
    fn primed_engine() -> FusionEngine {
        let mut engine = engine();
        engine.handle(&fix(1.0, 15.0, 5.0), t(0));
        for i in 0..3 {
            engine.handle(&browsing_traffic(), t(100 + i));
        }
        assert!(engine.speed_state().is_driving);
        assert!(engine.network_state().is_active_browsing);
        engine
    }

    #[test]
    fn test_every_tilt_emits_telemetry() {
        let mut engine = engine();
        let events = engine.handle(&accel(0.95), t(0));
        assert_eq!(types(&events), vec!["TILT_EVENT"]);
        match &events[0] {
            MonitorEvent::TiltEvent(e) => {
                assert_eq!(e.tilt_value, 0.95);
                assert_eq!(e.tilt_percent, 95.0);
                assert_eq!(e.message, "Device: NOT VIEWING");
                assert_eq!(e.z_stability, 0.0);
                assert!(!e.is_in_call);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.counters().tilt_samples, 1);
    }

    #[test]
    fn test_browsing_while_driving_raises_danger() {
        let mut engine = primed_engine();
        let events = engine.handle(&accel(0.5), t(1_000));
        assert_eq!(types(&events), vec!["TILT_EVENT", "DANGER_EVENT"]);
        match &events[1] {
            MonitorEvent::DangerEvent(alert) => {
                assert_eq!(alert.cause, DangerCause::Browsing);
                assert!(alert.is_driving && alert.is_active_browsing && alert.is_unlocked);
                assert_eq!(alert.tilt_percent, 50.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_same_instant_does_not_refire() {
        let mut engine = primed_engine();
        let first = engine.handle(&accel(0.5), t(1_000));
        let second = engine.handle(&accel(0.5), t(1_000));
        assert!(first.iter().any(MonitorEvent::is_danger));
        assert!(!second.iter().any(MonitorEvent::is_danger));

        let later = engine.handle(&accel(0.5), t(1_000) + Duration::seconds(5));
        assert!(later.iter().any(MonitorEvent::is_danger));
        assert_eq!(engine.counters().alerts_emitted, 2);
    }

    #[test]
    fn test_locked_device_never_alerts() {
        let mut engine = primed_engine();
        let events = engine.handle(&SensorInput::Lock { unlocked: false }, t(500));
        assert_eq!(types(&events), vec!["LOCK_EVENT"]);
        let events = engine.handle(&accel(0.5), t(1_000));
        assert_eq!(types(&events), vec!["TILT_EVENT"]);
    }

    #[test]
    fn test_lock_events_are_one_shot() {
        let mut engine = engine();
        assert!(engine.handle(&SensorInput::Lock { unlocked: true }, t(0)).is_empty());
        assert_eq!(engine.handle(&SensorInput::Lock { unlocked: false }, t(1)).len(), 1);
        assert!(engine.handle(&SensorInput::Lock { unlocked: false }, t(2)).is_empty());
        let events = engine.handle(&SensorInput::Lock { unlocked: true }, t(3));
        match &events[..] {
            [MonitorEvent::LockEvent(e)] => {
                assert!(e.is_unlocked);
                assert_eq!(e.message, "Device unlocked");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_driving_transitions_emit_status() {
        let mut engine = engine();
        let events = engine.handle(&fix(1.0, 15.0, 5.0), t(0));
        assert_eq!(types(&events), vec!["LOCATION_UPDATE", "DRIVING_STATUS"]);

        // Stationary follow-up fixes drag the average down below 10 km/h
        let mut all = Vec::new();
        for i in 2..=8 {
            all.extend(engine.handle(&fix(i as f64, 0.0, 5.0), t(i * 1000)));
        }
        let statuses: Vec<bool> = all
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::DrivingStatus(s) => Some(s.is_driving),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![false]);
        assert!(!engine.speed_state().is_driving);
    }

    #[test]
    fn test_rejected_fix_emits_nothing() {
        let mut engine = engine();
        assert!(engine.handle(&fix(1.0, 15.0, 100.0), t(0)).is_empty());
        assert_eq!(engine.speed_state(), SpeedState::default());
        assert_eq!(engine.counters().rejected_fixes, 1);
    }

    #[test]
    fn test_every_traffic_sample_reported() {
        let mut engine = engine();
        let events = engine.handle(&browsing_traffic(), t(0));
        match &events[..] {
            [MonitorEvent::NetworkAnalysis(e)] => {
                assert!(!e.is_active_browsing);
                assert_eq!(e.network_download_speed, 400.0);
            }
            other => panic!("unexpected {:?}", other),
        }

        let dropped = SensorInput::Traffic {
            sample: TrafficSample::new(1.0, 1.0),
            elapsed_secs: 0.0,
        };
        assert!(engine.handle(&dropped, t(1)).is_empty());
    }

    #[test]
    fn test_fresh_fix_discounts_location_traffic() {
        let mut engine = engine();
        engine.handle(&fix(1.0, 15.0, 5.0), t(0));
        let events = engine.handle(
            &SensorInput::Traffic {
                sample: TrafficSample::new(8.0, 2.0),
                elapsed_secs: 3.0,
            },
            t(0),
        );
        match &events[..] {
            [MonitorEvent::NetworkAnalysis(e)] => {
                assert_eq!(e.network_download_speed, 0.0);
                assert_eq!(e.network_upload_speed, 0.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_probe_updates_latency_silently() {
        let mut engine = engine();
        let events = engine.handle(
            &SensorInput::Probe {
                outcome: ProbeOutcome::Failed,
            },
            t(0),
        );
        assert!(events.is_empty());
        assert!(engine.network_state().is_noisy);
        assert_eq!(engine.counters().probes, 1);
    }

    #[test]
    fn test_connectivity_loss_clears_browsing() {
        let mut engine = primed_engine();
        let events = engine.handle(&SensorInput::Connectivity { available: false }, t(200));
        assert_eq!(types(&events), vec!["NETWORK_ANALYSIS"]);
        assert!(!engine.network_state().is_active_browsing);
        assert!(engine
            .handle(&SensorInput::Connectivity { available: false }, t(201))
            .is_empty());
    }

    #[test]
    fn test_call_while_driving_alerts() {
        let mut engine = engine();
        engine.handle(&fix(1.0, 15.0, 5.0), t(0));

        let ringing = engine.handle(&SensorInput::Call { state: CallState::Ringing }, t(100));
        assert!(ringing.is_empty());

        let events = engine.handle(&SensorInput::Call { state: CallState::OffHook }, t(200));
        assert_eq!(types(&events), vec!["CALL_EVENT", "DANGER_EVENT"]);
        match &events[1] {
            MonitorEvent::DangerEvent(alert) => {
                assert_eq!(alert.cause, DangerCause::Call);
                assert!(alert.is_in_call);
            }
            other => panic!("unexpected {:?}", other),
        }

        let tilt = engine.handle(&accel(0.95), t(300));
        match &tilt[0] {
            MonitorEvent::TiltEvent(e) => assert!(e.is_in_call),
            other => panic!("unexpected {:?}", other),
        }

        let hangup = engine.handle(&SensorInput::Call { state: CallState::Idle }, t(400));
        match &hangup[..] {
            [MonitorEvent::CallEvent(e)] => assert_eq!(e.call_state, "disconnected"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_driving_off_during_call_alerts_when_driving_starts() {
        let mut engine = engine();
        let events = engine.handle(&SensorInput::Call { state: CallState::OffHook }, t(0));
        assert_eq!(types(&events), vec!["CALL_EVENT"]);

        let events = engine.handle(&fix(1.0, 15.0, 5.0), t(1_000));
        assert_eq!(
            types(&events),
            vec!["LOCATION_UPDATE", "DRIVING_STATUS", "DANGER_EVENT"]
        );
    }

    #[test]
    fn test_counters_track_events() {
        let mut engine = engine();
        engine.handle(&accel(0.5), t(0));
        engine.status_notice("Monitoring started", t(0));
        assert_eq!(engine.counters().events_emitted, 2);
    }
}
