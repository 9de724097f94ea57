use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::network::NetworkState;
use crate::speed::SpeedState;
use crate::tilt::{TiltClassification, TiltState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub is_unlocked: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DangerCause {
    /// Unlocked, driving, held flat and steady, actively browsing
    Browsing,
    /// On a call while driving
    Call,
}

impl DangerCause {
    pub fn message(&self) -> &'static str {
        match self {
            DangerCause::Browsing => "DANGER: browsing on the phone while driving",
            DangerCause::Call => "DANGER: on a phone call while driving",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DangerVerdict {
    pub triggered: bool,
    pub timestamp_of_last_alert: Option<DateTime<Utc>>,
    pub cause: Option<DangerCause>,
}

/// Shared between every alert cause: at most one alert per window
struct AlertCooldown {
    last_trigger: Option<DateTime<Utc>>,
    cooldown: Duration,
}

impl AlertCooldown {
    fn new(cooldown_secs: f64) -> Self {
        Self {
            last_trigger: None,
            cooldown: Duration::milliseconds((cooldown_secs * 1000.0).round() as i64),
        }
    }

    fn ready_and_touch(&mut self, now: DateTime<Utc>) -> bool {
        let ready = match self.last_trigger {
            None => true,
            Some(last) => now - last >= self.cooldown,
        };
        if ready {
            self.last_trigger = Some(now);
        }
        ready
    }
}

/// Combines the per-signal states into a rate-limited danger verdict.
pub struct DangerFusionEngine {
    stability_threshold: f64,
    call_alerts: bool,
    cooldown: AlertCooldown,
    alerts_emitted: u64,
}

impl DangerFusionEngine {
    pub fn new(config: &FusionConfig, stability_threshold: f64) -> Self {
        Self {
            stability_threshold,
            call_alerts: config.call_alerts,
            cooldown: AlertCooldown::new(config.cooldown_secs),
            alerts_emitted: 0,
        }
    }

    /// The browsing rule, without the cooldown gate
    pub fn is_dangerous(
        &self,
        tilt: &TiltState,
        speed: &SpeedState,
        network: &NetworkState,
        lock: &LockState,
    ) -> bool {
        lock.is_unlocked
            && speed.is_driving
            && tilt.classification == TiltClassification::Viewing
            && tilt.stability_score < self.stability_threshold
            && network.is_active_browsing
    }

    pub fn evaluate(
        &mut self,
        tilt: &TiltState,
        speed: &SpeedState,
        network: &NetworkState,
        lock: &LockState,
        now: DateTime<Utc>,
    ) -> DangerVerdict {
        let dangerous = self.is_dangerous(tilt, speed, network, lock);
        self.gate(dangerous, DangerCause::Browsing, now)
    }

    /// Auxiliary trigger: a connected call while driving
    pub fn evaluate_call(
        &mut self,
        in_call: bool,
        speed: &SpeedState,
        now: DateTime<Utc>,
    ) -> DangerVerdict {
        let dangerous = self.call_alerts && in_call && speed.is_driving;
        self.gate(dangerous, DangerCause::Call, now)
    }

    fn gate(&mut self, dangerous: bool, cause: DangerCause, now: DateTime<Utc>) -> DangerVerdict {
        let triggered = dangerous && self.cooldown.ready_and_touch(now);
        if triggered {
            self.alerts_emitted += 1;
        }
        DangerVerdict {
            triggered,
            timestamp_of_last_alert: self.cooldown.last_trigger,
            cause: triggered.then_some(cause),
        }
    }

    pub fn last_alert(&self) -> Option<DateTime<Utc>> {
        self.cooldown.last_trigger
    }

    pub fn alerts_emitted(&self) -> u64 {
        self.alerts_emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ActivityKind;
    use chrono::TimeZone;

    fn engine() -> DangerFusionEngine {
        DangerFusionEngine::new(&FusionConfig::default(), 1.5)
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn viewing() -> TiltState {
        TiltState {
            raw_axis_value: 0.5,
            viewing_percent: 50.0,
            stability_score: 0.1,
            classification: TiltClassification::Viewing,
        }
    }

    fn driving() -> SpeedState {
        SpeedState {
            smoothed_kmh: 50.0,
            is_driving: true,
        }
    }

    fn browsing() -> NetworkState {
        NetworkState {
            download_rate_kbs: 400.0,
            upload_rate_kbs: 100.0,
            is_active_browsing: true,
            activity: ActivityKind::LargeDownload,
            latency_ms: 30.0,
            is_noisy: false,
        }
    }

    const UNLOCKED: LockState = LockState { is_unlocked: true };

    #[test]
    fn test_fires_then_respects_cooldown() {
        let mut engine = engine();
        let now = t0();

        let first = engine.evaluate(&viewing(), &driving(), &browsing(), &UNLOCKED, now);
        assert!(first.triggered);
        assert_eq!(first.cause, Some(DangerCause::Browsing));
        assert_eq!(first.timestamp_of_last_alert, Some(now));

        let second = engine.evaluate(&viewing(), &driving(), &browsing(), &UNLOCKED, now);
        assert!(!second.triggered);
        assert_eq!(second.cause, None);
        assert_eq!(second.timestamp_of_last_alert, Some(now));

        let within = now + Duration::milliseconds(4_999);
        assert!(!engine.evaluate(&viewing(), &driving(), &browsing(), &UNLOCKED, within).triggered);

        let after = now + Duration::seconds(5);
        let third = engine.evaluate(&viewing(), &driving(), &browsing(), &UNLOCKED, after);
        assert!(third.triggered);
        assert_eq!(third.timestamp_of_last_alert, Some(after));
        assert_eq!(engine.alerts_emitted(), 2);
    }

    #[test]
    fn test_each_guard_blocks_alert() {
        let now = t0();

        let locked = LockState { is_unlocked: false };
        assert!(!engine().evaluate(&viewing(), &driving(), &browsing(), &locked, now).triggered);

        let stopped = SpeedState::default();
        assert!(!engine().evaluate(&viewing(), &stopped, &browsing(), &UNLOCKED, now).triggered);

        let mut flat = viewing();
        flat.classification = TiltClassification::NotViewing;
        assert!(!engine().evaluate(&flat, &driving(), &browsing(), &UNLOCKED, now).triggered);

        let mut shaky = viewing();
        shaky.stability_score = 1.5;
        assert!(!engine().evaluate(&shaky, &driving(), &browsing(), &UNLOCKED, now).triggered);

        let idle = NetworkState::default();
        assert!(!engine().evaluate(&viewing(), &driving(), &idle, &UNLOCKED, now).triggered);
    }

    #[test]
    fn test_non_firing_evaluation_does_not_touch_cooldown() {
        let mut engine = engine();
        let now = t0();
        let idle = NetworkState::default();
        engine.evaluate(&viewing(), &driving(), &idle, &UNLOCKED, now);
        assert_eq!(engine.last_alert(), None);

        let verdict = engine.evaluate(&viewing(), &driving(), &browsing(), &UNLOCKED, now);
        assert!(verdict.triggered);
    }

    #[test]
    fn test_call_alert_shares_cooldown() {
        let mut engine = engine();
        let now = t0();

        let call = engine.evaluate_call(true, &driving(), now);
        assert!(call.triggered);
        assert_eq!(call.cause, Some(DangerCause::Call));

        let browse = engine.evaluate(
            &viewing(),
            &driving(),
            &browsing(),
            &UNLOCKED,
            now + Duration::seconds(1),
        );
        assert!(!browse.triggered);
    }

    #[test]
    fn test_call_requires_driving_and_flag() {
        let now = t0();
        assert!(!engine().evaluate_call(true, &SpeedState::default(), now).triggered);
        assert!(!engine().evaluate_call(false, &driving(), now).triggered);

        let config = FusionConfig {
            call_alerts: false,
            ..FusionConfig::default()
        };
        let mut muted = DangerFusionEngine::new(&config, 1.5);
        assert!(!muted.evaluate_call(true, &driving(), now).triggered);
    }
}
