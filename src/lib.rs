//! Phone-while-driving detection: noisy tilt, speed and network signals
//! fused into a rate-limited danger verdict.
//!
//! The estimators and the [`FusionEngine`] are pure and synchronous;
//! [`spawn_monitor`] runs them on a single tokio task fed by
//! [`SensorDriver`]s and host pushes.

pub mod config;
pub mod danger;
pub mod error;
pub mod events;
pub mod health_monitor;
pub mod live_status;
pub mod monitor;
pub mod network;
pub mod probe;
pub mod recording;
pub mod restart_manager;
pub mod runtime;
pub mod sensors;
pub mod smoothing;
pub mod speed;
pub mod tilt;
pub mod traffic;

pub use config::MonitorConfig;
pub use danger::{DangerCause, DangerFusionEngine, DangerVerdict, LockState};
pub use error::{MonitorError, MonitorResult};
pub use events::{AlertNotifier, EventSink, MonitorEvent};
pub use live_status::LiveStatus;
pub use monitor::FusionEngine;
pub use network::{NetworkActivityEstimator, NetworkState, ProbeOutcome, TrafficSample};
pub use recording::{InputRecorder, RecordedInput, ReplaySummary};
pub use runtime::{spawn_monitor, spawn_recording_monitor, MonitorHandle};
pub use sensors::{CallState, SensorDriver, SensorInput, SensorKind};
pub use smoothing::SampleWindow;
pub use speed::{LocationFix, SpeedEstimator, SpeedState};
pub use tilt::{TiltClassification, TiltEstimator, TiltState};
