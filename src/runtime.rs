// runtime.rs: the serialized monitor timeline.
//
// One tokio task owns the FusionEngine. Driver samples, host commands and
// supervisor ticks all arrive over channels and are applied on that task,
// one at a time. Samples carry the generation of the subscription that
// produced them; anything from a torn-down subscription, or arriving after
// stop, is discarded before it can touch state.

use std::collections::BTreeMap;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::config::{MonitorConfig, SupervisorConfig};
use crate::error::{MonitorError, MonitorResult};
use crate::events::{AlertNotifier, EventSink, MonitorEvent};
use crate::health_monitor::HealthMonitor;
use crate::live_status::LiveStatus;
use crate::monitor::FusionEngine;
use crate::recording::{InputRecorder, RecordedInput};
use crate::restart_manager::RestartManager;
use crate::sensors::{SampleSender, SensorDriver, SensorInput, SensorKind, SensorMessage, SensorPayload};

const COMMAND_CAPACITY: usize = 64;

enum Command {
    Push(SensorInput),
    Status(oneshot::Sender<LiveStatus>),
    Stop(oneshot::Sender<LiveStatus>),
}

/// Host-side handle to a running monitor
pub struct MonitorHandle {
    commands: mpsc::Sender<Command>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Deliver a host-observed input (lock, call, connectivity...)
    pub async fn push(&self, input: SensorInput) -> MonitorResult<()> {
        self.commands
            .send(Command::Push(input))
            .await
            .map_err(|_| MonitorError::Stopped)
    }

    pub async fn status(&self) -> MonitorResult<LiveStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .await
            .map_err(|_| MonitorError::Stopped)?;
        rx.await.map_err(|_| MonitorError::Stopped)
    }

    /// Stop every driver and wait for the monitor task to finish. Once this
    /// returns, no sample can reach the engine.
    pub async fn stop(&mut self) -> MonitorResult<LiveStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop(tx))
            .await
            .map_err(|_| MonitorError::Stopped)?;
        let status = rx.await.map_err(|_| MonitorError::Stopped)?;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(status)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Start monitoring on the current tokio runtime.
pub fn spawn_monitor<S, N>(
    config: MonitorConfig,
    sink: S,
    notifier: N,
    drivers: Vec<Box<dyn SensorDriver>>,
) -> MonitorResult<MonitorHandle>
where
    S: EventSink + 'static,
    N: AlertNotifier + 'static,
{
    spawn(config, Box::new(sink), Box::new(notifier), drivers, None)
}

/// Like [`spawn_monitor`], also recording every raw input for later replay
pub fn spawn_recording_monitor<S, N, R>(
    config: MonitorConfig,
    sink: S,
    notifier: N,
    drivers: Vec<Box<dyn SensorDriver>>,
    recorder: R,
) -> MonitorResult<MonitorHandle>
where
    S: EventSink + 'static,
    N: AlertNotifier + 'static,
    R: InputRecorder + 'static,
{
    spawn(
        config,
        Box::new(sink),
        Box::new(notifier),
        drivers,
        Some(Box::new(recorder)),
    )
}

fn spawn(
    config: MonitorConfig,
    sink: Box<dyn EventSink>,
    notifier: Box<dyn AlertNotifier>,
    drivers: Vec<Box<dyn SensorDriver>>,
    recorder: Option<Box<dyn InputRecorder>>,
) -> MonitorResult<MonitorHandle> {
    config.validate()?;
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (sample_tx, sample_rx) = mpsc::channel(config.supervisor.channel_capacity);

    let task = MonitorTask::new(&config, sink, notifier, recorder, drivers, sample_tx);
    let join = tokio::spawn(task.run(command_rx, sample_rx));

    Ok(MonitorHandle {
        commands: command_tx,
        task: Some(join),
    })
}

struct MonitorTask {
    engine: FusionEngine,
    sink: Box<dyn EventSink>,
    notifier: Box<dyn AlertNotifier>,
    recorder: Option<Box<dyn InputRecorder>>,
    drivers: BTreeMap<SensorKind, Box<dyn SensorDriver>>,
    generations: BTreeMap<SensorKind, u64>,
    next_generation: u64,
    health: HealthMonitor,
    restarts: RestartManager,
    supervisor: SupervisorConfig,
    sample_tx: mpsc::Sender<SensorMessage>,
    started_at: Instant,
    stopped: bool,
}

impl MonitorTask {
    fn new(
        config: &MonitorConfig,
        sink: Box<dyn EventSink>,
        notifier: Box<dyn AlertNotifier>,
        recorder: Option<Box<dyn InputRecorder>>,
        drivers: Vec<Box<dyn SensorDriver>>,
        sample_tx: mpsc::Sender<SensorMessage>,
    ) -> Self {
        let mut by_kind = BTreeMap::new();
        for driver in drivers {
            let kind = driver.kind();
            if by_kind.insert(kind, driver).is_some() {
                warn!("Duplicate {} driver, keeping the last one", kind.name());
            }
        }

        Self {
            engine: FusionEngine::new(config),
            sink,
            notifier,
            recorder,
            drivers: by_kind,
            generations: BTreeMap::new(),
            next_generation: 0,
            health: HealthMonitor::new(),
            restarts: RestartManager::new(),
            supervisor: config.supervisor.clone(),
            sample_tx,
            started_at: Instant::now(),
            stopped: false,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut samples: mpsc::Receiver<SensorMessage>,
    ) {
        self.start(Instant::now());

        let mut ticker = interval(Duration::from_millis(self.supervisor.health_check_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => self.supervise(Instant::now()),
                Some(message) = samples.recv() => self.on_message(message, Instant::now()),
                command = commands.recv() => match command {
                    Some(Command::Push(input)) => self.apply(&input),
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(self.status(Instant::now()));
                    }
                    Some(Command::Stop(reply)) => {
                        self.shutdown();
                        let _ = reply.send(self.status(Instant::now()));
                        break;
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
            }
        }
    }

    fn start(&mut self, now: Instant) {
        self.notice("Monitoring started".to_string());

        let kinds: Vec<SensorKind> = self.drivers.keys().copied().collect();
        for kind in kinds {
            if kind.is_supervised() {
                self.health.track(kind, &self.supervisor, now);
                self.restarts.track(kind, &self.supervisor);
            }
            if let Err(e) = self.start_driver(kind) {
                warn!("{} failed to start: {}", kind.name(), e);
                if kind.is_supervised() {
                    self.tear_down(kind, e.to_string(), now);
                }
            }
        }
    }

    fn start_driver(&mut self, kind: SensorKind) -> MonitorResult<()> {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.generations.insert(kind, generation);

        let sender = SampleSender::new(kind, generation, self.sample_tx.clone());
        match self.drivers.get_mut(&kind) {
            Some(driver) => driver.start(sender),
            None => Err(MonitorError::SensorFailed(format!("no {} driver", kind.name()))),
        }
    }

    fn on_message(&mut self, message: SensorMessage, now: Instant) {
        if self.stopped {
            return;
        }
        if self.generations.get(&message.kind) != Some(&message.generation) {
            debug!(
                "Discarding {} message from stale subscription {}",
                message.kind.name(),
                message.generation
            );
            return;
        }

        match message.payload {
            SensorPayload::Sample(input) => {
                if let Some(health) = self.health.get_mut(message.kind) {
                    health.record_sample(now);
                }
                if let Some(restart) = self.restarts.get_mut(message.kind) {
                    restart.record_sample();
                }
                self.apply(&input);
            }
            SensorPayload::Error(reason) => {
                debug!("{} read error: {}", message.kind.name(), reason);
                if let Some(health) = self.health.get_mut(message.kind) {
                    health.record_error();
                }
            }
        }
    }

    fn apply(&mut self, input: &SensorInput) {
        if self.stopped {
            return;
        }
        let now = Utc::now();
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(&RecordedInput::new(input.clone(), now));
        }
        let events = self.engine.handle(input, now);
        self.publish(&events);
    }

    fn publish(&mut self, events: &[MonitorEvent]) {
        for event in events {
            self.sink.deliver(event);
            if let MonitorEvent::DangerEvent(alert) = event {
                self.notifier.notify(alert);
            }
        }
    }

    fn notice(&mut self, message: String) {
        info!("{}", message);
        let event = self.engine.status_notice(message, Utc::now());
        self.sink.deliver(&event);
    }

    // ─── Supervision ────────────────────────────────────────────────────────

    fn supervise(&mut self, now: Instant) {
        if self.stopped {
            return;
        }

        for kind in self.restarts.due(now) {
            self.restart(kind, now);
        }

        let mut failing = Vec::new();
        for kind in self.health.kinds() {
            let running = self
                .restarts
                .get(kind)
                .map(|r| r.is_running())
                .unwrap_or(false);
            if !running {
                continue;
            }
            if let Some(reason) = self.health.get(kind).and_then(|h| h.restart_reason(now)) {
                failing.push((kind, reason));
            }
        }
        if failing.is_empty() {
            return;
        }
        for (kind, reason) in failing {
            self.tear_down(kind, reason, now);
        }
        warn!("{}", self.health.format_status(now, &self.restarts));
        debug!("Restarts: {}", self.restarts.status_report(now));
    }

    fn tear_down(&mut self, kind: SensorKind, reason: String, now: Instant) {
        if let Some(driver) = self.drivers.get_mut(&kind) {
            driver.stop();
        }
        self.generations.remove(&kind);

        let (scheduled, max_attempts) = match self.restarts.get_mut(kind) {
            Some(restart) => (restart.schedule(now), restart.max_attempts()),
            None => return,
        };
        match scheduled {
            Some(backoff) => self.notice(format!(
                "{} restarting in {:.1}s: {}",
                kind.name(),
                backoff.as_secs_f64(),
                reason
            )),
            None => self.notice(format!(
                "{} abandoned after {} restart attempts",
                kind.name(),
                max_attempts
            )),
        }
    }

    fn restart(&mut self, kind: SensorKind, now: Instant) {
        match self.start_driver(kind) {
            Ok(()) => {
                let (attempt, max_attempts) = match self.restarts.get_mut(kind) {
                    Some(restart) => {
                        restart.record_started();
                        (restart.attempts(), restart.max_attempts())
                    }
                    None => (0, 0),
                };
                if let Some(health) = self.health.get_mut(kind) {
                    health.reset(now);
                }
                self.notice(format!(
                    "{} restarted (attempt {}/{})",
                    kind.name(),
                    attempt,
                    max_attempts
                ));
            }
            Err(e) => {
                warn!("{} restart failed: {}", kind.name(), e);
                self.tear_down(kind, e.to_string(), now);
            }
        }
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        for driver in self.drivers.values_mut() {
            driver.stop();
        }
        self.generations.clear();
        self.notice("Monitoring stopped".to_string());
        self.stopped = true;
    }

    fn status(&self, now: Instant) -> LiveStatus {
        let uptime = now.saturating_duration_since(self.started_at).as_secs();
        LiveStatus::from_engine(&self.engine, uptime)
            .with_sensors(self.health.check_health(now, &self.restarts))
    }
}
