use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    error::{FtmsError, Result},
    protocol::IndoorBikeSample,
    session::{DeviceSession, SampleStream},
    types::{ConnectionState, EngineConfig, TrainerState},
    workout::TargetSink,
};

/// Periodic snapshot of the trainer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryTick {
    /// Monotonic tick counter, starting at 1
    pub sequence: u64,
    /// Emission time
    pub emitted_at: SystemTime,
    /// Complete state at emission time
    pub state: TrainerState,
}

/// Events published by the [`Engine`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Periodic telemetry snapshot
    Telemetry(TelemetryTick),
    /// The trainer acknowledged a target
    TargetApplied {
        /// Target passed to [`Engine::set_target`]
        requested: i32,
        /// Target sent after normalization
        applied: i32,
    },
    /// The session rejected a target
    TargetRejected {
        /// Rejected target
        watts: i32,
        /// Rejection reason
        error: String,
    },
    /// The session changed connection state
    ConnectionChanged(ConnectionState),
}

/// Fixed-window mean over the last `window` power readings
#[derive(Debug)]
struct PowerSmoother {
    window: usize,
    values: VecDeque<f64>,
}

impl PowerSmoother {
    fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            values: VecDeque::with_capacity(window),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn push(&mut self, watts: f64) -> f64 {
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(watts);
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }
}

fn read(state: &RwLock<TrainerState>) -> RwLockReadGuard<'_, TrainerState> {
    state.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(state: &RwLock<TrainerState>) -> RwLockWriteGuard<'_, TrainerState> {
    state.write().unwrap_or_else(PoisonError::into_inner)
}

/// Only the fields present in the sample overwrite the previous values
fn apply_sample(state: &RwLock<TrainerState>, smoother: &mut PowerSmoother, sample: &IndoorBikeSample) {
    let mut state = write(state);
    if let Some(power) = sample.power_watts {
        state.power_watts = Some(power);
        state.smoothed_power_watts = Some(smoother.push(f64::from(power)));
    }
    if sample.cadence_rpm.is_some() {
        state.cadence_rpm = sample.cadence_rpm;
    }
    if sample.speed_kmh.is_some() {
        state.speed_kmh = sample.speed_kmh;
    }
    if sample.heart_rate_bpm.is_some() {
        state.heart_rate_bpm = sample.heart_rate_bpm;
    }
    state.last_update = Some(sample.captured_at);
    state.sample_count += 1;
}

/// Owner of the authoritative [`TrainerState`]
///
/// The engine runs four tasks on the current tokio runtime:
///
/// - a sample consumer updating the state from the session's sample stream
/// - a ticker publishing [`EngineEvent::Telemetry`] every `tick_interval_ms`,
///   independent of sample arrival
/// - a connection mirror copying session state changes into the state
/// - a target forwarder sending the latest requested target to the session,
///   skipping targets superseded while a command was in flight
pub struct Engine {
    state: Arc<RwLock<TrainerState>>,
    events: broadcast::Sender<EngineEvent>,
    targets: watch::Sender<Option<i32>>,
    config: EngineConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Take the session's sample stream and start the engine tasks
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::StreamTaken`] if the session's sample stream is
    /// already in use.
    pub fn start(session: Arc<DeviceSession>, config: EngineConfig) -> Result<Self> {
        let samples = session.sample_stream()?;

        let state = Arc::new(RwLock::new(TrainerState {
            connection: session.state(),
            ..TrainerState::default()
        }));
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (targets, target_rx) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(consume_samples(
                samples,
                Arc::clone(&state),
                config.smoothing_window,
                shutdown.subscribe(),
            )),
            tokio::spawn(publish_ticks(
                Arc::clone(&state),
                events.clone(),
                Duration::from_millis(config.tick_interval_ms.max(1)),
                shutdown.subscribe(),
            )),
            tokio::spawn(mirror_connection(
                session.watch_state(),
                Arc::clone(&state),
                events.clone(),
                shutdown.subscribe(),
            )),
            tokio::spawn(forward_targets(
                session,
                target_rx,
                Arc::clone(&state),
                events.clone(),
                shutdown.subscribe(),
            )),
        ];

        info!("Engine started ({}ms ticks)", config.tick_interval_ms);
        Ok(Self {
            state,
            events,
            targets,
            config,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Subscribe to engine events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Complete copy of the current state
    #[must_use]
    pub fn snapshot(&self) -> TrainerState {
        read(&self.state).clone()
    }

    /// Engine configuration
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Request a new ERG target
    ///
    /// The request is recorded in [`TrainerState::target_watts`] at once and
    /// forwarded to the session in the background. The outcome arrives later as
    /// [`EngineEvent::TargetApplied`] or [`EngineEvent::TargetRejected`].
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::OutOfRange`] outside the configured bound and
    /// [`FtmsError::InvalidState`] once the engine is stopped.
    pub fn set_target(&self, watts: i32) -> Result<()> {
        self.config.limits.check(watts)?;
        if self.targets.is_closed() {
            return Err(FtmsError::InvalidState {
                state: "engine stopped".to_string(),
            });
        }

        write(&self.state).target_watts = Some(watts);
        self.targets
            .send(Some(watts))
            .map_err(|_| FtmsError::InvalidState {
                state: "engine stopped".to_string(),
            })
    }

    /// Stop all engine tasks
    ///
    /// No telemetry tick is published after this returns. Calling it again is
    /// a no-op.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            return;
        }

        self.shutdown.send_replace(true);
        for task in tasks.drain(..) {
            // The forwarder may be waiting on a control point response
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Engine task failed: {}", e);
                }
            }
        }
        info!("Engine stopped");
    }
}

impl TargetSink for Engine {
    fn apply_target(&self, watts: i32) -> Result<()> {
        self.set_target(watts)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn consume_samples(
    mut samples: SampleStream,
    state: Arc<RwLock<TrainerState>>,
    smoothing_window: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut smoother = PowerSmoother::new(smoothing_window);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            sample = samples.recv() => match sample {
                Some(sample) => apply_sample(&state, &mut smoother, &sample),
                None => {
                    debug!("Sample stream closed");
                    break;
                }
            },
        }
    }
}

async fn publish_ticks(
    state: Arc<RwLock<TrainerState>>,
    events: broadcast::Sender<EngineEvent>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut sequence = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                sequence += 1;
                let tick = TelemetryTick {
                    sequence,
                    emitted_at: SystemTime::now(),
                    state: read(&state).clone(),
                };
                let _ = events.send(EngineEvent::Telemetry(tick));
            }
        }
    }
}

async fn mirror_connection(
    mut states: watch::Receiver<ConnectionState>,
    state: Arc<RwLock<TrainerState>>,
    events: broadcast::Sender<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let connection = states.borrow_and_update().clone();
                write(&state).connection = connection.clone();
                let _ = events.send(EngineEvent::ConnectionChanged(connection));
            }
        }
    }
}

async fn forward_targets(
    session: Arc<DeviceSession>,
    mut targets: watch::Receiver<Option<i32>>,
    state: Arc<RwLock<TrainerState>>,
    events: broadcast::Sender<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let requested = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            changed = targets.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = *targets.borrow_and_update();
                match latest {
                    Some(watts) => watts,
                    None => continue,
                }
            }
        };

        let event = match session.set_target_power(requested).await {
            Ok(applied) => {
                write(&state).confirmed_target_watts = Some(applied);
                EngineEvent::TargetApplied { requested, applied }
            }
            Err(e) => {
                warn!("Target {}W rejected: {}", requested, e);
                EngineEvent::TargetRejected {
                    watts: requested,
                    error: e.to_string(),
                }
            }
        };
        let _ = events.send(event);
    }
}
