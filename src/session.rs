use futures::stream::{self, Stream, StreamExt};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{broadcast, oneshot, watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{FtmsError, Result},
    protocol::{
        decode, decode_control_response, decode_machine_status, decode_supported_power_range,
        normalize_power_target, ControlPointCommand, ControlPointResponse, FitnessMachineStatus,
        IndoorBikeSample, OpCode,
    },
    transport::{NotificationStream, Transport, TransportLink},
    types::{ConnectionState, ScannedDevice, SessionConfig, SupportedPowerRange},
    CONTROL_POINT_UUID, INDOOR_BIKE_DATA_UUID, MACHINE_STATUS_UUID, SUPPORTED_POWER_RANGE_UUID,
};

const STATUS_BUFFER: usize = 32;

/// The command currently waiting for its control point indication
struct PendingCommand {
    opcode: OpCode,
    responder: oneshot::Sender<ControlPointResponse>,
}

type PendingSlot = Arc<Mutex<Option<PendingCommand>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply a state transition, rejecting moves the state machine does not allow
fn transition(state_tx: &watch::Sender<ConnectionState>, next: ConnectionState) -> Result<()> {
    let mut outcome = Ok(());
    state_tx.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        if !current.can_transition_to(&next) {
            outcome = Err(FtmsError::InvalidState {
                state: format!("cannot move from {current} to {next}"),
            });
            return false;
        }
        debug!("Connection state: {} -> {}", current, next);
        *current = next.clone();
        true
    });
    outcome
}

/// Drop back to `Connected` if control is currently held
fn release_control(state_tx: &watch::Sender<ConnectionState>) -> bool {
    state_tx.send_if_modified(|current| {
        if *current == ConnectionState::ControlAcquired {
            *current = ConnectionState::Connected;
            true
        } else {
            false
        }
    })
}

/// Single-consumer stream of decoded Indoor Bike Data samples
///
/// Backed by a bounded broadcast buffer: when the consumer falls behind the
/// oldest samples are dropped and the gap is logged.
pub struct SampleStream {
    rx: broadcast::Receiver<IndoorBikeSample>,
}

impl SampleStream {
    /// Wait for the next sample
    ///
    /// Returns `None` once the owning session is gone.
    pub async fn recv(&mut self) -> Option<IndoorBikeSample> {
        loop {
            match self.rx.recv().await {
                Ok(sample) => return Some(sample),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Sample consumer lagged, dropped {skipped} oldest sample(s)");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a [`Stream`]
    pub fn into_stream(self) -> impl Stream<Item = IndoorBikeSample> + Send + 'static {
        stream::unfold(self, |mut samples| async move {
            samples.recv().await.map(|sample| (sample, samples))
        })
    }
}

/// One connection to an FTMS trainer
///
/// The session owns the connection state machine and the control point. Only
/// one command is outstanding at a time: callers queue in FIFO order on the
/// command slot, or fail fast with [`FtmsError::Busy`] through the `try_`
/// variants.
pub struct DeviceSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    lifecycle: AsyncMutex<()>,
    command_slot: AsyncMutex<()>,
    link: Mutex<Option<Arc<dyn TransportLink>>>,
    pending: PendingSlot,
    sample_tx: broadcast::Sender<IndoorBikeSample>,
    sample_rx: Mutex<Option<broadcast::Receiver<IndoorBikeSample>>>,
    status_tx: broadcast::Sender<FitnessMachineStatus>,
    power_range: Mutex<Option<SupportedPowerRange>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceSession {
    /// Create a disconnected session over `transport`
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (sample_tx, sample_rx) = broadcast::channel(config.sample_buffer.max(1));
        let (status_tx, _) = broadcast::channel(STATUS_BUFFER);

        Self {
            transport,
            config,
            state_tx: Arc::new(state_tx),
            lifecycle: AsyncMutex::new(()),
            command_slot: AsyncMutex::new(()),
            link: Mutex::new(None),
            pending: Arc::new(Mutex::new(None)),
            sample_tx,
            sample_rx: Mutex::new(Some(sample_rx)),
            status_tx,
            power_range: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Observe connection state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Session configuration
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Supported Power Range read when control was acquired
    #[must_use]
    pub fn power_range(&self) -> Option<SupportedPowerRange> {
        *lock(&self.power_range)
    }

    /// Address of the connected trainer
    #[must_use]
    pub fn address(&self) -> Option<String> {
        lock(&self.link).as_ref().map(|link| link.address())
    }

    /// Subscribe to decoded Fitness Machine Status notifications
    #[must_use]
    pub fn status_events(&self) -> broadcast::Receiver<FitnessMachineStatus> {
        self.status_tx.subscribe()
    }

    /// Take the sample stream
    ///
    /// The stream survives reconnects and cannot be restarted.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::StreamTaken`] on every call after the first.
    pub fn sample_stream(&self) -> Result<SampleStream> {
        lock(&self.sample_rx)
            .take()
            .map(|rx| SampleStream { rx })
            .ok_or(FtmsError::StreamTaken)
    }

    fn transition(&self, next: ConnectionState) -> Result<()> {
        transition(&self.state_tx, next)
    }

    /// Scan for trainers
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidState`] while connected, or the transport error.
    pub async fn scan(&self) -> Result<Vec<ScannedDevice>> {
        let _lifecycle = self.lifecycle.lock().await;
        self.prepare_for_link()?;
        self.transition(ConnectionState::Scanning)?;

        let result = self
            .transport
            .scan(Duration::from_millis(self.config.params.scan_timeout_ms))
            .await;
        self.transition(ConnectionState::Disconnected)?;

        let devices = result?;
        info!("Scan found {} device(s)", devices.len());
        Ok(devices)
    }

    /// Scan and connect to the FTMS advertiser with the strongest signal
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::DeviceNotFound`] if no advertiser carries the
    /// Fitness Machine Service, otherwise the same errors as [`Self::connect`].
    pub async fn connect_first(&self) -> Result<ScannedDevice> {
        let device = self
            .scan()
            .await?
            .into_iter()
            .filter(ScannedDevice::has_ftms)
            .max_by_key(|device| device.rssi.unwrap_or(i16::MIN))
            .ok_or(FtmsError::DeviceNotFound)?;

        info!("Selected trainer {}", device.label());
        self.connect(&device.address).await?;
        Ok(device)
    }

    /// Connect to the trainer at `address` and subscribe to its notifications
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::ConnectTimeout`] if the link is not up within
    /// `connect_timeout_ms`, [`FtmsError::ConnectFailed`] for any other failure.
    /// The session is left `Disconnected` and can be reused.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.prepare_for_link()?;
        self.transition(ConnectionState::Connecting)?;
        info!("Connecting to {}", address);

        let timeout_ms = self.config.params.connect_timeout_ms;
        let opened = match timeout(Duration::from_millis(timeout_ms), self.open_link(address)).await
        {
            Ok(result) => result,
            Err(_) => Err(FtmsError::ConnectTimeout { timeout_ms }),
        };

        match opened {
            Ok((link, tasks)) => {
                *lock(&self.link) = Some(link);
                lock(&self.tasks).extend(tasks);
                *lock(&self.power_range) = None;
                self.transition(ConnectionState::Connected)?;
                info!("Connected to {}", address);
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", address, e);
                self.transition(ConnectionState::Disconnected)?;
                Err(e)
            }
        }
    }

    /// Reject link operations while connected and clear leftovers of a lost link
    fn prepare_for_link(&self) -> Result<()> {
        let current = self.state();
        if current.is_connected() || current == ConnectionState::Connecting {
            return Err(FtmsError::InvalidState {
                state: current.to_string(),
            });
        }

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.link).take();
        if matches!(current, ConnectionState::Error(_)) {
            self.transition(ConnectionState::Disconnected)?;
        }
        Ok(())
    }

    async fn open_link(
        &self,
        address: &str,
    ) -> Result<(Arc<dyn TransportLink>, Vec<JoinHandle<()>>)> {
        let link: Arc<dyn TransportLink> = match self.transport.connect(address).await {
            Ok(link) => Arc::from(link),
            Err(FtmsError::ConnectFailed(reason)) => return Err(FtmsError::ConnectFailed(reason)),
            Err(e) => return Err(FtmsError::ConnectFailed(e.to_string())),
        };

        match self.subscribe_all(link.as_ref()).await {
            Ok(tasks) => Ok((link, tasks)),
            Err(e) => {
                if let Err(disconnect_error) = link.disconnect().await {
                    debug!("Ignoring disconnect failure after setup error: {disconnect_error}");
                }
                Err(FtmsError::ConnectFailed(e.to_string()))
            }
        }
    }

    async fn subscribe_all(&self, link: &dyn TransportLink) -> Result<Vec<JoinHandle<()>>> {
        let bike = link.subscribe(INDOOR_BIKE_DATA_UUID).await?;
        let control = link.subscribe(CONTROL_POINT_UUID).await?;
        let status = match link.subscribe(MACHINE_STATUS_UUID).await {
            Ok(stream) => Some(stream),
            Err(FtmsError::CharacteristicNotFound(_)) => {
                debug!("Trainer has no Fitness Machine Status characteristic");
                None
            }
            Err(e) => return Err(e),
        };

        let mut tasks = vec![
            tokio::spawn(pump_samples(
                bike,
                self.sample_tx.clone(),
                Arc::clone(&self.state_tx),
                Arc::clone(&self.pending),
            )),
            tokio::spawn(pump_control(control, Arc::clone(&self.pending))),
        ];
        if let Some(status) = status {
            tasks.push(tokio::spawn(pump_status(
                status,
                self.status_tx.clone(),
                Arc::clone(&self.state_tx),
            )));
        }
        Ok(tasks)
    }

    fn current_link(&self) -> Result<Arc<dyn TransportLink>> {
        lock(&self.link).clone().ok_or(FtmsError::Disconnected)
    }

    fn require_control(&self) -> Result<()> {
        match self.state() {
            ConnectionState::ControlAcquired => Ok(()),
            other => Err(FtmsError::NotAuthorized {
                state: other.to_string(),
            }),
        }
    }

    /// Request control of the trainer
    ///
    /// A no-op when control is already held. On success the Supported Power
    /// Range is read, if the trainer exposes it.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidState`] unless `Connected`, and
    /// [`FtmsError::ControlDenied`] if the trainer answers with anything but
    /// Success. A denied request leaves the session `Connected`.
    pub async fn request_control(&self) -> Result<()> {
        let slot = self.command_slot.lock().await;
        match self.state() {
            ConnectionState::ControlAcquired => return Ok(()),
            ConnectionState::Connected => {}
            other => {
                return Err(FtmsError::InvalidState {
                    state: other.to_string(),
                })
            }
        }

        let response = self
            .execute_in_slot(&ControlPointCommand::request_control())
            .await?;
        if !response.result.is_success() {
            warn!("Trainer denied control: {}", response.result);
            return Err(FtmsError::ControlDenied {
                result: response.result,
            });
        }

        self.transition(ConnectionState::ControlAcquired)?;
        info!("Control acquired");
        drop(slot);
        self.load_power_range().await;
        Ok(())
    }

    async fn load_power_range(&self) {
        let Ok(link) = self.current_link() else {
            return;
        };

        match link.read(SUPPORTED_POWER_RANGE_UUID).await {
            Ok(bytes) => match decode_supported_power_range(&bytes) {
                Ok(range) => {
                    info!(
                        "Supported power range: {}-{}W in {}W steps",
                        range.min_watts, range.max_watts, range.increment_watts
                    );
                    *lock(&self.power_range) = Some(range);
                }
                Err(e) => warn!("Ignoring malformed Supported Power Range: {e}"),
            },
            Err(e) => debug!("Supported Power Range unavailable: {e}"),
        }
    }

    /// Set the ERG target, waiting in line behind earlier commands
    ///
    /// The target is normalized to the trainer's Supported Power Range when
    /// known. Returns the value actually sent.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::NotAuthorized`] without control,
    /// [`FtmsError::OutOfRange`] outside the configured bound,
    /// [`FtmsError::CommandTimeout`] once all attempts went unanswered, or the
    /// typed error matching a non-Success result code.
    pub async fn set_target_power(&self, watts: i32) -> Result<i32> {
        let _slot = self.command_slot.lock().await;
        self.send_target_power(watts).await
    }

    /// Set the ERG target without queueing
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::Busy`] if another command is in flight, otherwise
    /// the same errors as [`Self::set_target_power`].
    pub async fn try_set_target_power(&self, watts: i32) -> Result<i32> {
        let _slot = self.command_slot.try_lock().map_err(|_| FtmsError::Busy)?;
        self.send_target_power(watts).await
    }

    async fn send_target_power(&self, watts: i32) -> Result<i32> {
        self.require_control()?;
        self.config.limits.check(watts)?;

        let applied = self
            .power_range()
            .map_or(watts, |range| normalize_power_target(watts, &range));
        if applied != watts {
            debug!("Normalized target {}W to {}W", watts, applied);
        }

        let command = ControlPointCommand::set_target_power(applied, &self.config.limits)?;
        self.execute_checked(&command).await?;
        info!("Target power set to {}W", applied);
        Ok(applied)
    }

    /// Start or resume the trainer session
    ///
    /// # Errors
    ///
    /// Same as [`Self::set_target_power`] minus the range check.
    pub async fn start_or_resume(&self) -> Result<()> {
        self.execute_controlled(&ControlPointCommand::start_or_resume())
            .await
    }

    /// Stop (or pause) the trainer session
    ///
    /// # Errors
    ///
    /// Same as [`Self::start_or_resume`].
    pub async fn stop_or_pause(&self, pause: bool) -> Result<()> {
        self.execute_controlled(&ControlPointCommand::stop_or_pause(pause))
            .await
    }

    /// Reset the trainer; control is released
    ///
    /// # Errors
    ///
    /// Same as [`Self::start_or_resume`].
    pub async fn reset(&self) -> Result<()> {
        self.execute_controlled(&ControlPointCommand::reset()).await?;
        release_control(&self.state_tx);
        info!("Trainer reset, control released");
        Ok(())
    }

    /// Resistance mode
    ///
    /// # Errors
    ///
    /// Always [`FtmsError::Unsupported`]; no command is sent.
    pub fn set_target_resistance(&self, level: f64) -> Result<()> {
        debug!("Rejecting resistance level {} in state {}", level, self.state());
        Err(FtmsError::Unsupported { mode: "Resistance" })
    }

    /// Slope (simulation) mode
    ///
    /// # Errors
    ///
    /// Always [`FtmsError::Unsupported`]; no command is sent.
    pub fn set_target_slope(&self, grade_percent: f64) -> Result<()> {
        debug!("Rejecting {}% grade in state {}", grade_percent, self.state());
        Err(FtmsError::Unsupported { mode: "Slope" })
    }

    async fn execute_controlled(&self, command: &ControlPointCommand) -> Result<()> {
        let _slot = self.command_slot.lock().await;
        self.require_control()?;
        self.execute_checked(command).await
    }

    async fn execute_checked(&self, command: &ControlPointCommand) -> Result<()> {
        let response = self.execute_in_slot(command).await?;
        response.result.into_result(command.opcode as u8)
    }

    /// Write `command` and wait for its correlated response, retrying on timeout
    ///
    /// Must be called with the command slot held.
    async fn execute_in_slot(&self, command: &ControlPointCommand) -> Result<ControlPointResponse> {
        let link = self.current_link()?;
        let timeouts = &self.config.timeouts;
        let attempts = timeouts.max_retry_attempts.saturating_add(1);
        let opcode = command.opcode as u8;
        let bytes = command.to_bytes();

        for attempt in 1..=attempts {
            let (responder, response) = oneshot::channel();
            *lock(&self.pending) = Some(PendingCommand {
                opcode: command.opcode,
                responder,
            });

            debug!(
                "Sending command 0x{:02X} (attempt {}/{}): {:02X?}",
                opcode, attempt, attempts, bytes
            );
            if let Err(e) = link.write(CONTROL_POINT_UUID, &bytes).await {
                lock(&self.pending).take();
                return Err(e);
            }

            match timeout(Duration::from_millis(timeouts.command_timeout_ms), response).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(_)) => return Err(FtmsError::Disconnected),
                Err(_) => {
                    lock(&self.pending).take();
                    if attempt < attempts {
                        warn!(
                            "Command 0x{:02X} unanswered on attempt {}/{}, retrying in {}ms",
                            opcode, attempt, attempts, timeouts.retry_delay_ms
                        );
                        tokio::time::sleep(Duration::from_millis(timeouts.retry_delay_ms)).await;
                    }
                }
            }
        }

        error!("Command 0x{:02X} failed after {} attempts", opcode, attempts);
        Err(FtmsError::CommandTimeout {
            opcode,
            attempts,
            timeout_ms: timeouts.command_timeout_ms,
        })
    }

    /// Tear the link down
    ///
    /// Cancels an outstanding command wait (it fails with
    /// [`FtmsError::Disconnected`]) and leaves the session `Disconnected`.
    /// Calling it again is a no-op.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        lock(&self.pending).take();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        let link = lock(&self.link).take();
        if let Some(link) = link {
            if let Err(e) = link.disconnect().await {
                warn!("Transport disconnect failed: {}", e);
            }
            info!("Disconnected from {}", link.address());
        }

        let _ = self.transition(ConnectionState::Disconnected);
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

async fn pump_samples(
    mut notifications: NotificationStream,
    samples: broadcast::Sender<IndoorBikeSample>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    pending: PendingSlot,
) {
    while let Some(value) = notifications.next().await {
        match decode(&value) {
            Ok(sample) => {
                let _ = samples.send(sample);
            }
            Err(e) => warn!("Dropping Indoor Bike Data frame {:02X?}: {}", value, e),
        }
    }

    warn!("Indoor Bike Data notifications ended, link lost");
    lock(&pending).take();
    let _ = transition(
        &state_tx,
        ConnectionState::Error("notification stream closed".to_string()),
    );
}

async fn pump_control(mut indications: NotificationStream, pending: PendingSlot) {
    while let Some(value) = indications.next().await {
        let response = match decode_control_response(&value) {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping control point indication {:02X?}: {}", value, e);
                continue;
            }
        };

        let mut slot = lock(&pending);
        match slot.take() {
            Some(command) if response.answers(command.opcode) => {
                debug!(
                    "Response to 0x{:02X}: {}",
                    response.request_opcode, response.result
                );
                let _ = command.responder.send(response);
            }
            other => {
                *slot = other;
                warn!(
                    "Ignoring uncorrelated response to 0x{:02X} ({})",
                    response.request_opcode, response.result
                );
            }
        }
    }
}

async fn pump_status(
    mut notifications: NotificationStream,
    events: broadcast::Sender<FitnessMachineStatus>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
) {
    while let Some(value) = notifications.next().await {
        let status = match decode_machine_status(&value) {
            Ok(status) => status,
            Err(e) => {
                warn!("Dropping Fitness Machine Status frame {:02X?}: {}", value, e);
                continue;
            }
        };

        debug!("Fitness Machine Status: {:?}", status);
        if matches!(
            status,
            FitnessMachineStatus::ControlPermissionLost | FitnessMachineStatus::Reset
        ) && release_control(&state_tx)
        {
            warn!("Trainer released control ({:?})", status);
        }
        let _ = events.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::ResultCode,
        sim::{SimConfig, SimResponse, SimulatedTrainer, SIM_ADDRESS},
        types::TimeoutConfig,
    };
    use tokio_test::{assert_err, assert_ok};

    fn quiet_sim() -> SimulatedTrainer {
        SimulatedTrainer::new(SimConfig {
            telemetry_interval: None,
            ..SimConfig::default()
        })
    }

    fn session_for(sim: &SimulatedTrainer) -> Arc<DeviceSession> {
        Arc::new(DeviceSession::new(
            Arc::new(sim.clone()),
            SessionConfig::default(),
        ))
    }

    async fn controlled(sim: &SimulatedTrainer) -> Arc<DeviceSession> {
        let session = session_for(sim);
        assert_ok!(session.connect(SIM_ADDRESS).await);
        assert_ok!(session.request_control().await);
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_stream_samples() {
        let sim = quiet_sim();
        let session = session_for(&sim);
        let mut states = session.watch_state();

        session.connect(SIM_ADDRESS).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(states.has_changed().unwrap());
        assert_eq!(session.address().as_deref(), Some(SIM_ADDRESS));

        let mut samples = session.sample_stream().unwrap();
        assert!(matches!(
            session.sample_stream(),
            Err(FtmsError::StreamTaken)
        ));

        sim.inject_indoor_bike_data(&[0x40, 0x00, 0xB4, 0x00]);
        let sample = samples.recv().await.unwrap();
        assert_eq!(sample.power_watts, Some(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_do_not_end_stream() {
        let sim = quiet_sim();
        let session = session_for(&sim);
        session.connect(SIM_ADDRESS).await.unwrap();
        let mut samples = session.sample_stream().unwrap();

        sim.inject_indoor_bike_data(&[0x40]);
        sim.inject_indoor_bike_data(&[0x44, 0x00, 0xB0]);
        sim.inject_indoor_bike_data(&[0x04, 0x00, 0xB0, 0x00]);

        let sample = samples.recv().await.unwrap();
        assert_eq!(sample.cadence_rpm, Some(88.0));
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_consumer_keeps_newest_samples() {
        let sim = quiet_sim();
        let session = Arc::new(DeviceSession::new(
            Arc::new(sim.clone()),
            SessionConfig {
                sample_buffer: 2,
                ..SessionConfig::default()
            },
        ));
        session.connect(SIM_ADDRESS).await.unwrap();
        let mut samples = session.sample_stream().unwrap();

        for watts in [100, 110, 120, 130, 140] {
            sim.inject_sample(&IndoorBikeSample::new(Some(watts), None));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(samples.recv().await.unwrap().power_watts, Some(130));
        assert_eq!(samples.recv().await.unwrap().power_watts, Some(140));

        sim.inject_sample(&IndoorBikeSample::new(Some(150), None));
        assert_eq!(samples.recv().await.unwrap().power_watts, Some(150));
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_range_read_does_not_hold_command_slot() {
        let sim = SimulatedTrainer::new(SimConfig {
            telemetry_interval: None,
            read_delay: Duration::from_secs(2),
            ..SimConfig::default()
        });
        let session = session_for(&sim);
        session.connect(SIM_ADDRESS).await.unwrap();
        let mut states = session.watch_state();

        let acquiring = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.request_control().await }
        });
        states
            .wait_for(|state| *state == ConnectionState::ControlAcquired)
            .await
            .unwrap();

        // The range read is still in flight
        assert_eq!(session.power_range(), None);
        assert_eq!(assert_ok!(session.try_set_target_power(150).await), 150);

        assert_ok!(acquiring.await.unwrap());
        assert!(session.power_range().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_leaves_session_reusable() {
        let sim = SimulatedTrainer::new(SimConfig {
            unreachable: true,
            telemetry_interval: None,
            ..SimConfig::default()
        });
        let session = session_for(&sim);

        let result = session.connect(SIM_ADDRESS).await;
        assert!(matches!(
            result,
            Err(FtmsError::ConnectTimeout { timeout_ms: 25_000 })
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let result = session.connect("AA:BB:CC:DD:EE:FF").await;
        assert!(matches!(result, Err(FtmsError::ConnectFailed(_))));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_first_and_scan_states() {
        let sim = quiet_sim();
        let session = session_for(&sim);

        let device = session.connect_first().await.unwrap();
        assert_eq!(device.address, SIM_ADDRESS);
        assert_eq!(session.state(), ConnectionState::Connected);

        assert!(matches!(
            session.scan().await,
            Err(FtmsError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_denied_stays_connected() {
        let sim = SimulatedTrainer::new(SimConfig {
            deny_control: true,
            telemetry_interval: None,
            ..SimConfig::default()
        });
        let session = session_for(&sim);
        session.connect(SIM_ADDRESS).await.unwrap();

        let result = session.request_control().await;
        assert!(matches!(
            result,
            Err(FtmsError::ControlDenied {
                result: ResultCode::ControlNotPermitted
            })
        ));
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_control_requires_connection() {
        let session = session_for(&quiet_sim());
        assert!(matches!(
            session.request_control().await,
            Err(FtmsError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_target_power_requires_control() {
        let sim = quiet_sim();
        let session = session_for(&sim);
        session.connect(SIM_ADDRESS).await.unwrap();

        assert!(matches!(
            session.set_target_power(200).await,
            Err(FtmsError::NotAuthorized { .. })
        ));
        assert!(sim.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_target_power() {
        let sim = quiet_sim();
        let session = controlled(&sim).await;
        assert_eq!(session.state(), ConnectionState::ControlAcquired);
        assert!(session.power_range().is_some());

        assert_eq!(session.set_target_power(200).await.unwrap(), 200);
        assert_eq!(sim.target_watts(), Some(200));

        assert!(matches!(
            session.set_target_power(2_500).await,
            Err(FtmsError::OutOfRange { watts: 2_500, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_normalized_to_power_range() {
        let sim = SimulatedTrainer::new(SimConfig {
            telemetry_interval: None,
            power_range: Some(SupportedPowerRange {
                min_watts: 30,
                max_watts: 400,
                increment_watts: 5,
            }),
            ..SimConfig::default()
        });
        let session = controlled(&sim).await;

        assert_eq!(session.set_target_power(33).await.unwrap(), 35);
        assert_eq!(session.set_target_power(420).await.unwrap(), 400);
        assert_eq!(sim.target_watts(), Some(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_command_times_out_after_retries() {
        let sim = quiet_sim();
        let session = controlled(&sim).await;
        for _ in 0..3 {
            sim.push_response(SimResponse::Drop);
        }

        let result = session.set_target_power(150).await;
        assert!(matches!(
            result,
            Err(FtmsError::CommandTimeout {
                opcode: 0x05,
                attempts: 3,
                timeout_ms: 5_000
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncorrelated_response_is_ignored() {
        let sim = quiet_sim();
        let session = controlled(&sim).await;
        sim.push_response(SimResponse::Raw(vec![0x80, 0x07, 0x01]));

        assert_eq!(session.set_target_power(180).await.unwrap(), 180);
        assert_eq!(sim.target_watts(), Some(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_codes_map_to_errors() {
        let sim = quiet_sim();
        let session = controlled(&sim).await;

        sim.push_response(SimResponse::Respond(ResultCode::InvalidParameter));
        assert!(matches!(
            session.set_target_power(150).await,
            Err(FtmsError::InvalidParameter { opcode: 0x05 })
        ));

        sim.push_response(SimResponse::Respond(ResultCode::OperationFailed));
        assert!(matches!(
            session.start_or_resume().await,
            Err(FtmsError::OperationFailed { opcode: 0x07 })
        ));

        sim.push_response(SimResponse::Respond(ResultCode::Unknown(0x0A)));
        assert!(matches!(
            session.set_target_power(150).await,
            Err(FtmsError::UnexpectedResult {
                opcode: 0x05,
                code: 0x0A
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_set_target_power_busy() {
        let sim = quiet_sim();
        let session = controlled(&sim).await;
        sim.push_response(SimResponse::Delay(Duration::from_secs(2)));

        let queued = Arc::clone(&session);
        let in_flight = tokio::spawn(async move { queued.set_target_power(120).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            session.try_set_target_power(130).await,
            Err(FtmsError::Busy)
        ));
        assert_eq!(in_flight.await.unwrap().unwrap(), 120);
        assert_eq!(session.try_set_target_power(130).await.unwrap(), 130);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_commands_run_in_fifo_order() {
        let sim = quiet_sim();
        let session = controlled(&sim).await;
        sim.push_response(SimResponse::Delay(Duration::from_millis(500)));

        let mut handles = Vec::new();
        for watts in [100, 150, 200, 250] {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(
                async move { session.set_target_power(watts).await },
            ));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }

        let targets: Vec<i32> = sim
            .commands()
            .iter()
            .filter_map(ControlPointCommand::target_power)
            .collect();
        assert_eq!(targets, vec![100, 150, 200, 250]);
        assert_eq!(sim.target_watts(), Some(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_outstanding_wait() {
        let sim = quiet_sim();
        let session = controlled(&sim).await;
        sim.push_response(SimResponse::Drop);

        let waiting = Arc::clone(&session);
        let in_flight = tokio::spawn(async move { waiting.set_target_power(150).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        session.disconnect().await;
        assert!(matches!(
            in_flight.await.unwrap(),
            Err(FtmsError::Disconnected)
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!sim.is_connected());

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);

        assert_ok!(session.connect(SIM_ADDRESS).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_permission_lost() {
        let sim = quiet_sim();
        let session = controlled(&sim).await;
        let mut status = session.status_events();

        sim.emit_status(FitnessMachineStatus::ControlPermissionLost);
        assert_eq!(
            status.recv().await.unwrap(),
            FitnessMachineStatus::ControlPermissionLost
        );
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_err!(session.set_target_power(100).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_releases_control() {
        let sim = quiet_sim();
        let session = controlled(&sim).await;

        session.reset().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_ok!(session.request_control().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_modes() {
        let sim = quiet_sim();
        let session = controlled(&sim).await;
        let sent = sim.commands().len();

        assert!(matches!(
            session.set_target_resistance(40.0),
            Err(FtmsError::Unsupported { mode: "Resistance" })
        ));
        assert!(matches!(
            session.set_target_slope(3.5),
            Err(FtmsError::Unsupported { mode: "Slope" })
        ));
        assert_eq!(sim.commands().len(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_timeouts_config() {
        let sim = quiet_sim();
        let config = SessionConfig {
            timeouts: TimeoutConfig {
                command_timeout_ms: 100,
                max_retry_attempts: 0,
                retry_delay_ms: 0,
            },
            ..SessionConfig::default()
        };
        let session = DeviceSession::new(Arc::new(sim.clone()), config);
        session.connect(SIM_ADDRESS).await.unwrap();
        session.request_control().await.unwrap();

        sim.push_response(SimResponse::Drop);
        assert!(matches!(
            session.set_target_power(100).await,
            Err(FtmsError::CommandTimeout { attempts: 1, .. })
        ));
    }
}
