//! A software FTMS trainer
//!
//! [`SimulatedTrainer`] implements the transport traits entirely in memory. It
//! answers control point writes with indications, follows the ERG target with
//! its simulated power output and can be scripted to misbehave (deny control,
//! drop or delay responses, override result codes, emit garbage frames).

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{FtmsError, Result},
    protocol::{
        decode_command, encode_indoor_bike_data, encode_machine_status,
        encode_supported_power_range, ControlPointCommand, ControlPointResponse,
        FitnessMachineStatus, IndoorBikeSample, OpCode, ResultCode, RESPONSE_CODE,
    },
    transport::{NotificationStream, Transport, TransportLink},
    types::{ScannedDevice, SupportedPowerRange},
    CONTROL_POINT_UUID, FTMS_SERVICE_UUID, INDOOR_BIKE_DATA_UUID, MACHINE_STATUS_UUID,
    SUPPORTED_POWER_RANGE_UUID,
};

/// Address the simulated trainer advertises
pub const SIM_ADDRESS: &str = "SIM:00:00:00:00:01";

/// Name the simulated trainer advertises
pub const SIM_NAME: &str = "Ergometer Sim";

const CHANNEL_CAPACITY: usize = 256;

/// Behaviour of a [`SimulatedTrainer`]
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Period of generated Indoor Bike Data; `None` disables generation
    pub telemetry_interval: Option<Duration>,
    /// Delay before each control point indication
    pub response_delay: Duration,
    /// Value of the Supported Power Range characteristic; `None` omits it
    pub power_range: Option<SupportedPowerRange>,
    /// Answer Request Control with Control Not Permitted
    pub deny_control: bool,
    /// Never complete connection attempts
    pub unreachable: bool,
    /// Expose the Fitness Machine Status characteristic
    pub status_characteristic: bool,
    /// Cadence reported in generated telemetry
    pub cadence_rpm: f64,
    /// Latency of characteristic reads
    pub read_delay: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            telemetry_interval: Some(Duration::from_millis(250)),
            response_delay: Duration::from_millis(20),
            power_range: Some(SupportedPowerRange {
                min_watts: 0,
                max_watts: 1_500,
                increment_watts: 1,
            }),
            deny_control: false,
            unreachable: false,
            status_characteristic: true,
            cadence_rpm: 90.0,
            read_delay: Duration::ZERO,
        }
    }
}

/// Scripted answer to the next control point write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimResponse {
    /// Answer with this result code
    Respond(ResultCode),
    /// Send no indication at all
    Drop,
    /// Answer with Success after an extra delay
    Delay(Duration),
    /// Send these raw bytes as the indication
    Raw(Vec<u8>),
}

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    control_granted: bool,
    target_watts: Option<i32>,
    power_watts: f64,
    elapsed: Duration,
    commands: Vec<ControlPointCommand>,
    overrides: VecDeque<SimResponse>,
}

struct Inner {
    config: SimConfig,
    state: Mutex<SimState>,
    bike_tx: broadcast::Sender<Vec<u8>>,
    control_tx: broadcast::Sender<Vec<u8>>,
    status_tx: broadcast::Sender<Vec<u8>>,
    telemetry: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_telemetry(&self) {
        if let Some(handle) = self
            .telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Apply a decoded command and pick the result code a real trainer would return
    fn apply(&self, command: &ControlPointCommand) -> ResultCode {
        let mut state = self.state();
        state.commands.push(command.clone());

        match command.opcode {
            OpCode::RequestControl if self.config.deny_control => ResultCode::ControlNotPermitted,
            OpCode::RequestControl => {
                state.control_granted = true;
                ResultCode::Success
            }
            _ if !state.control_granted => ResultCode::ControlNotPermitted,
            OpCode::Reset => {
                state.control_granted = false;
                state.target_watts = None;
                drop(state);
                self.notify_status(FitnessMachineStatus::Reset);
                ResultCode::Success
            }
            OpCode::SetTargetPower => match command.target_power() {
                Some(watts) => {
                    state.target_watts = Some(watts);
                    drop(state);
                    if let Ok(wire) = i16::try_from(watts) {
                        self.notify_status(FitnessMachineStatus::TargetPowerChanged(wire));
                    }
                    ResultCode::Success
                }
                None => ResultCode::InvalidParameter,
            },
            OpCode::StartOrResume => {
                drop(state);
                self.notify_status(FitnessMachineStatus::StartedOrResumed);
                ResultCode::Success
            }
            OpCode::StopOrPause => {
                drop(state);
                self.notify_status(FitnessMachineStatus::StoppedOrPaused);
                ResultCode::Success
            }
            OpCode::SetTargetResistance | OpCode::SetIndoorBikeSimulation => {
                ResultCode::OpCodeNotSupported
            }
        }
    }

    fn notify_status(&self, status: FitnessMachineStatus) {
        if self.config.status_characteristic {
            let _ = self.status_tx.send(encode_machine_status(status).to_vec());
        }
    }

    /// Advance the simulated rider one step towards the ERG target
    fn step_telemetry(&self, interval: Duration) {
        let sample = {
            let mut state = self.state();
            if let Some(target) = state.target_watts {
                state.power_watts += (f64::from(target) - state.power_watts) / 2.0;
            }
            state.elapsed += interval;

            #[allow(clippy::cast_possible_truncation)]
            let power = state.power_watts.round() as i16;
            let mut sample = IndoorBikeSample::new(Some(power), Some(self.config.cadence_rpm));
            sample.speed_kmh = Some(self.config.cadence_rpm / 3.0);
            sample.elapsed_time_s = Some(u16::try_from(state.elapsed.as_secs()).unwrap_or(u16::MAX));
            sample
        };

        let _ = self.bike_tx.send(encode_indoor_bike_data(&sample).to_vec());
    }
}

/// In-memory FTMS trainer implementing [`Transport`]
#[derive(Clone)]
pub struct SimulatedTrainer {
    inner: Arc<Inner>,
}

impl SimulatedTrainer {
    /// Create a simulated trainer
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let (bike_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (control_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(SimState::default()),
                bike_tx,
                control_tx,
                status_tx,
                telemetry: Mutex::new(None),
            }),
        }
    }

    /// Script the answer to the next control point write
    ///
    /// Scripted answers are consumed in FIFO order before default handling.
    pub fn push_response(&self, response: SimResponse) {
        self.inner.state().overrides.push_back(response);
    }

    /// Publish a raw Indoor Bike Data notification
    pub fn inject_indoor_bike_data(&self, payload: &[u8]) {
        let _ = self.inner.bike_tx.send(payload.to_vec());
    }

    /// Publish an Indoor Bike Data notification built from `sample`
    pub fn inject_sample(&self, sample: &IndoorBikeSample) {
        let _ = self.inner.bike_tx.send(encode_indoor_bike_data(sample).to_vec());
    }

    /// Publish a Fitness Machine Status notification
    pub fn emit_status(&self, status: FitnessMachineStatus) {
        if matches!(status, FitnessMachineStatus::ControlPermissionLost) {
            self.inner.state().control_granted = false;
        }
        let _ = self
            .inner
            .status_tx
            .send(encode_machine_status(status).to_vec());
    }

    /// Commands received so far, in arrival order
    #[must_use]
    pub fn commands(&self) -> Vec<ControlPointCommand> {
        self.inner.state().commands.clone()
    }

    /// Current ERG target
    #[must_use]
    pub fn target_watts(&self) -> Option<i32> {
        self.inner.state().target_watts
    }

    /// Check if a link is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state().connected
    }

    fn start_telemetry(&self) {
        let Some(interval) = self.inner.config.telemetry_interval else {
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.step_telemetry(interval);
            }
        });

        if let Some(previous) = self
            .inner
            .telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }
    }
}

impl Default for SimulatedTrainer {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

#[async_trait]
impl Transport for SimulatedTrainer {
    async fn scan(&self, duration: Duration) -> Result<Vec<ScannedDevice>> {
        tokio::time::sleep(duration.min(Duration::from_millis(10))).await;

        Ok(vec![ScannedDevice {
            address: SIM_ADDRESS.to_string(),
            name: Some(SIM_NAME.to_string()),
            rssi: Some(-42),
            advertised_services: vec![FTMS_SERVICE_UUID],
        }])
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn TransportLink>> {
        if address != SIM_ADDRESS {
            return Err(FtmsError::DeviceNotFound);
        }
        if self.inner.config.unreachable {
            futures::future::pending::<()>().await;
        }

        {
            let mut state = self.inner.state();
            state.connected = true;
            state.control_granted = false;
        }
        self.start_telemetry();
        info!("Simulated trainer connected");

        Ok(Box::new(SimLink {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct SimLink {
    inner: Arc<Inner>,
}

fn receiver_stream(rx: broadcast::Receiver<Vec<u8>>) -> NotificationStream {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(value) => return Some((value, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Simulated notification stream lagged by {skipped} message(s)");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl TransportLink for SimLink {
    fn address(&self) -> String {
        SIM_ADDRESS.to_string()
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream> {
        let rx = match characteristic {
            c if c == INDOOR_BIKE_DATA_UUID => self.inner.bike_tx.subscribe(),
            c if c == CONTROL_POINT_UUID => self.inner.control_tx.subscribe(),
            c if c == MACHINE_STATUS_UUID && self.inner.config.status_characteristic => {
                self.inner.status_tx.subscribe()
            }
            other => return Err(FtmsError::CharacteristicNotFound(other)),
        };
        Ok(receiver_stream(rx))
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        if characteristic != CONTROL_POINT_UUID {
            return Err(FtmsError::Transport(format!(
                "{characteristic} is not writable"
            )));
        }
        if !self.inner.state().connected {
            return Err(FtmsError::Disconnected);
        }
        debug!("Simulated trainer received {value:02X?}");

        let scripted = self.inner.state().overrides.pop_front();
        let mut delay = self.inner.config.response_delay;
        let indication = match (decode_command(value), scripted) {
            (_, Some(SimResponse::Drop)) => {
                debug!("Dropping response to {value:02X?}");
                return Ok(());
            }
            (_, Some(SimResponse::Raw(bytes))) => bytes,
            (Ok(command), Some(SimResponse::Respond(result))) => {
                self.inner.state().commands.push(command.clone());
                ControlPointResponse::new(command.opcode, result).to_bytes().to_vec()
            }
            (Ok(command), scripted) => {
                if let Some(SimResponse::Delay(extra)) = scripted {
                    delay += extra;
                }
                let result = self.inner.apply(&command);
                ControlPointResponse::new(command.opcode, result).to_bytes().to_vec()
            }
            (Err(_), _) => {
                let opcode = value.first().copied().unwrap_or_default();
                vec![RESPONSE_CODE, opcode, ResultCode::OpCodeNotSupported.as_u8()]
            }
        };

        let control_tx = self.inner.control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = control_tx.send(indication);
        });

        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        if !self.inner.config.read_delay.is_zero() {
            tokio::time::sleep(self.inner.config.read_delay).await;
        }
        match (characteristic, self.inner.config.power_range) {
            (c, Some(range)) if c == SUPPORTED_POWER_RANGE_UUID => {
                Ok(encode_supported_power_range(&range).to_vec())
            }
            (other, _) => Err(FtmsError::CharacteristicNotFound(other)),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.stop_telemetry();
        let mut state = self.inner.state();
        state.connected = false;
        state.control_granted = false;
        info!("Simulated trainer disconnected");
        Ok(())
    }
}
