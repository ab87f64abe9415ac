use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};
use uuid::Uuid;

use crate::{
    error::{FtmsError, Result},
    FTMS_SERVICE_UUID,
};

/// Lifecycle of a trainer connection
///
/// States progress forward (`Disconnected` → `Scanning` → `Connecting` →
/// `Connected` → `ControlAcquired`). `Error` is reachable from every state and
/// every state can fall back to `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No transport link
    Disconnected,
    /// Scanning for advertisers
    Scanning,
    /// Connection attempt in progress
    Connecting,
    /// Link established, notifications subscribed
    Connected,
    /// Trainer accepted Request Control
    ControlAcquired,
    /// Session failed
    Error(String),
}

impl ConnectionState {
    const fn rank(&self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Scanning => 1,
            Self::Connecting => 2,
            Self::Connected => 3,
            Self::ControlAcquired => 4,
            Self::Error(_) => u8::MAX,
        }
    }

    /// Check whether moving to `next` is a legal transition
    ///
    /// Forward moves may skip stages (connecting without a scan). The only
    /// backward move besides `Disconnected` is losing control
    /// (`ControlAcquired` → `Connected`).
    #[must_use]
    pub const fn can_transition_to(&self, next: &Self) -> bool {
        match (self, next) {
            (_, Self::Disconnected | Self::Error(_))
            | (Self::ControlAcquired, Self::Connected) => true,
            (Self::Error(_), _) => false,
            _ => next.rank() > self.rank(),
        }
    }

    /// Check if the session has a live link
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::ControlAcquired)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::ControlAcquired => write!(f, "Control Acquired"),
            Self::Error(reason) => write!(f, "Error: {reason}"),
        }
    }
}

/// Authoritative trainer state owned by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Last instantaneous power in watts
    pub power_watts: Option<i16>,
    /// Last instantaneous cadence in rpm
    pub cadence_rpm: Option<f64>,
    /// Last instantaneous speed in km/h
    pub speed_kmh: Option<f64>,
    /// Last heart rate reported by the trainer
    pub heart_rate_bpm: Option<u8>,
    /// Power averaged over the smoothing window
    pub smoothed_power_watts: Option<f64>,
    /// Last target power requested by the application
    pub target_watts: Option<i32>,
    /// Last target power acknowledged by the trainer
    pub confirmed_target_watts: Option<i32>,
    /// Capture time of the last applied sample
    pub last_update: Option<SystemTime>,
    /// Connection state of the underlying session
    pub connection: ConnectionState,
    /// Number of samples applied since start
    pub sample_count: u64,
}

impl Default for TrainerState {
    fn default() -> Self {
        Self {
            power_watts: None,
            cadence_rpm: None,
            speed_kmh: None,
            heart_rate_bpm: None,
            smoothed_power_watts: None,
            target_watts: None,
            confirmed_target_watts: None,
            last_update: None,
            connection: ConnectionState::Disconnected,
            sample_count: 0,
        }
    }
}

/// Power range advertised by the Supported Power Range characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedPowerRange {
    /// Minimum target power in watts
    pub min_watts: i16,
    /// Maximum target power in watts
    pub max_watts: i16,
    /// Smallest accepted increment in watts
    pub increment_watts: u16,
}

/// A device seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedDevice {
    /// Transport address
    pub address: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength
    pub rssi: Option<i16>,
    /// Service UUIDs present in the advertisement
    pub advertised_services: Vec<Uuid>,
}

impl ScannedDevice {
    /// Check whether the device advertises the Fitness Machine Service
    #[must_use]
    pub fn has_ftms(&self) -> bool {
        self.advertised_services.contains(&FTMS_SERVICE_UUID)
    }

    /// Human readable label, `name (address)`
    #[must_use]
    pub fn label(&self) -> String {
        format!(
            "{} ({})",
            self.name.as_deref().unwrap_or("Unknown"),
            self.address
        )
    }
}

/// Bound applied to target power requests before any I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerLimits {
    /// Lowest accepted target in watts
    pub min_watts: i32,
    /// Highest accepted target in watts
    pub max_watts: i32,
}

impl PowerLimits {
    /// Validate a target power against the bound
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::OutOfRange`] if `watts` falls outside the bound.
    pub fn check(&self, watts: i32) -> Result<()> {
        if watts < self.min_watts || watts > self.max_watts {
            return Err(FtmsError::OutOfRange {
                watts,
                min: self.min_watts,
                max: self.max_watts,
            });
        }
        Ok(())
    }
}

impl Default for PowerLimits {
    fn default() -> Self {
        Self {
            min_watts: 0,
            max_watts: 2_000,
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 5_000,
            connect_timeout_ms: 25_000,
        }
    }
}

/// Control point timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Time to wait for a correlated control point response
    pub command_timeout_ms: u64,
    /// Retries after the first attempt times out
    pub max_retry_attempts: u32,
    /// Pause between attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5_000,
            max_retry_attempts: 2,
            retry_delay_ms: 250,
        }
    }
}

/// Configuration of a [`DeviceSession`](crate::DeviceSession)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Scan/connect parameters
    pub params: ConnectionParams,
    /// Control point timeouts
    pub timeouts: TimeoutConfig,
    /// Target power bound
    pub limits: PowerLimits,
    /// Sample buffer capacity; the oldest samples are dropped when full
    pub sample_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            params: ConnectionParams::default(),
            timeouts: TimeoutConfig::default(),
            limits: PowerLimits::default(),
            sample_buffer: 64,
        }
    }
}

/// Configuration of the telemetry [`Engine`](crate::Engine)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Telemetry tick period in milliseconds
    pub tick_interval_ms: u64,
    /// Number of power samples averaged for the smoothed value
    pub smoothing_window: usize,
    /// Target power bound
    pub limits: PowerLimits,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            smoothing_window: 3,
            limits: PowerLimits::default(),
            event_buffer: 128,
        }
    }
}
