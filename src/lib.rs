#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Ergometer
//!
//! A Rust library for driving indoor cycling trainers in ERG mode over the
//! Bluetooth Fitness Machine Service (FTMS).
//!
//! The crate is organised in four layers, leaves first:
//!
//! - **[`protocol`]**: pure encode/decode of FTMS payloads (Indoor Bike Data,
//!   Fitness Machine Control Point, Fitness Machine Status, Supported Power Range)
//! - **[`session`]**: one [`DeviceSession`] per trainer connection. It owns the
//!   connection state machine, serializes control point commands through a single
//!   command slot and exposes the decoded telemetry as a sample stream
//! - **[`engine`]**: the [`Engine`] consumes samples, keeps the authoritative
//!   [`TrainerState`], publishes a telemetry tick every second and forwards
//!   target power changes to the session
//! - **[`workout`]**: the [`WorkoutExecutor`] walks a structured workout step by
//!   step and classifies live metrics into compliance [`Zone`]s
//!
//! The BLE radio itself sits behind the [`transport::Transport`] trait. A
//! `btleplug` implementation lives in [`ble`] and an in-memory trainer in [`sim`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ergometer::{ble::BleTransport, DeviceSession, Engine, EngineConfig, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BleTransport::new().await?);
//!     let session = Arc::new(DeviceSession::new(transport, SessionConfig::default()));
//!
//!     session.connect_first().await?;
//!     session.request_control().await?;
//!
//!     let engine = Engine::start(Arc::clone(&session), EngineConfig::default())?;
//!     engine.set_target(200)?;
//!
//!     let mut events = engine.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!
//!     engine.stop().await;
//!     session.disconnect().await;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// btleplug implementation of the transport seam
pub mod ble;
/// Telemetry engine and authoritative trainer state
pub mod engine;
/// Error types and handling
pub mod error;
/// FTMS payload codec
pub mod protocol;
/// Per-connection device session and control point state machine
pub mod session;
/// In-memory simulated FTMS trainer
pub mod sim;
/// Transport traits implemented by BLE collaborators
pub mod transport;
/// Type definitions, configuration and shared data structures
pub mod types;
/// Structured workout execution
pub mod workout;
/// Zone classification and coaching hints
pub mod zone;

pub use engine::{Engine, EngineEvent, TelemetryTick};
pub use error::{FtmsError, Result};
pub use protocol::{
    ControlPointCommand, ControlPointResponse, FitnessMachineStatus, IndoorBikeSample, OpCode,
    ResultCode,
};
pub use session::{DeviceSession, SampleStream};
pub use types::{
    ConnectionParams, ConnectionState, EngineConfig, PowerLimits, ScannedDevice, SessionConfig,
    SupportedPowerRange, TimeoutConfig, TrainerState,
};
pub use workout::{
    TargetSink, WorkoutDefinition, WorkoutEvent, WorkoutExecutor, WorkoutProgress,
    WorkoutRunState, WorkoutStatus, WorkoutStep,
};
pub use zone::{classify, Band, Coaching, CoachingStabilizer, Zone, ZoneConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds a full 128-bit UUID from a 16-bit Bluetooth SIG assigned number.
const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Fitness Machine Service UUID (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = sig_uuid(0x1826);

/// Indoor Bike Data characteristic UUID (0x2AD2), notify only
pub const INDOOR_BIKE_DATA_UUID: Uuid = sig_uuid(0x2AD2);

/// Supported Power Range characteristic UUID (0x2AD8), read only
pub const SUPPORTED_POWER_RANGE_UUID: Uuid = sig_uuid(0x2AD8);

/// Fitness Machine Control Point characteristic UUID (0x2AD9)
///
/// Commands are written with response and the trainer answers each one with an
/// indication on the same characteristic.
pub const CONTROL_POINT_UUID: Uuid = sig_uuid(0x2AD9);

/// Fitness Machine Status characteristic UUID (0x2ADA), notify only
pub const MACHINE_STATUS_UUID: Uuid = sig_uuid(0x2ADA);
