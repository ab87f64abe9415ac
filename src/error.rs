use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when talking to an FTMS trainer
#[derive(Error, Debug)]
pub enum FtmsError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No FTMS capable device found during scanning
    #[error("FTMS device not found")]
    DeviceNotFound,

    /// The transport could not establish a connection
    #[error("Failed to connect to device: {0}")]
    ConnectFailed(String),

    /// The connection attempt did not complete in time
    #[error("Connection attempt timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The session has no live connection
    #[error("Device disconnected")]
    Disconnected,

    /// A required GATT characteristic is missing on the peripheral
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// Transport level write/read/subscribe failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The trainer refused a Request Control command
    #[error("Control request denied by trainer: {result}")]
    ControlDenied {
        /// Result code returned by the trainer
        result: crate::protocol::ResultCode,
    },

    /// A control command was issued without holding control of the trainer
    #[error("Not authorized to control the trainer (state: {state})")]
    NotAuthorized {
        /// Connection state at the time of the request
        state: String,
    },

    /// Another control point command is already in flight
    #[error("Control point busy - a command is already in flight")]
    Busy,

    /// No correlated response arrived after all retry attempts
    #[error("Command 0x{opcode:02X} timed out after {attempts} attempt(s) of {timeout_ms}ms")]
    CommandTimeout {
        /// Opcode of the command that timed out
        opcode: u8,
        /// Number of attempts made
        attempts: u32,
        /// Per-attempt timeout in milliseconds
        timeout_ms: u64,
    },

    /// The trainer does not support the opcode
    #[error("Opcode 0x{opcode:02X} not supported by trainer")]
    OpCodeNotSupported {
        /// Originating opcode
        opcode: u8,
    },

    /// The trainer rejected the command parameters
    #[error("Invalid parameter for opcode 0x{opcode:02X}")]
    InvalidParameter {
        /// Originating opcode
        opcode: u8,
    },

    /// The trainer failed to execute the command
    #[error("Operation 0x{opcode:02X} failed on trainer")]
    OperationFailed {
        /// Originating opcode
        opcode: u8,
    },

    /// The trainer reports that control is not permitted
    #[error("Control not permitted for opcode 0x{opcode:02X}")]
    ControlNotPermitted {
        /// Originating opcode
        opcode: u8,
    },

    /// The trainer answered with a result code outside the FTMS table
    #[error("Unexpected result code 0x{code:02X} for opcode 0x{opcode:02X}")]
    UnexpectedResult {
        /// Originating opcode
        opcode: u8,
        /// Raw result code
        code: u8,
    },

    /// Requested target power is outside the supported bound
    #[error("Target power {watts}W is out of range ({min}W - {max}W)")]
    OutOfRange {
        /// Requested power in watts
        watts: i32,
        /// Lowest accepted power in watts
        min: i32,
        /// Highest accepted power in watts
        max: i32,
    },

    /// A flagged field is not fully present in the payload
    #[error("Truncated payload: {field} needs {needed} byte(s) at offset {offset}, {available} available")]
    TruncatedPayload {
        /// Name of the field being decoded
        field: &'static str,
        /// Byte offset of the field
        offset: usize,
        /// Bytes required by the field
        needed: usize,
        /// Bytes left in the payload
        available: usize,
    },

    /// Control point response does not have the expected structure
    #[error("Malformed control point response: {0}")]
    MalformedResponse(String),

    /// Control mode that is deliberately not implemented
    #[error("{mode} control mode is not supported, use ERG mode")]
    Unsupported {
        /// Name of the control mode
        mode: &'static str,
    },

    /// The sample stream was already handed out
    #[error("Sample stream already taken")]
    StreamTaken,

    /// Operation not valid in the current state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current invalid state description
        state: String,
    },

    /// Invalid call parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Result type for FTMS operations
pub type Result<T> = std::result::Result<T, FtmsError>;

impl FtmsError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectFailed(_)
                | Self::ConnectTimeout { .. }
                | Self::Disconnected
                | Self::DeviceNotFound
        )
    }

    /// Check if this error is recoverable without reconnecting
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Busy
                | Self::CommandTimeout { .. }
                | Self::ControlDenied { .. }
                | Self::NotAuthorized { .. }
                | Self::OutOfRange { .. }
                | Self::TruncatedPayload { .. }
                | Self::MalformedResponse(_)
        )
    }

    /// Check if this error comes from decoding a single frame
    ///
    /// Decode errors drop the offending frame only.
    #[must_use]
    pub const fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::TruncatedPayload { .. } | Self::MalformedResponse(_)
        )
    }
}
