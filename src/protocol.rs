use crate::{
    error::{FtmsError, Result},
    types::{PowerLimits, SupportedPowerRange},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};
use tracing::trace;

/// First byte of every control point response indication
pub const RESPONSE_CODE: u8 = 0x80;

/// Minimum length of a control point response: response code, request opcode, result
pub const MIN_RESPONSE_LEN: usize = 3;

/// Fitness Machine Control Point opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    /// Request control of the trainer
    RequestControl = 0x00,
    /// Reset the trainer, releases control
    Reset = 0x01,
    /// Set target resistance level
    SetTargetResistance = 0x04,
    /// Set target power (ERG)
    SetTargetPower = 0x05,
    /// Start or resume the session
    StartOrResume = 0x07,
    /// Stop or pause the session
    StopOrPause = 0x08,
    /// Set indoor bike simulation parameters (grade, wind, crr, cw)
    SetIndoorBikeSimulation = 0x11,
}

impl OpCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x04 => Some(Self::SetTargetResistance),
            0x05 => Some(Self::SetTargetPower),
            0x07 => Some(Self::StartOrResume),
            0x08 => Some(Self::StopOrPause),
            0x11 => Some(Self::SetIndoorBikeSimulation),
            _ => None,
        }
    }
}

/// Result codes carried by control point responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// Command executed
    Success,
    /// Opcode not supported by the trainer
    OpCodeNotSupported,
    /// Parameter rejected
    InvalidParameter,
    /// Trainer failed to execute the command
    OperationFailed,
    /// Control not permitted (control not requested or lost)
    ControlNotPermitted,
    /// Code outside the FTMS table
    Unknown(u8),
}

impl ResultCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::OpCodeNotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Unknown(other),
        }
    }

    /// Convert to the wire value
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Success => 0x01,
            Self::OpCodeNotSupported => 0x02,
            Self::InvalidParameter => 0x03,
            Self::OperationFailed => 0x04,
            Self::ControlNotPermitted => 0x05,
            Self::Unknown(code) => code,
        }
    }

    /// Check if the code reports success
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Map a non-success code to the typed error for `opcode`
    ///
    /// # Errors
    ///
    /// Returns the [`FtmsError`] matching the code; `Success` maps to `Ok`.
    pub fn into_result(self, opcode: u8) -> Result<()> {
        match self {
            Self::Success => Ok(()),
            Self::OpCodeNotSupported => Err(FtmsError::OpCodeNotSupported { opcode }),
            Self::InvalidParameter => Err(FtmsError::InvalidParameter { opcode }),
            Self::OperationFailed => Err(FtmsError::OperationFailed { opcode }),
            Self::ControlNotPermitted => Err(FtmsError::ControlNotPermitted { opcode }),
            Self::Unknown(code) => Err(FtmsError::UnexpectedResult { opcode, code }),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::OpCodeNotSupported => write!(f, "Op Code Not Supported"),
            Self::InvalidParameter => write!(f, "Invalid Parameter"),
            Self::OperationFailed => write!(f, "Operation Failed"),
            Self::ControlNotPermitted => write!(f, "Control Not Permitted"),
            Self::Unknown(code) => write!(f, "Unknown (0x{code:02X})"),
        }
    }
}

/// Indoor Bike Data presence flags
///
/// The flags are the first two payload bytes, little-endian. Bit 0 is "More
/// Data": instantaneous speed follows the flags only when it is clear. Every
/// other bit marks one optional field and the fields follow in bit order. Bits
/// 13-15 are reserved and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndoorBikeDataFlags(u16);

impl IndoorBikeDataFlags {
    /// More Data; instantaneous speed (u16 in 0.01 km/h) is absent when set
    pub const MORE_DATA: u16 = 1 << 0;
    /// Average speed, u16 in 0.01 km/h
    pub const AVERAGE_SPEED: u16 = 1 << 1;
    /// Instantaneous cadence, u16 in 0.5 rpm
    pub const INSTANTANEOUS_CADENCE: u16 = 1 << 2;
    /// Average cadence, u16 in 0.5 rpm
    pub const AVERAGE_CADENCE: u16 = 1 << 3;
    /// Total distance, u24 in meters
    pub const TOTAL_DISTANCE: u16 = 1 << 4;
    /// Resistance level, s16
    pub const RESISTANCE_LEVEL: u16 = 1 << 5;
    /// Instantaneous power, s16 in watts
    pub const INSTANTANEOUS_POWER: u16 = 1 << 6;
    /// Average power, s16 in watts
    pub const AVERAGE_POWER: u16 = 1 << 7;
    /// Expended energy: total u16, per hour u16, per minute u8
    pub const EXPENDED_ENERGY: u16 = 1 << 8;
    /// Heart rate, u8 in bpm
    pub const HEART_RATE: u16 = 1 << 9;
    /// Metabolic equivalent, u8 in 0.1 MET
    pub const METABOLIC_EQUIVALENT: u16 = 1 << 10;
    /// Elapsed time, u16 in seconds
    pub const ELAPSED_TIME: u16 = 1 << 11;
    /// Remaining time, u16 in seconds
    pub const REMAINING_TIME: u16 = 1 << 12;

    /// Wrap raw flag bits
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw flag bits
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Check if a field flag is set
    #[must_use]
    pub const fn contains(self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    /// Check if instantaneous speed follows the flags (More Data clear)
    #[must_use]
    pub const fn speed_present(self) -> bool {
        !self.contains(Self::MORE_DATA)
    }
}

/// Field table in wire order after instantaneous speed: flag, name, width in bytes
const FIELDS: [(u16, &str, usize); 12] = [
    (IndoorBikeDataFlags::AVERAGE_SPEED, "average speed", 2),
    (IndoorBikeDataFlags::INSTANTANEOUS_CADENCE, "instantaneous cadence", 2),
    (IndoorBikeDataFlags::AVERAGE_CADENCE, "average cadence", 2),
    (IndoorBikeDataFlags::TOTAL_DISTANCE, "total distance", 3),
    (IndoorBikeDataFlags::RESISTANCE_LEVEL, "resistance level", 2),
    (IndoorBikeDataFlags::INSTANTANEOUS_POWER, "instantaneous power", 2),
    (IndoorBikeDataFlags::AVERAGE_POWER, "average power", 2),
    (IndoorBikeDataFlags::EXPENDED_ENERGY, "expended energy", 5),
    (IndoorBikeDataFlags::HEART_RATE, "heart rate", 1),
    (IndoorBikeDataFlags::METABOLIC_EQUIVALENT, "metabolic equivalent", 1),
    (IndoorBikeDataFlags::ELAPSED_TIME, "elapsed time", 2),
    (IndoorBikeDataFlags::REMAINING_TIME, "remaining time", 2),
];

/// Highest cadence a real rider produces
const MAX_PLAUSIBLE_CADENCE_RPM: f64 = 220.0;
/// Lowest power a trainer reports
const MIN_PLAUSIBLE_POWER_WATTS: i16 = -200;
/// Highest power a trainer reports
const MAX_PLAUSIBLE_POWER_WATTS: i16 = 3000;
/// Highest speed a trainer reports
const MAX_PLAUSIBLE_SPEED_KMH: f64 = 130.0;

/// One decoded Indoor Bike Data notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndoorBikeSample {
    /// Instantaneous power in watts
    pub power_watts: Option<i16>,
    /// Instantaneous cadence in rpm
    pub cadence_rpm: Option<f64>,
    /// Instantaneous speed in km/h
    pub speed_kmh: Option<f64>,
    /// Heart rate in bpm
    pub heart_rate_bpm: Option<u8>,
    /// Elapsed time reported by the trainer in seconds
    pub elapsed_time_s: Option<u16>,
    /// Bytes consumed by the flags and flagged fields
    pub consumed: usize,
    /// Capture timestamp
    pub captured_at: SystemTime,
}

impl IndoorBikeSample {
    /// Create a sample carrying only power and cadence, captured now
    #[must_use]
    pub fn new(power_watts: Option<i16>, cadence_rpm: Option<f64>) -> Self {
        Self {
            power_watts,
            cadence_rpm,
            speed_kmh: None,
            heart_rate_bpm: None,
            elapsed_time_s: None,
            consumed: 0,
            captured_at: SystemTime::now(),
        }
    }

    /// Check that every decoded metric lies in a physically possible range
    #[must_use]
    pub fn is_plausible(&self) -> bool {
        self.cadence_rpm
            .is_none_or(|cadence| (0.0..=MAX_PLAUSIBLE_CADENCE_RPM).contains(&cadence))
            && self.power_watts.is_none_or(|power| {
                (MIN_PLAUSIBLE_POWER_WATTS..=MAX_PLAUSIBLE_POWER_WATTS).contains(&power)
            })
            && self
                .speed_kmh
                .is_none_or(|speed| (0.0..=MAX_PLAUSIBLE_SPEED_KMH).contains(&speed))
    }
}

/// Decode an Indoor Bike Data (0x2AD2) payload
///
/// Layout:
/// - Bytes 0-1: flags (u16 little-endian, see [`IndoorBikeDataFlags`])
/// - Instantaneous speed when More Data is clear
/// - Then each flagged field in bit order, offsets strictly cumulative
///
/// Some trainers get the More Data bit backwards, so the payload is decoded
/// with and without the speed field. The plausible decode wins, then the one
/// leaving fewer trailing bytes, then the standard alignment.
///
/// Unit conversions: cadence is raw / 2 rpm, speed is raw / 100 km/h, power
/// is signed watts. Reserved flag bits and trailing bytes are ignored.
///
/// # Errors
///
/// Returns [`FtmsError::TruncatedPayload`] if the flags are missing, or if a
/// flagged field is cut short under both alignments. The error describes the
/// standard alignment.
pub fn decode(data: &[u8]) -> Result<IndoorBikeSample> {
    if data.len() < 2 {
        return Err(FtmsError::TruncatedPayload {
            field: "flags",
            offset: 0,
            needed: 2,
            available: data.len(),
        });
    }

    let flags = IndoorBikeDataFlags::from_bits(u16::from_le_bytes([data[0], data[1]]));
    let standard = decode_aligned(data, flags, flags.speed_present());
    let swapped = decode_aligned(data, flags, !flags.speed_present());

    let rank = |sample: &IndoorBikeSample| (!sample.is_plausible(), data.len() - sample.consumed);
    let sample = match (standard, swapped) {
        (Ok(standard), Ok(swapped)) if rank(&swapped) < rank(&standard) => {
            trace!("Indoor Bike Data flags {:#06X} decoded with More Data inverted", flags.bits());
            swapped
        }
        (Ok(sample), _) => sample,
        (Err(_), Ok(swapped)) => {
            trace!("Indoor Bike Data flags {:#06X} decoded with More Data inverted", flags.bits());
            swapped
        }
        (Err(err), Err(_)) => return Err(err),
    };

    if sample.consumed < data.len() {
        trace!(
            "Ignoring {} trailing Indoor Bike Data byte(s) (flags {:#06X})",
            data.len() - sample.consumed,
            flags.bits()
        );
    }

    Ok(sample)
}

/// Decode the fields after the flags, with or without instantaneous speed
fn decode_aligned(
    data: &[u8],
    flags: IndoorBikeDataFlags,
    speed_present: bool,
) -> Result<IndoorBikeSample> {
    let mut buf = data;
    buf.advance(2);
    let mut sample = IndoorBikeSample::new(None, None);

    let fields = speed_present
        .then_some((IndoorBikeDataFlags::MORE_DATA, "instantaneous speed", 2))
        .into_iter()
        .chain(FIELDS.into_iter().filter(|&(flag, _, _)| flags.contains(flag)));

    for (flag, field, width) in fields {
        if buf.remaining() < width {
            return Err(FtmsError::TruncatedPayload {
                field,
                offset: data.len() - buf.remaining(),
                needed: width,
                available: buf.remaining(),
            });
        }

        match flag {
            IndoorBikeDataFlags::MORE_DATA => {
                sample.speed_kmh = Some(f64::from(buf.get_u16_le()) / 100.0);
            }
            IndoorBikeDataFlags::INSTANTANEOUS_CADENCE => {
                sample.cadence_rpm = Some(f64::from(buf.get_u16_le()) / 2.0);
            }
            IndoorBikeDataFlags::INSTANTANEOUS_POWER => {
                sample.power_watts = Some(buf.get_i16_le());
            }
            IndoorBikeDataFlags::HEART_RATE => {
                sample.heart_rate_bpm = Some(buf.get_u8());
            }
            IndoorBikeDataFlags::ELAPSED_TIME => {
                sample.elapsed_time_s = Some(buf.get_u16_le());
            }
            _ => buf.advance(width),
        }
    }

    sample.consumed = data.len() - buf.remaining();
    Ok(sample)
}

/// Encode an Indoor Bike Data payload from a sample
///
/// Only speed, cadence, power, heart rate and elapsed time are written. More
/// Data is set when the sample has no speed. Values are rounded to the wire
/// resolution.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn encode_indoor_bike_data(sample: &IndoorBikeSample) -> Bytes {
    let mut flags = 0u16;
    let mut body = BytesMut::with_capacity(16);

    match sample.speed_kmh {
        Some(speed) => {
            body.put_u16_le((speed * 100.0).round().clamp(0.0, f64::from(u16::MAX)) as u16);
        }
        None => flags |= IndoorBikeDataFlags::MORE_DATA,
    }
    if let Some(cadence) = sample.cadence_rpm {
        flags |= IndoorBikeDataFlags::INSTANTANEOUS_CADENCE;
        body.put_u16_le((cadence * 2.0).round().clamp(0.0, f64::from(u16::MAX)) as u16);
    }
    if let Some(power) = sample.power_watts {
        flags |= IndoorBikeDataFlags::INSTANTANEOUS_POWER;
        body.put_i16_le(power);
    }
    if let Some(heart_rate) = sample.heart_rate_bpm {
        flags |= IndoorBikeDataFlags::HEART_RATE;
        body.put_u8(heart_rate);
    }
    if let Some(elapsed) = sample.elapsed_time_s {
        flags |= IndoorBikeDataFlags::ELAPSED_TIME;
        body.put_u16_le(elapsed);
    }

    let mut buf = BytesMut::with_capacity(2 + body.len());
    buf.put_u16_le(flags);
    buf.extend_from_slice(&body);
    buf.freeze()
}

/// A command written to the Fitness Machine Control Point
///
/// Wire format: opcode (1 byte) followed by opcode specific parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPointCommand {
    /// Command opcode
    pub opcode: OpCode,
    /// Parameter bytes
    pub parameters: Vec<u8>,
}

impl ControlPointCommand {
    /// Create a command without parameters
    #[must_use]
    pub const fn new(opcode: OpCode) -> Self {
        Self {
            opcode,
            parameters: Vec::new(),
        }
    }

    /// Request Control (0x00)
    #[must_use]
    pub const fn request_control() -> Self {
        Self::new(OpCode::RequestControl)
    }

    /// Reset (0x01)
    #[must_use]
    pub const fn reset() -> Self {
        Self::new(OpCode::Reset)
    }

    /// Start or Resume (0x07)
    #[must_use]
    pub const fn start_or_resume() -> Self {
        Self::new(OpCode::StartOrResume)
    }

    /// Stop (0x01 parameter) or Pause (0x02 parameter) (0x08)
    #[must_use]
    pub fn stop_or_pause(pause: bool) -> Self {
        Self {
            opcode: OpCode::StopOrPause,
            parameters: vec![if pause { 0x02 } else { 0x01 }],
        }
    }

    /// Set Target Power (0x05) with a signed little-endian watts parameter
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::OutOfRange`] if `watts` falls outside `limits` or
    /// does not fit the 16-bit wire field.
    pub fn set_target_power(watts: i32, limits: &PowerLimits) -> Result<Self> {
        limits.check(watts)?;
        let wire = i16::try_from(watts).map_err(|_| FtmsError::OutOfRange {
            watts,
            min: i32::from(i16::MIN),
            max: i32::from(i16::MAX),
        })?;

        Ok(Self {
            opcode: OpCode::SetTargetPower,
            parameters: wire.to_le_bytes().to_vec(),
        })
    }

    /// Target power carried by a Set Target Power command
    #[must_use]
    pub fn target_power(&self) -> Option<i32> {
        match (self.opcode, self.parameters.as_slice()) {
            (OpCode::SetTargetPower, [lo, hi, ..]) => {
                Some(i32::from(i16::from_le_bytes([*lo, *hi])))
            }
            _ => None,
        }
    }

    /// Serialize command to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.parameters.len());
        buf.put_u8(self.opcode as u8);
        buf.extend_from_slice(&self.parameters);
        buf.freeze()
    }
}

/// Encode a Set Target Power command
///
/// # Errors
///
/// Returns [`FtmsError::OutOfRange`] if `watts` falls outside `limits`.
pub fn encode_set_target_power(watts: i32, limits: &PowerLimits) -> Result<Bytes> {
    Ok(ControlPointCommand::set_target_power(watts, limits)?.to_bytes())
}

/// Parse a control point command from bytes
///
/// # Errors
///
/// Returns [`FtmsError::MalformedResponse`] for an empty payload or an unknown opcode.
pub fn decode_command(data: &[u8]) -> Result<ControlPointCommand> {
    let (&opcode, parameters) = data
        .split_first()
        .ok_or_else(|| FtmsError::MalformedResponse("empty control point command".to_string()))?;
    let opcode = OpCode::from_u8(opcode).ok_or_else(|| {
        FtmsError::MalformedResponse(format!("unknown control point opcode 0x{opcode:02X}"))
    })?;

    Ok(ControlPointCommand {
        opcode,
        parameters: parameters.to_vec(),
    })
}

/// A control point response indication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPointResponse {
    /// Opcode of the command this response answers
    pub request_opcode: u8,
    /// Result of the command
    pub result: ResultCode,
    /// Optional response parameters
    pub parameters: Vec<u8>,
}

impl ControlPointResponse {
    /// Create a response for `opcode`
    #[must_use]
    pub const fn new(opcode: OpCode, result: ResultCode) -> Self {
        Self {
            request_opcode: opcode as u8,
            result,
            parameters: Vec::new(),
        }
    }

    /// Check whether the response answers `opcode`
    #[must_use]
    pub const fn answers(&self, opcode: OpCode) -> bool {
        self.request_opcode == opcode as u8
    }

    /// Serialize response to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MIN_RESPONSE_LEN + self.parameters.len());
        buf.put_u8(RESPONSE_CODE);
        buf.put_u8(self.request_opcode);
        buf.put_u8(self.result.as_u8());
        buf.extend_from_slice(&self.parameters);
        buf.freeze()
    }
}

/// Decode a control point response indication
///
/// Layout:
/// - Byte 0: response code (0x80)
/// - Byte 1: originating opcode
/// - Byte 2: result code
/// - Bytes 3..: optional parameters
///
/// # Errors
///
/// Returns [`FtmsError::MalformedResponse`] if the payload is shorter than three
/// bytes or does not start with the response code.
pub fn decode_control_response(data: &[u8]) -> Result<ControlPointResponse> {
    if data.len() < MIN_RESPONSE_LEN {
        return Err(FtmsError::MalformedResponse(format!(
            "response too short: {} bytes, expected at least {MIN_RESPONSE_LEN}",
            data.len()
        )));
    }

    let mut buf = data;
    let response_code = buf.get_u8();
    if response_code != RESPONSE_CODE {
        return Err(FtmsError::MalformedResponse(format!(
            "unexpected response code 0x{response_code:02X}"
        )));
    }

    let request_opcode = buf.get_u8();
    let result = ResultCode::from_u8(buf.get_u8());

    Ok(ControlPointResponse {
        request_opcode,
        result,
        parameters: buf.to_vec(),
    })
}

/// Decode the Supported Power Range (0x2AD8) characteristic
///
/// Layout: minimum (s16), maximum (s16), increment (u16), all little-endian.
///
/// # Errors
///
/// Returns [`FtmsError::TruncatedPayload`] if fewer than six bytes are present.
pub fn decode_supported_power_range(data: &[u8]) -> Result<SupportedPowerRange> {
    if data.len() < 6 {
        return Err(FtmsError::TruncatedPayload {
            field: "supported power range",
            offset: 0,
            needed: 6,
            available: data.len(),
        });
    }

    let mut buf = data;
    Ok(SupportedPowerRange {
        min_watts: buf.get_i16_le(),
        max_watts: buf.get_i16_le(),
        increment_watts: buf.get_u16_le(),
    })
}

/// Encode the Supported Power Range characteristic value
#[must_use]
pub fn encode_supported_power_range(range: &SupportedPowerRange) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_i16_le(range.min_watts);
    buf.put_i16_le(range.max_watts);
    buf.put_u16_le(range.increment_watts);
    buf.freeze()
}

/// Clamp a requested target into the supported range and snap it to the
/// nearest increment above the minimum (ties round up)
#[must_use]
pub fn normalize_power_target(requested_watts: i32, range: &SupportedPowerRange) -> i32 {
    let min = i32::from(range.min_watts);
    let max = i32::from(range.max_watts).max(min);
    let increment = i32::from(range.increment_watts).max(1);

    let clamped = requested_watts.clamp(min, max);
    let steps = (2 * (clamped - min) + increment) / (2 * increment);
    (min + steps * increment).clamp(min, max)
}

/// Fitness Machine Status (0x2ADA) notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitnessMachineStatus {
    /// Trainer reset (0x01)
    Reset,
    /// Stopped or paused by the user (0x02)
    StoppedOrPaused,
    /// Started or resumed by the user (0x04)
    StartedOrResumed,
    /// Target power changed (0x08)
    TargetPowerChanged(i16),
    /// Control permission lost (0xFF)
    ControlPermissionLost,
    /// Any other status opcode
    Unknown(u8),
}

/// Decode a Fitness Machine Status notification
///
/// # Errors
///
/// Returns [`FtmsError::TruncatedPayload`] for an empty payload or a target
/// power change without its parameter.
pub fn decode_machine_status(data: &[u8]) -> Result<FitnessMachineStatus> {
    let mut buf = data;
    if !buf.has_remaining() {
        return Err(FtmsError::TruncatedPayload {
            field: "status opcode",
            offset: 0,
            needed: 1,
            available: 0,
        });
    }

    let status = match buf.get_u8() {
        0x01 => FitnessMachineStatus::Reset,
        0x02 => FitnessMachineStatus::StoppedOrPaused,
        0x04 => FitnessMachineStatus::StartedOrResumed,
        0x08 => {
            if buf.remaining() < 2 {
                return Err(FtmsError::TruncatedPayload {
                    field: "target power",
                    offset: 1,
                    needed: 2,
                    available: buf.remaining(),
                });
            }
            FitnessMachineStatus::TargetPowerChanged(buf.get_i16_le())
        }
        0xFF => FitnessMachineStatus::ControlPermissionLost,
        other => FitnessMachineStatus::Unknown(other),
    };

    Ok(status)
}

/// Encode a Fitness Machine Status notification
#[must_use]
pub fn encode_machine_status(status: FitnessMachineStatus) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    match status {
        FitnessMachineStatus::Reset => buf.put_u8(0x01),
        FitnessMachineStatus::StoppedOrPaused => buf.put_slice(&[0x02, 0x02]),
        FitnessMachineStatus::StartedOrResumed => buf.put_u8(0x04),
        FitnessMachineStatus::TargetPowerChanged(watts) => {
            buf.put_u8(0x08);
            buf.put_i16_le(watts);
        }
        FitnessMachineStatus::ControlPermissionLost => buf.put_u8(0xFF),
        FitnessMachineStatus::Unknown(code) => buf.put_u8(code),
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_power_only() {
        let sample = decode(&[0x40, 0x00, 0xB4, 0x00]).unwrap();

        assert_eq!(sample.power_watts, Some(180));
        assert_eq!(sample.cadence_rpm, None);
        assert_eq!(sample.speed_kmh, None);
        assert_eq!(sample.consumed, 4);
    }

    #[test]
    fn test_decode_cadence_half_rpm_units() {
        let sample = decode(&[0x04, 0x00, 0xB0, 0x00]).unwrap();
        assert_eq!(sample.cadence_rpm, Some(88.0));

        let sample = decode(&[0x04, 0x00, 0xAB, 0x00]).unwrap();
        assert_eq!(sample.cadence_rpm, Some(85.5));
    }

    #[test]
    fn test_decode_speed_cadence_power_cumulative_offsets() {
        // More Data clear: speed 30.00 km/h, cadence 88 rpm, power 182 W
        let payload = [0x44, 0x00, 0xB8, 0x0B, 0xB0, 0x00, 0xB6, 0x00];
        let sample = decode(&payload).unwrap();

        assert_eq!(sample.speed_kmh, Some(30.0));
        assert_eq!(sample.cadence_rpm, Some(88.0));
        assert_eq!(sample.power_watts, Some(182));
        assert_eq!(sample.consumed, 8);
    }

    #[test]
    fn test_decode_more_data_without_speed() {
        let sample = decode(&[0x45, 0x00, 0xB0, 0x00, 0xB6, 0x00]).unwrap();

        assert_eq!(sample.speed_kmh, None);
        assert_eq!(sample.cadence_rpm, Some(88.0));
        assert_eq!(sample.power_watts, Some(182));
        assert_eq!(sample.consumed, 6);
    }

    #[test]
    fn test_decode_inverted_more_data_bit() {
        // Speed sent although More Data is set; the standard alignment reads
        // cadence 1500 rpm
        let sample = decode(&[0x45, 0x00, 0xB8, 0x0B, 0xB0, 0x00, 0xB6, 0x00]).unwrap();

        assert_eq!(sample.speed_kmh, Some(30.0));
        assert_eq!(sample.cadence_rpm, Some(88.0));
        assert_eq!(sample.power_watts, Some(182));
        assert_eq!(sample.consumed, 8);
    }

    #[test]
    fn test_sample_plausibility() {
        assert!(IndoorBikeSample::new(Some(250), Some(90.0)).is_plausible());
        assert!(IndoorBikeSample::new(None, None).is_plausible());
        assert!(!IndoorBikeSample::new(Some(182), Some(1500.0)).is_plausible());
        assert!(!IndoorBikeSample::new(Some(-21026), None).is_plausible());

        let mut sample = IndoorBikeSample::new(None, None);
        sample.speed_kmh = Some(655.35);
        assert!(!sample.is_plausible());
    }

    #[test]
    fn test_decode_skips_unread_fields() {
        // average speed (2), total distance (3), resistance (2), power, expended energy (5), heart rate
        let payload = [
            0x73, 0x03, // flags: More Data | 0x0002 | 0x0010 | 0x0020 | 0x0040 | 0x0100 | 0x0200
            0x10, 0x27, // average speed
            0x01, 0x02, 0x03, // total distance
            0x0A, 0x00, // resistance
            0xF6, 0xFF, // power -10 W
            0x01, 0x00, 0x02, 0x00, 0x03, // expended energy
            0x8C, // heart rate 140
        ];
        let sample = decode(&payload).unwrap();

        assert_eq!(sample.power_watts, Some(-10));
        assert_eq!(sample.heart_rate_bpm, Some(140));
        assert_eq!(sample.speed_kmh, None);
        assert_eq!(sample.consumed, payload.len());
    }

    #[test]
    fn test_decode_ignores_reserved_bits_and_trailing_bytes() {
        let sample = decode(&[0x41, 0xE0, 0xB4, 0x00, 0xDE, 0xAD]).unwrap();

        assert_eq!(sample.power_watts, Some(180));
        assert_eq!(sample.consumed, 4);
    }

    #[test]
    fn test_decode_truncated_payload() {
        assert!(matches!(
            decode(&[0x40]),
            Err(FtmsError::TruncatedPayload { field: "flags", .. })
        ));

        let err = decode(&[0x45, 0x00, 0xB0, 0x00, 0xB4]).unwrap_err();
        match err {
            FtmsError::TruncatedPayload {
                field,
                offset,
                needed,
                available,
            } => {
                assert_eq!(field, "instantaneous power");
                assert_eq!(offset, 4);
                assert_eq!(needed, 2);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_empty_flags() {
        let sample = decode(&[0x00, 0x00]).unwrap();
        assert_eq!(sample.power_watts, None);
        assert_eq!(sample.consumed, 2);
    }

    #[test]
    fn test_set_target_power_round_trip() {
        let limits = PowerLimits::default();
        for watts in [0, 1, 100, 150, 255, 256, 1_000, 1_999, 2_000] {
            let bytes = encode_set_target_power(watts, &limits).unwrap();
            assert_eq!(bytes[0], 0x05);
            assert_eq!(bytes.len(), 3);

            let command = decode_command(&bytes).unwrap();
            assert_eq!(command.opcode, OpCode::SetTargetPower);
            assert_eq!(command.target_power(), Some(watts));
        }
    }

    #[test]
    fn test_set_target_power_out_of_range() {
        let limits = PowerLimits::default();
        assert!(matches!(
            encode_set_target_power(2_001, &limits),
            Err(FtmsError::OutOfRange { watts: 2_001, .. })
        ));
        assert!(matches!(
            encode_set_target_power(-5, &limits),
            Err(FtmsError::OutOfRange { watts: -5, .. })
        ));

        let wide = PowerLimits {
            min_watts: -100_000,
            max_watts: 100_000,
        };
        assert!(matches!(
            encode_set_target_power(40_000, &wide),
            Err(FtmsError::OutOfRange { watts: 40_000, .. })
        ));
    }

    #[test]
    fn test_command_serialization() {
        assert_eq!(&ControlPointCommand::request_control().to_bytes()[..], &[0x00]);
        assert_eq!(&ControlPointCommand::start_or_resume().to_bytes()[..], &[0x07]);
        assert_eq!(
            &ControlPointCommand::stop_or_pause(true).to_bytes()[..],
            &[0x08, 0x02]
        );
        assert!(decode_command(&[]).is_err());
        assert!(decode_command(&[0x42]).is_err());
    }

    #[test]
    fn test_decode_control_response() {
        let response = decode_control_response(&[0x80, 0x05, 0x01]).unwrap();
        assert!(response.answers(OpCode::SetTargetPower));
        assert!(response.result.is_success());
        assert!(response.parameters.is_empty());

        let response = decode_control_response(&[0x80, 0x00, 0x05, 0xAA]).unwrap();
        assert!(response.answers(OpCode::RequestControl));
        assert_eq!(response.result, ResultCode::ControlNotPermitted);
        assert_eq!(response.parameters, vec![0xAA]);

        let response = decode_control_response(&[0x80, 0x05, 0x09]).unwrap();
        assert_eq!(response.result, ResultCode::Unknown(0x09));
    }

    #[test]
    fn test_decode_control_response_malformed() {
        assert!(matches!(
            decode_control_response(&[0x80, 0x05]),
            Err(FtmsError::MalformedResponse(_))
        ));
        assert!(matches!(
            decode_control_response(&[0x05, 0x05, 0x01]),
            Err(FtmsError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_response_serialization() {
        let response = ControlPointResponse::new(OpCode::RequestControl, ResultCode::Success);
        assert_eq!(&response.to_bytes()[..], &[0x80, 0x00, 0x01]);
        assert_eq!(decode_control_response(&response.to_bytes()).unwrap(), response);
    }

    #[test]
    fn test_result_code_mapping() {
        assert!(ResultCode::Success.into_result(0x05).is_ok());
        assert!(matches!(
            ResultCode::InvalidParameter.into_result(0x05),
            Err(FtmsError::InvalidParameter { opcode: 0x05 })
        ));
        assert!(matches!(
            ResultCode::ControlNotPermitted.into_result(0x05),
            Err(FtmsError::ControlNotPermitted { opcode: 0x05 })
        ));
        assert!(matches!(
            ResultCode::from_u8(0x42).into_result(0x00),
            Err(FtmsError::UnexpectedResult {
                opcode: 0x00,
                code: 0x42
            })
        ));
    }

    #[test]
    fn test_supported_power_range() {
        let range = decode_supported_power_range(&[0x1E, 0x00, 0x90, 0x01, 0x05, 0x00]).unwrap();
        assert_eq!(range.min_watts, 30);
        assert_eq!(range.max_watts, 400);
        assert_eq!(range.increment_watts, 5);
        assert_eq!(
            decode_supported_power_range(&encode_supported_power_range(&range)).unwrap(),
            range
        );
        assert!(decode_supported_power_range(&[0x1E, 0x00]).is_err());
    }

    #[test]
    fn test_normalize_power_target() {
        let range = SupportedPowerRange {
            min_watts: 30,
            max_watts: 400,
            increment_watts: 5,
        };
        assert_eq!(normalize_power_target(20, &range), 30);
        assert_eq!(normalize_power_target(420, &range), 400);
        assert_eq!(normalize_power_target(33, &range), 35);
        assert_eq!(normalize_power_target(32, &range), 30);
        assert_eq!(normalize_power_target(200, &range), 200);

        let no_increment = SupportedPowerRange {
            increment_watts: 0,
            ..range
        };
        assert_eq!(normalize_power_target(33, &no_increment), 33);
    }

    #[test]
    fn test_machine_status() {
        assert_eq!(
            decode_machine_status(&[0x08, 0xC8, 0x00]).unwrap(),
            FitnessMachineStatus::TargetPowerChanged(200)
        );
        assert_eq!(
            decode_machine_status(&[0xFF]).unwrap(),
            FitnessMachineStatus::ControlPermissionLost
        );
        assert_eq!(
            decode_machine_status(&[0x12, 0x00]).unwrap(),
            FitnessMachineStatus::Unknown(0x12)
        );
        assert!(decode_machine_status(&[]).is_err());
        assert!(decode_machine_status(&[0x08, 0xC8]).is_err());

        let status = FitnessMachineStatus::TargetPowerChanged(-3);
        assert_eq!(decode_machine_status(&encode_machine_status(status)).unwrap(), status);
    }

    #[test]
    fn test_encode_indoor_bike_data() {
        let mut sample = IndoorBikeSample::new(Some(182), Some(88.0));
        sample.speed_kmh = Some(30.0);
        let bytes = encode_indoor_bike_data(&sample);
        assert_eq!(&bytes[..], &[0x44, 0x00, 0xB8, 0x0B, 0xB0, 0x00, 0xB6, 0x00]);

        let bytes = encode_indoor_bike_data(&IndoorBikeSample::new(Some(180), None));
        assert_eq!(&bytes[..], &[0x41, 0x00, 0xB4, 0x00]);
    }
}
