//! Protocol constants and wire formats for the Kinect tilt motor.
//!
//! The motor lives behind the default control endpoint of its own USB
//! device (`045e:02b0`). Everything is vendor-type control traffic with an
//! 8-byte data stage:
//!
//! - status read: `bmRequestType=0xC0 bRequest=0x10 wValue=0 wIndex=0 wLength=8`,
//!   the first byte of the reply must be [`INIT_STATUS_SENTINEL`]
//! - tilt write: `bmRequestType=0x40 bRequest=0x31 wValue=<command> wIndex=0 wLength=8`
//!
//! Limit-switch feedback, when the unit exposes an interrupt endpoint,
//! arrives as a two-byte [`LimitReport`].

use std::fmt;

use crate::error::{MotorError, Result};

// ── USB identifiers ──

/// Microsoft vendor ID.
pub const KINECT_MOTOR_VID: u16 = 0x045e;

/// Product ID of the motor/accelerometer function.
pub const KINECT_MOTOR_PID: u16 = 0x02b0;

// ── Control transfer parameters ──

/// `bmRequestType` for device-to-host vendor requests.
pub const REQUEST_TYPE_VENDOR_IN: u8 = 0xC0;

/// `bmRequestType` for host-to-device vendor requests.
pub const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// `bRequest` for the init-time status read.
pub const REQUEST_STATUS: u8 = 0x10;

/// `bRequest` for a tilt command (also used to home the motor).
pub const REQUEST_SET_TILT: u8 = 0x31;

/// Data stage length for every motor control transfer.
pub const CTRL_BUFFER_SIZE: usize = 8;

/// First byte of a healthy status reply.
pub const INIT_STATUS_SENTINEL: u8 = 0x22;

/// Default timeout for the synchronous init transfers, in milliseconds.
pub const INIT_TIMEOUT_MS: u64 = 1000;

// ── Device node numbering ──

/// First minor number handed out to attached units.
pub const MINOR_BASE: u32 = 96;

/// Number of minors reserved for this driver.
pub const MINOR_COUNT: u32 = 16;

/// Device node name for a given minor (`kinect-motor0` for the first unit).
pub fn node_name(minor: u32) -> String {
    format!("kinect-motor{}", minor.saturating_sub(MINOR_BASE))
}

// ── Setup packet ──

/// An 8-byte USB setup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    /// The init-time status read.
    pub fn status_read() -> Self {
        ControlSetup {
            request_type: REQUEST_TYPE_VENDOR_IN,
            request: REQUEST_STATUS,
            value: 0,
            index: 0,
            length: CTRL_BUFFER_SIZE as u16,
        }
    }

    /// A tilt write carrying `command` in `wValue`.
    ///
    /// The signed command is sign-extended into the 16-bit field, so `-45`
    /// goes out as `0xFFD3`.
    pub fn set_tilt(command: TiltCommand) -> Self {
        ControlSetup {
            request_type: REQUEST_TYPE_VENDOR_OUT,
            request: REQUEST_SET_TILT,
            value: command.wire_value(),
            index: 0,
            length: CTRL_BUFFER_SIZE as u16,
        }
    }

    /// Whether the data stage flows device-to-host.
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    /// Serialize as the little-endian setup packet seen on the wire.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut pkt = [0u8; 8];
        pkt[0] = self.request_type;
        pkt[1] = self.request;
        pkt[2..4].copy_from_slice(&self.value.to_le_bytes());
        pkt[4..6].copy_from_slice(&self.index.to_le_bytes());
        pkt[6..8].copy_from_slice(&self.length.to_le_bytes());
        pkt
    }
}

// ── Tilt command ──

/// A validated tilt delta. Sign is direction (positive tilts up), magnitude
/// is degree; the device enforces its own travel limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TiltCommand(i8);

impl TiltCommand {
    /// Hold position.
    pub const STOP: TiltCommand = TiltCommand(0);

    /// Validate a raw command value. Anything outside `-128..=127` is
    /// rejected, including `128`.
    pub fn new(value: i32) -> Result<Self> {
        i8::try_from(value)
            .map(TiltCommand)
            .map_err(|_| MotorError::InvalidCommand(value))
    }

    /// Decode the single byte written to the device node.
    pub fn from_byte(byte: u8) -> Self {
        TiltCommand(byte as i8)
    }

    pub fn value(self) -> i8 {
        self.0
    }

    /// The `wValue` field for this command.
    pub fn wire_value(self) -> u16 {
        i16::from(self.0) as u16
    }

    /// Inverse of [`wire_value`](Self::wire_value). Only the low byte is
    /// significant.
    pub fn from_wire_value(value: u16) -> Self {
        TiltCommand(value as u8 as i8)
    }

    pub fn direction(self) -> Option<Direction> {
        match self.0 {
            0 => None,
            v if v > 0 => Some(Direction::Up),
            _ => Some(Direction::Down),
        }
    }
}

impl From<i8> for TiltCommand {
    fn from(value: i8) -> Self {
        TiltCommand(value)
    }
}

impl fmt::Display for TiltCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+}", self.0)
    }
}

/// Direction of travel requested by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

// ── Limit feedback ──

/// Bit for the tilt axis within each [`LimitReport`] byte.
pub const AXIS_TILT: u8 = 0x01;

/// Size of a limit-status report from the interrupt endpoint.
pub const LIMIT_REPORT_SIZE: usize = 2;

/// Limit-switch status: one byte of "reached upper limit" bits and one of
/// "reached lower limit" bits, one bit per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimitReport {
    pub upper: u8,
    pub lower: u8,
}

impl LimitReport {
    /// Parse a report. Returns `None` if fewer than two bytes arrived.
    pub fn parse(data: &[u8]) -> Option<Self> {
        match data {
            [upper, lower, ..] => Some(LimitReport {
                upper: *upper,
                lower: *lower,
            }),
            _ => None,
        }
    }

    /// Whether `axis` sits at its limit in `direction`.
    pub fn at_limit(&self, axis: u8, direction: Direction) -> bool {
        let bits = match direction {
            Direction::Up => self.upper,
            Direction::Down => self.lower,
        };
        bits & axis != 0
    }
}

/// Adjust `command` against a limit report.
///
/// Returns the corrected command when the command asks the tilt axis to keep
/// moving toward a limit it has already reached; the offending direction is
/// dropped, which leaves the motor holding position. Returns `None` when no
/// correction is needed.
pub fn correct_for_limits(command: TiltCommand, report: &LimitReport) -> Option<TiltCommand> {
    let direction = command.direction()?;
    if report.at_limit(AXIS_TILT, direction) {
        Some(TiltCommand::STOP)
    } else {
        None
    }
}

// ── Sensor record ──

/// Size of the sensor record handed to readers.
pub const SENSOR_RECORD_SIZE: usize = 8;

/// Motor state reported alongside sensor readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorStatus {
    Stopped,
    ReachedLimits,
    Moving,
    Unknown(u8),
}

impl From<u8> for MotorStatus {
    fn from(code: u8) -> Self {
        match code {
            0x0 => MotorStatus::Stopped,
            0x1 => MotorStatus::ReachedLimits,
            0x4 => MotorStatus::Moving,
            other => MotorStatus::Unknown(other),
        }
    }
}

impl fmt::Display for MotorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotorStatus::Stopped => write!(f, "stopped"),
            MotorStatus::ReachedLimits => write!(f, "reached limits"),
            MotorStatus::Moving => write!(f, "moving"),
            MotorStatus::Unknown(code) => write!(f, "unknown (0x{code:02x})"),
        }
    }
}

/// Accelerometer and angle record: three big-endian axes, then one
/// positive-angle byte and one status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorRecord {
    pub ux: u16,
    pub uy: u16,
    pub uz: u16,
    pub positive_angle_degrees: u8,
    pub status: MotorStatus,
}

impl SensorRecord {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < SENSOR_RECORD_SIZE {
            return None;
        }
        Some(SensorRecord {
            ux: u16::from_be_bytes([data[0], data[1]]),
            uy: u16::from_be_bytes([data[2], data[3]]),
            uz: u16::from_be_bytes([data[4], data[5]]),
            positive_angle_degrees: data[6],
            status: MotorStatus::from(data[7]),
        })
    }
}
