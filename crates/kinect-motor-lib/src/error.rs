//! Unified error type for the kinect-motor-lib crate.
//!
//! [`MotorError`] covers the caller-facing taxonomy (lookup, reference
//! counting, lock interruption, detach, command validation, transfer
//! submission, attach-time failures) and wraps [`TransportError`] so `?`
//! propagates transport failures with their source attached.

use std::fmt;

use crate::transport::TransportError;

const ENODEV: i32 = 19;
const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const EPROTO: i32 = 71;
const ERESTARTSYS: i32 = 512;

/// Errors returned by the motor driver core.
#[derive(Debug)]
pub enum MotorError {
    /// No instance registered under the requested minor.
    NotFound(u32),
    /// The instance only allows one open handle and already has one.
    AlreadyOpen,
    /// The transport handle already backs the instance at this minor.
    AlreadyAttached(u32),
    /// `release` on an instance whose open count is already zero.
    NotOpen,
    /// Waiting for the instance lock was aborted by a signal.
    Interrupted,
    /// The device was unplugged; the transport handle is gone.
    NotAttached,
    /// Command outside `-128..=127`. Nothing was transmitted.
    InvalidCommand(i32),
    /// The transport refused an asynchronous submission.
    TransferSubmit(TransportError),
    /// Opening or enumerating the bus failed outside any transfer.
    Transport(TransportError),
    /// An attach-time transfer failed (`step` names which one).
    Init {
        step: &'static str,
        source: TransportError,
    },
    /// The status handshake returned something other than the sentinel.
    UnexpectedDeviceResponse(Vec<u8>),
    /// Resources for a new instance could not be obtained.
    AllocationFailure(String),
    /// The config file could not be located or would be clobbered.
    Config(String),
    /// Standard I/O error (config persistence).
    Io(std::io::Error),
}

impl MotorError {
    /// Negative errno for the device-node contract ("count or negative error").
    pub fn errno(&self) -> i32 {
        let code = match self {
            MotorError::NotFound(_) | MotorError::NotOpen | MotorError::NotAttached => ENODEV,
            MotorError::AlreadyOpen | MotorError::AlreadyAttached(_) => EBUSY,
            MotorError::Interrupted => ERESTARTSYS,
            MotorError::InvalidCommand(_) | MotorError::Config(_) => EINVAL,
            MotorError::TransferSubmit(e) | MotorError::Transport(e) => match e {
                TransportError::Disconnected | TransportError::NotFound => ENODEV,
                _ => EIO,
            },
            MotorError::Init { .. } => EIO,
            MotorError::UnexpectedDeviceResponse(_) => EPROTO,
            MotorError::AllocationFailure(_) => ENOMEM,
            MotorError::Io(e) => e.raw_os_error().unwrap_or(EIO),
        };
        -code
    }

    /// Whether this error aborted an attach attempt.
    pub fn is_init_failure(&self) -> bool {
        matches!(
            self,
            MotorError::Init { .. }
                | MotorError::UnexpectedDeviceResponse(_)
                | MotorError::AllocationFailure(_)
        )
    }
}

impl fmt::Display for MotorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotorError::NotFound(minor) => write!(f, "No device registered for minor {minor}"),
            MotorError::AlreadyOpen => write!(f, "Device is already open"),
            MotorError::AlreadyAttached(minor) => {
                write!(f, "Device is already attached as minor {minor}")
            }
            MotorError::NotOpen => write!(f, "Device is not open"),
            MotorError::Interrupted => write!(f, "Interrupted while waiting for the device lock"),
            MotorError::NotAttached => write!(f, "Device unplugged"),
            MotorError::InvalidCommand(v) => {
                write!(f, "Invalid tilt command {v} (expected -128..=127)")
            }
            MotorError::TransferSubmit(e) => write!(f, "Transfer submission failed: {e}"),
            MotorError::Transport(e) => write!(f, "USB error: {e}"),
            MotorError::Init { step, source } => write!(f, "Device init failed: {step}: {source}"),
            MotorError::UnexpectedDeviceResponse(raw) => {
                write!(f, "Unexpected device response: {raw:02x?}")
            }
            MotorError::AllocationFailure(e) => write!(f, "Allocation failure: {e}"),
            MotorError::Config(e) => write!(f, "Config error: {e}"),
            MotorError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for MotorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MotorError::TransferSubmit(e) | MotorError::Transport(e) => Some(e),
            MotorError::Init { source, .. } => Some(source),
            MotorError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MotorError {
    fn from(e: std::io::Error) -> Self {
        MotorError::Io(e)
    }
}

impl From<TransportError> for MotorError {
    fn from(e: TransportError) -> Self {
        MotorError::Transport(e)
    }
}

/// Crate-level Result alias using [`MotorError`].
pub type Result<T> = std::result::Result<T, MotorError>;
