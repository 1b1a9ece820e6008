//! Control channel: init handshake and tilt command submission.

use std::time::Duration;

use crate::error::{MotorError, Result};
use crate::protocol::{CTRL_BUFFER_SIZE, ControlSetup, INIT_STATUS_SENTINEL, TiltCommand};
use crate::sync::SpinLock;
use crate::transport::{Completion, CompletionSink, UsbTransport};

/// The command state shared between callers and the completion worker.
/// Always accessed under its [`SpinLock`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandSlot {
    /// Last command sent (or the corrected version of it).
    pub command: TiltCommand,
    /// Feedback adjusted `command` and the adjustment is not on the wire yet.
    pub correction_required: bool,
    /// A corrective write is in flight.
    pub correcting: bool,
}

/// Run the attach-time handshake: read the status block, check the
/// sentinel, then home the motor.
///
/// On success `buffer` holds the status reply.
pub fn initialize<T: UsbTransport + ?Sized>(
    transport: &T,
    timeout: Duration,
    buffer: &mut [u8; CTRL_BUFFER_SIZE],
) -> Result<()> {
    let reply = transport
        .control_in(&ControlSetup::status_read(), timeout)
        .map_err(|source| MotorError::Init {
            step: "status read",
            source,
        })?;
    log::debug!("status read returned {} bytes: {reply:02x?}", reply.len());

    if reply.len() != CTRL_BUFFER_SIZE || reply[0] != INIT_STATUS_SENTINEL {
        log::error!("did not receive the correct response from the motor");
        return Err(MotorError::UnexpectedDeviceResponse(reply));
    }
    buffer.copy_from_slice(&reply);

    log::debug!("moving motor to zero position");
    let home = ControlSetup::set_tilt(TiltCommand::STOP);
    transport
        .control_out(&home, &[0u8; CTRL_BUFFER_SIZE], timeout)
        .map_err(|source| MotorError::Init {
            step: "home motor",
            source,
        })?;
    Ok(())
}

/// Record `command` as outstanding and queue the tilt write. If the
/// submission is refused the previous command is put back.
///
/// The spinlock is released before the transport is touched.
pub fn submit_command<T: UsbTransport + ?Sized>(
    transport: &T,
    slot: &SpinLock<CommandSlot>,
    command: TiltCommand,
    buffer: &mut [u8; CTRL_BUFFER_SIZE],
    sink: CompletionSink,
) -> Result<()> {
    let previous = {
        let mut slot = slot.lock();
        let previous = (slot.command, slot.correction_required);
        slot.command = command;
        slot.correction_required = false;
        previous
    };

    *buffer = [0u8; CTRL_BUFFER_SIZE];
    let setup = ControlSetup::set_tilt(command);
    log::trace!("set_tilt setup {:02x?}", setup.to_bytes());
    transport.submit_control(setup, *buffer, sink).map_err(|e| {
        log::error!("tilt submission failed ({e})");
        let mut slot = slot.lock();
        // Leave a command issued meanwhile by the feedback loop alone.
        if slot.command == command {
            (slot.command, slot.correction_required) = previous;
        }
        MotorError::TransferSubmit(e)
    })
}

/// Completion-context handler for tilt writes.
pub(crate) fn on_complete(slot: &SpinLock<CommandSlot>, completion: &Completion) {
    slot.lock().correcting = false;
    match &completion.status {
        Ok(()) => log::trace!("tilt write completed"),
        Err(e) if e.is_device_gone() => log::debug!("tilt write ended: {e}"),
        Err(e) => log::warn!("tilt write failed: {e}"),
    }
}
