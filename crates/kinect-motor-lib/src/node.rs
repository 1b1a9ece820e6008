//! Device-handle adapter: the byte-oriented node applications talk to.

use std::sync::Arc;

use crate::driver::MotorDriver;
use crate::error::Result;
use crate::instance::MotorInstance;
use crate::protocol::TiltCommand;
use crate::sync::Signal;
use crate::transport::UsbTransport;

/// An open handle on one motor. Dropping it releases the handle.
pub struct MotorNode<T: UsbTransport> {
    instance: Option<Arc<MotorInstance<T>>>,
    signal: Signal,
}

impl<T: UsbTransport> MotorNode<T> {
    pub fn open(driver: &MotorDriver<T>, minor: u32) -> Result<Self> {
        Self::open_with_signal(driver, minor, Signal::new())
    }

    /// Open with a caller-supplied interruption token. Raising `signal`
    /// aborts any lock wait inside this node's calls.
    pub fn open_with_signal(driver: &MotorDriver<T>, minor: u32, signal: Signal) -> Result<Self> {
        let instance = driver.open(minor, &signal)?;
        Ok(MotorNode {
            instance: Some(instance),
            signal,
        })
    }

    pub fn instance(&self) -> Option<&Arc<MotorInstance<T>>> {
        self.instance.as_ref()
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Write a command byte. Only the first byte of `buf` is used; returns
    /// the number of bytes consumed (0 for an empty buffer, else 1).
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let Some(&byte) = buf.first() else {
            return Ok(0);
        };
        if buf.len() > 1 {
            log::debug!("truncating {}-byte write to 1 byte", buf.len());
        }
        self.submit(TiltCommand::from_byte(byte))?;
        Ok(1)
    }

    /// Write a command given as a wide integer. Values outside `-128..=127`
    /// fail with `InvalidCommand` and nothing is sent.
    pub fn write_raw(&self, value: i32) -> Result<usize> {
        let command = TiltCommand::new(value)?;
        self.submit(command)?;
        Ok(1)
    }

    /// `write` with the node contract's return convention: bytes consumed
    /// or a negative errno.
    pub fn write_errno(&self, buf: &[u8]) -> isize {
        match self.write(buf) {
            Ok(n) => n as isize,
            Err(e) => e.errno() as isize,
        }
    }

    pub fn release(mut self) -> Result<()> {
        match self.instance.take() {
            Some(instance) => instance.release(&self.signal),
            None => Ok(()),
        }
    }

    fn submit(&self, command: TiltCommand) -> Result<()> {
        match &self.instance {
            Some(instance) => instance.submit(command, &self.signal),
            None => Err(crate::error::MotorError::NotOpen),
        }
    }
}

impl<T: UsbTransport> Drop for MotorNode<T> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            if let Err(e) = instance.release(&Signal::new()) {
                log::warn!("{}: release on drop failed: {e}", instance.name());
            }
        }
    }
}
