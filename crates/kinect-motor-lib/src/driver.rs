//! Device lifecycle manager: attach, detach, open, release.
//!
//! Instances live in a fixed arena indexed by `minor - MINOR_BASE`. The
//! process-wide disconnect lock serializes `open` against `detach`, so an
//! open never grabs an instance that detach is halfway through removing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::error::{MotorError, Result};
use crate::instance::MotorInstance;
use crate::protocol::{INIT_TIMEOUT_MS, MINOR_BASE, MINOR_COUNT, node_name};
use crate::sync::{Signal, lock};
use crate::transport::UsbTransport;

/// Driver-wide behavior switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOptions {
    /// Arm limit feedback on units that expose a limit endpoint.
    pub feedback: bool,
    /// Refuse a second concurrent open of the same instance.
    pub exclusive_open: bool,
    /// Timeout for each attach-time control transfer.
    pub init_timeout: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        DriverOptions {
            feedback: true,
            exclusive_open: false,
            init_timeout: Duration::from_millis(INIT_TIMEOUT_MS),
        }
    }
}

impl From<&Config> for DriverOptions {
    fn from(config: &Config) -> Self {
        DriverOptions {
            feedback: config.feedback,
            exclusive_open: config.exclusive_open,
            init_timeout: Duration::from_millis(config.init_timeout_ms),
        }
    }
}

enum Slot<T: UsbTransport> {
    Free,
    /// Minor handed out to an attach that is still running its handshake.
    Reserved(Arc<T>),
    Live(Arc<MotorInstance<T>>),
}

struct Registry<T: UsbTransport> {
    slots: Vec<Slot<T>>,
}

impl<T: UsbTransport> Registry<T> {
    fn new() -> Self {
        Registry {
            slots: (0..MINOR_COUNT).map(|_| Slot::Free).collect(),
        }
    }

    fn index(minor: u32) -> Option<usize> {
        minor
            .checked_sub(MINOR_BASE)
            .filter(|i| *i < MINOR_COUNT)
            .map(|i| i as usize)
    }

    /// Minor already bound to `transport`, whether live or mid-attach.
    fn bound_to(&self, transport: &Arc<T>) -> Option<u32> {
        let idx = self.slots.iter().position(|s| match s {
            Slot::Free => false,
            Slot::Reserved(t) => Arc::ptr_eq(t, transport),
            Slot::Live(instance) => instance.is_bound_to(transport),
        })?;
        Some(MINOR_BASE + idx as u32)
    }

    fn reserve(&mut self, transport: &Arc<T>) -> Option<u32> {
        let idx = self.slots.iter().position(|s| matches!(s, Slot::Free))?;
        self.slots[idx] = Slot::Reserved(Arc::clone(transport));
        Some(MINOR_BASE + idx as u32)
    }

    fn publish(&mut self, minor: u32, instance: Arc<MotorInstance<T>>) {
        if let Some(idx) = Self::index(minor) {
            self.slots[idx] = Slot::Live(instance);
        }
    }

    fn free(&mut self, minor: u32) {
        if let Some(idx) = Self::index(minor) {
            self.slots[idx] = Slot::Free;
        }
    }

    fn get(&self, minor: u32) -> Option<Arc<MotorInstance<T>>> {
        match &self.slots[Self::index(minor)?] {
            Slot::Live(instance) => Some(Arc::clone(instance)),
            _ => None,
        }
    }

    fn remove(&mut self, minor: u32) -> Option<Arc<MotorInstance<T>>> {
        let idx = Self::index(minor)?;
        match std::mem::replace(&mut self.slots[idx], Slot::Free) {
            Slot::Live(instance) => Some(instance),
            other => {
                self.slots[idx] = other;
                None
            }
        }
    }

    fn live(&self) -> Vec<Arc<MotorInstance<T>>> {
        self.slots
            .iter()
            .filter_map(|s| match s {
                Slot::Live(instance) => Some(Arc::clone(instance)),
                _ => None,
            })
            .collect()
    }
}

/// The driver: owns every attached instance.
pub struct MotorDriver<T: UsbTransport> {
    options: DriverOptions,
    disconnect_lock: Mutex<()>,
    registry: Mutex<Registry<T>>,
}

impl<T: UsbTransport> MotorDriver<T> {
    pub fn new(options: DriverOptions) -> Self {
        MotorDriver {
            options,
            disconnect_lock: Mutex::new(()),
            registry: Mutex::new(Registry::new()),
        }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Bring up a newly plugged unit. Returns its minor.
    ///
    /// Nothing is registered unless the handshake succeeds. Failing to arm
    /// limit feedback is logged but does not fail the attach.
    pub fn attach(&self, transport: Arc<T>) -> Result<u32> {
        let location = transport.describe();
        log::trace!("attach {location}");

        let minor = {
            let mut registry = lock(&self.registry);
            if let Some(minor) = registry.bound_to(&transport) {
                log::error!("{location} is already attached as {}", node_name(minor));
                return Err(MotorError::AlreadyAttached(minor));
            }
            registry.reserve(&transport).ok_or_else(|| {
                log::error!("not able to get a minor for {location}");
                MotorError::AllocationFailure(format!("all {MINOR_COUNT} minors in use"))
            })?
        };

        let instance = match MotorInstance::create(
            minor,
            transport,
            self.options.feedback,
            self.options.init_timeout,
        ) {
            Ok(instance) => instance,
            Err(e) => {
                lock(&self.registry).free(minor);
                log::error!("attach of {location} failed: {e}");
                return Err(e);
            }
        };

        lock(&self.registry).publish(minor, Arc::clone(&instance));
        if let Err(e) = instance.arm_feedback() {
            log::warn!("{}: limit feedback unavailable: {e}", node_name(minor));
        }
        log::info!("kinect motor now attached to {} ({location})", node_name(minor));
        Ok(minor)
    }

    /// Handle removal of the unit at `minor`. Never fails; returns `false`
    /// if nothing was attached there.
    pub fn detach(&self, minor: u32) -> bool {
        let _guard = lock(&self.disconnect_lock);
        let Some(instance) = lock(&self.registry).remove(minor) else {
            log::warn!("detach of unknown minor {minor}");
            return false;
        };
        instance.detach();
        log::info!("{} now disconnected", node_name(minor));
        true
    }

    /// Open a handle on the unit at `minor`.
    ///
    /// The returned `Arc` keeps the instance alive across a detach; pass it
    /// back to [`release`](Self::release) when done.
    pub fn open(&self, minor: u32, signal: &Signal) -> Result<Arc<MotorInstance<T>>> {
        let _guard = lock(&self.disconnect_lock);
        let instance = lock(&self.registry).get(minor).ok_or_else(|| {
            log::error!("can't find device for minor {minor}");
            MotorError::NotFound(minor)
        })?;
        instance.open(signal, self.options.exclusive_open)?;
        Ok(instance)
    }

    /// Drop a handle obtained from [`open`](Self::open).
    pub fn release(&self, instance: &MotorInstance<T>, signal: &Signal) -> Result<()> {
        instance.release(signal)
    }

    /// Currently registered instances, in minor order.
    pub fn instances(&self) -> Vec<Arc<MotorInstance<T>>> {
        lock(&self.registry).live()
    }

    /// Detach everything. Used on shutdown.
    pub fn detach_all(&self) {
        let minors: Vec<u32> = self.instances().iter().map(|i| i.minor()).collect();
        for minor in minors {
            self.detach(minor);
        }
    }
}

impl<T: UsbTransport> Default for MotorDriver<T> {
    fn default() -> Self {
        Self::new(DriverOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn options() -> DriverOptions {
        DriverOptions {
            init_timeout: Duration::from_millis(50),
            ..DriverOptions::default()
        }
    }

    #[test]
    fn first_attach_gets_minor_base() {
        let driver = MotorDriver::new(options());
        let minor = driver.attach(Arc::new(MockTransport::new())).unwrap();
        assert_eq!(minor, MINOR_BASE);
        let second = driver.attach(Arc::new(MockTransport::new())).unwrap();
        assert_eq!(second, MINOR_BASE + 1);
    }

    #[test]
    fn failed_attach_frees_minor() {
        let driver = MotorDriver::new(options());
        let bad = MockTransport::new();
        bad.set_status_reply(vec![0x33, 0, 0, 0, 0, 0, 0, 0]);
        assert!(driver.attach(Arc::new(bad)).is_err());
        assert!(driver.instances().is_empty());
        assert_eq!(driver.attach(Arc::new(MockTransport::new())).unwrap(), MINOR_BASE);
    }

    #[test]
    fn same_transport_attaches_once() {
        let driver = MotorDriver::new(options());
        let mock = Arc::new(MockTransport::new());
        let minor = driver.attach(Arc::clone(&mock)).unwrap();

        let err = driver.attach(Arc::clone(&mock)).unwrap_err();
        assert!(matches!(err, MotorError::AlreadyAttached(m) if m == minor));
        assert_eq!(err.errno(), -16);
        assert_eq!(driver.instances().len(), 1);
        assert_eq!(mock.sync_in.lock().unwrap().len(), 1, "no second handshake");

        // Once detached, the same handle may come back.
        driver.detach(minor);
        assert_eq!(driver.attach(mock).unwrap(), MINOR_BASE);
    }

    #[test]
    fn minors_exhausted() {
        let driver = MotorDriver::new(options());
        for _ in 0..MINOR_COUNT {
            driver.attach(Arc::new(MockTransport::new())).unwrap();
        }
        let err = driver.attach(Arc::new(MockTransport::new())).unwrap_err();
        assert!(matches!(err, MotorError::AllocationFailure(_)));
    }

    #[test]
    fn open_unknown_minor() {
        let driver: MotorDriver<MockTransport> = MotorDriver::new(options());
        assert!(matches!(
            driver.open(MINOR_BASE, &Signal::new()),
            Err(MotorError::NotFound(m)) if m == MINOR_BASE
        ));
        assert!(matches!(
            driver.open(3, &Signal::new()),
            Err(MotorError::NotFound(3))
        ));
    }

    #[test]
    fn exclusive_open_refuses_second_handle() {
        let driver = MotorDriver::new(DriverOptions {
            exclusive_open: true,
            ..options()
        });
        let minor = driver.attach(Arc::new(MockTransport::new())).unwrap();
        let first = driver.open(minor, &Signal::new()).unwrap();
        assert!(matches!(
            driver.open(minor, &Signal::new()),
            Err(MotorError::AlreadyOpen)
        ));
        driver.release(&first, &Signal::new()).unwrap();
        assert!(driver.open(minor, &Signal::new()).is_ok());
    }

    #[test]
    fn detach_unknown_is_harmless() {
        let driver: MotorDriver<MockTransport> = MotorDriver::new(options());
        assert!(!driver.detach(MINOR_BASE));
    }

    #[test]
    fn options_from_config() {
        let config = Config {
            feedback: false,
            exclusive_open: true,
            init_timeout_ms: 250,
            ..Config::default()
        };
        let opts = DriverOptions::from(&config);
        assert!(!opts.feedback);
        assert!(opts.exclusive_open);
        assert_eq!(opts.init_timeout, Duration::from_millis(250));
    }

    #[test]
    fn detach_all_empties_registry() {
        let driver = MotorDriver::new(options());
        driver.attach(Arc::new(MockTransport::new())).unwrap();
        driver.attach(Arc::new(MockTransport::new())).unwrap();
        driver.detach_all();
        assert!(driver.instances().is_empty());
    }
}
