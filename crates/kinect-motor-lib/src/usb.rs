//! Real USB backend (Linux, `nusb`).
//!
//! Blocking transfers go straight to `nusb`'s `*_blocking` calls. Each
//! asynchronous submission runs its transfer future on a short-lived thread
//! racing a cancel channel; `cancel` closes the channel and joins the thread,
//! so once it returns nothing of that kind is in flight.

use std::sync::Arc;

use crate::hotplug::{DeviceInfo, DeviceSource};
use crate::transport::{TransportError, UsbTransport};

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use std::sync::Mutex;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use futures_lite::future;
    use nusb::transfer::{
        Control, ControlOut, ControlType, Direction, EndpointType, Recipient, RequestBuffer,
        TransferError,
    };

    use crate::hotplug::DeviceAddress;
    use crate::protocol::{CTRL_BUFFER_SIZE, ControlSetup, KINECT_MOTOR_PID, KINECT_MOTOR_VID};
    use crate::sync::lock;
    use crate::transport::{Completion, CompletionSink, Result, TransferKind};

    /// The motor function exposes a single interface.
    const MOTOR_INTERFACE: u8 = 0;

    struct InFlight {
        cancel: async_channel::Sender<()>,
        handle: JoinHandle<()>,
    }

    pub struct NusbTransport {
        interface: nusb::Interface,
        location: String,
        limit_endpoint: Option<u8>,
        control: Mutex<Vec<InFlight>>,
        interrupt: Mutex<Vec<InFlight>>,
    }

    // nusb::Interface is a handle to a reference-counted platform object;
    // the in-flight lists are behind mutexes.
    unsafe impl Send for NusbTransport {}
    unsafe impl Sync for NusbTransport {}

    fn map_transfer_error(context: &str, e: TransferError) -> TransportError {
        match e {
            TransferError::Cancelled => TransportError::Cancelled,
            TransferError::Stall => TransportError::Stall,
            TransferError::Disconnected => TransportError::Disconnected,
            other => TransportError::Io(format!("{context}: {other}")),
        }
    }

    /// A blocking transfer only reports `Cancelled` when its timeout fired.
    fn map_blocking_error(context: &str, e: TransferError) -> TransportError {
        match e {
            TransferError::Cancelled => TransportError::TimedOut,
            other => map_transfer_error(context, other),
        }
    }

    fn control(setup: &ControlSetup) -> Control {
        Control {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: setup.request,
            value: setup.value,
            index: setup.index,
        }
    }

    /// First interrupt-IN endpoint on the motor interface, if any.
    fn find_limit_endpoint(device: &nusb::Device) -> Option<u8> {
        let config = device.active_configuration().ok()?;
        for alt in config.interface_alt_settings() {
            if alt.interface_number() != MOTOR_INTERFACE {
                continue;
            }
            for ep in alt.endpoints() {
                if ep.transfer_type() == EndpointType::Interrupt && ep.direction() == Direction::In {
                    return Some(ep.address());
                }
            }
        }
        None
    }

    impl NusbTransport {
        fn open(info: &nusb::DeviceInfo) -> Result<Self> {
            let location = format!(
                "usb:{:03}/{:03}",
                info.bus_number(),
                info.device_address()
            );
            let device = info
                .open()
                .map_err(|e| TransportError::Io(format!("USB open {location}: {e}")))?;

            let limit_endpoint = find_limit_endpoint(&device);

            let interface = device.claim_interface(MOTOR_INTERFACE).map_err(|e| {
                TransportError::Io(format!("claim interface {MOTOR_INTERFACE}: {e}"))
            })?;
            log::debug!("opened {location} (limit endpoint: {limit_endpoint:02x?})");

            Ok(NusbTransport {
                interface,
                location,
                limit_endpoint,
                control: Mutex::new(Vec::new()),
                interrupt: Mutex::new(Vec::new()),
            })
        }

        fn in_flight(&self, kind: TransferKind) -> &Mutex<Vec<InFlight>> {
            match kind {
                TransferKind::Control => &self.control,
                TransferKind::Interrupt => &self.interrupt,
            }
        }

        /// Run `transfer` on its own thread, racing it against a cancel
        /// channel. The completion is always delivered to `sink`.
        fn spawn<F>(&self, kind: TransferKind, sink: CompletionSink, transfer: F) -> Result<()>
        where
            F: FnOnce(nusb::Interface) -> future::Boxed<Completion> + Send + 'static,
        {
            let (cancel_tx, cancel_rx) = async_channel::bounded::<()>(1);
            let interface = self.interface.clone();
            let handle = thread::Builder::new()
                .name(format!("kinect-motor-{kind:?}").to_lowercase())
                .spawn(move || {
                    let cancelled = async move {
                        let _ = cancel_rx.recv().await;
                        Completion::failed(kind, TransportError::Cancelled)
                    };
                    let completion = future::block_on(future::or(transfer(interface), cancelled));
                    sink.complete(completion);
                })
                .map_err(|e| TransportError::Io(format!("transfer thread: {e}")))?;

            let mut in_flight = lock(self.in_flight(kind));
            in_flight.retain(|t| !t.handle.is_finished());
            in_flight.push(InFlight {
                cancel: cancel_tx,
                handle,
            });
            Ok(())
        }
    }

    impl UsbTransport for NusbTransport {
        fn describe(&self) -> String {
            self.location.clone()
        }

        fn control_in(&self, setup: &ControlSetup, timeout: Duration) -> Result<Vec<u8>> {
            let mut buf = vec![0u8; setup.length as usize];
            let n = self
                .interface
                .control_in_blocking(control(setup), &mut buf, timeout)
                .map_err(|e| map_blocking_error("control_in", e))?;
            buf.truncate(n);
            Ok(buf)
        }

        fn control_out(
            &self,
            setup: &ControlSetup,
            data: &[u8],
            timeout: Duration,
        ) -> Result<usize> {
            self.interface
                .control_out_blocking(control(setup), data, timeout)
                .map_err(|e| map_blocking_error("control_out", e))
        }

        fn submit_control(
            &self,
            setup: ControlSetup,
            data: [u8; CTRL_BUFFER_SIZE],
            sink: CompletionSink,
        ) -> Result<()> {
            self.spawn(TransferKind::Control, sink, move |interface| {
                Box::pin(async move {
                    let done = interface
                        .control_out(ControlOut {
                            control_type: ControlType::Vendor,
                            recipient: Recipient::Device,
                            request: setup.request,
                            value: setup.value,
                            index: setup.index,
                            data: &data,
                        })
                        .await;
                    Completion {
                        kind: TransferKind::Control,
                        status: done.status.map_err(|e| map_transfer_error("tilt write", e)),
                        data: Vec::new(),
                    }
                })
            })
        }

        fn limit_endpoint(&self) -> Option<u8> {
            self.limit_endpoint
        }

        fn submit_interrupt_in(&self, endpoint: u8, len: usize, sink: CompletionSink) -> Result<()> {
            self.spawn(TransferKind::Interrupt, sink, move |interface| {
                Box::pin(async move {
                    let done = interface
                        .interrupt_in(endpoint, RequestBuffer::new(len))
                        .await;
                    Completion {
                        kind: TransferKind::Interrupt,
                        status: done.status.map_err(|e| map_transfer_error("limit read", e)),
                        data: done.data,
                    }
                })
            })
        }

        fn cancel(&self, kind: TransferKind) {
            let pending = std::mem::take(&mut *lock(self.in_flight(kind)));
            for transfer in &pending {
                transfer.cancel.close();
            }
            for transfer in pending {
                if transfer.handle.join().is_err() {
                    log::warn!("{}: {kind:?} transfer thread panicked", self.location);
                }
            }
        }
    }

    /// Enumerates Kinect motor units through `nusb`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NusbSource;

    fn matches(dev: &nusb::DeviceInfo) -> bool {
        dev.vendor_id() == KINECT_MOTOR_VID && dev.product_id() == KINECT_MOTOR_PID
    }

    fn address(dev: &nusb::DeviceInfo) -> DeviceAddress {
        DeviceAddress {
            bus: dev.bus_number(),
            address: dev.device_address(),
        }
    }

    impl DeviceSource for NusbSource {
        type Transport = NusbTransport;

        fn scan(&self) -> Result<Vec<DeviceInfo>> {
            let devices = nusb::list_devices()
                .map_err(|e| TransportError::Io(format!("USB enumeration: {e}")))?;
            Ok(devices
                .filter(matches)
                .map(|dev| DeviceInfo {
                    address: address(&dev),
                    serial: dev.serial_number().map(|s| s.to_string()),
                })
                .collect())
        }

        fn open(&self, device: &DeviceInfo) -> Result<Arc<NusbTransport>> {
            let info = nusb::list_devices()
                .map_err(|e| TransportError::Io(format!("USB enumeration: {e}")))?
                .filter(matches)
                .find(|dev| address(dev) == device.address)
                .ok_or(TransportError::NotFound)?;
            NusbTransport::open(&info).map(Arc::new)
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::{NusbSource, NusbTransport};

// ── Stub for unsupported platforms ──

#[cfg(not(target_os = "linux"))]
mod stub_impl {
    use super::*;
    use std::time::Duration;

    use crate::protocol::{CTRL_BUFFER_SIZE, ControlSetup};
    use crate::transport::{CompletionSink, Result, TransferKind};

    fn unsupported() -> TransportError {
        TransportError::Io("usb: no backend for this platform".into())
    }

    /// Never constructed; exists so the platform aliases resolve.
    pub struct StubTransport;

    impl UsbTransport for StubTransport {
        fn describe(&self) -> String {
            "unsupported".into()
        }

        fn control_in(&self, _setup: &ControlSetup, _timeout: Duration) -> Result<Vec<u8>> {
            Err(unsupported())
        }

        fn control_out(&self, _setup: &ControlSetup, _data: &[u8], _timeout: Duration) -> Result<usize> {
            Err(unsupported())
        }

        fn submit_control(
            &self,
            _setup: ControlSetup,
            _data: [u8; CTRL_BUFFER_SIZE],
            _sink: CompletionSink,
        ) -> Result<()> {
            Err(unsupported())
        }

        fn cancel(&self, _kind: TransferKind) {}
    }

    #[derive(Debug, Default, Clone, Copy)]
    pub struct StubSource;

    impl DeviceSource for StubSource {
        type Transport = StubTransport;

        fn scan(&self) -> Result<Vec<DeviceInfo>> {
            Ok(Vec::new())
        }

        fn open(&self, _device: &DeviceInfo) -> Result<Arc<StubTransport>> {
            Err(unsupported())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub_impl::{StubSource, StubTransport};

/// Concrete transport type for the current platform.
#[cfg(target_os = "linux")]
pub type PlatformTransport = NusbTransport;
#[cfg(not(target_os = "linux"))]
pub type PlatformTransport = StubTransport;

/// Concrete device source for the current platform.
#[cfg(target_os = "linux")]
pub type PlatformSource = NusbSource;
#[cfg(not(target_os = "linux"))]
pub type PlatformSource = StubSource;

/// List the motor units currently on the bus. Empty on error or on
/// platforms without a backend.
pub fn enumerate_devices() -> Vec<DeviceInfo> {
    match PlatformSource::default().scan() {
        Ok(devices) => devices,
        Err(e) => {
            log::warn!("{e}");
            Vec::new()
        }
    }
}

/// Open a transport to a unit. With an empty `serial` the first unit found
/// is used.
pub fn open_transport(serial: &str) -> Result<(DeviceInfo, Arc<PlatformTransport>), TransportError> {
    let source = PlatformSource::default();
    let serial = serial.trim();
    let device = source
        .scan()?
        .into_iter()
        .find(|d| serial.is_empty() || d.serial.as_deref() == Some(serial))
        .ok_or(TransportError::NotFound)?;
    let transport = source.open(&device)?;
    Ok((device, transport))
}
