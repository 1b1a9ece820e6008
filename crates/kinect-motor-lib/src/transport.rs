//! USB transport abstraction: the trait, completion plumbing and a mock backend.
//!
//! The driver core never talks to a USB stack directly. It sees a
//! [`UsbTransport`]: blocking control transfers for the attach handshake,
//! non-blocking submissions for commands and limit polling, and a blocking
//! `cancel`. Asynchronous results come back as [`Completion`] messages pushed
//! into a [`CompletionSink`]; the instance's completion worker drains them.

use std::fmt;
use std::sync::mpsc::Sender;
use std::time::Duration;

use crate::protocol::{CTRL_BUFFER_SIZE, ControlSetup};

// ── Error type ──

/// Transport-level failures.
///
/// String payloads follow the convention **"context: details"**, e.g.
/// `"claim interface 0: busy"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    NotFound,
    Disconnected,
    Stall,
    TimedOut,
    Cancelled,
    Io(String),
}

impl TransportError {
    /// Statuses produced when the device is going away or the transfer was
    /// killed on purpose. The completion path absorbs these silently.
    pub fn is_device_gone(&self) -> bool {
        matches!(
            self,
            TransportError::NotFound | TransportError::Disconnected | TransportError::Cancelled
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotFound => write!(f, "Kinect motor not found"),
            TransportError::Disconnected => write!(f, "device disconnected"),
            TransportError::Stall => write!(f, "endpoint stalled"),
            TransportError::TimedOut => write!(f, "transfer timed out"),
            TransportError::Cancelled => write!(f, "transfer cancelled"),
            TransportError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

// ── Completions ──

/// Which of the instance's two asynchronous transfers a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// The tilt command write on the default control endpoint.
    Control,
    /// The limit-status read on the interrupt endpoint.
    Interrupt,
}

/// Result of an asynchronous transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub kind: TransferKind,
    pub status: Result<()>,
    /// Bytes received (interrupt reads); empty for writes.
    pub data: Vec<u8>,
}

impl Completion {
    pub fn ok(kind: TransferKind, data: Vec<u8>) -> Self {
        Completion {
            kind,
            status: Ok(()),
            data,
        }
    }

    pub fn failed(kind: TransferKind, error: TransportError) -> Self {
        Completion {
            kind,
            status: Err(error),
            data: Vec::new(),
        }
    }
}

/// Messages consumed by an instance's completion worker.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Completed(Completion),
    /// Acknowledge once every earlier event has been handled.
    Barrier(Sender<()>),
    Shutdown,
}

/// Where a transport delivers completions. Cheap to clone; delivery never
/// blocks, and completions sent after the instance is gone are dropped.
#[derive(Debug, Clone)]
pub struct CompletionSink {
    tx: Sender<WorkerEvent>,
}

impl CompletionSink {
    pub(crate) fn new(tx: Sender<WorkerEvent>) -> Self {
        Self { tx }
    }

    pub fn complete(&self, completion: Completion) {
        let _ = self.tx.send(WorkerEvent::Completed(completion));
    }
}

// ── Trait ──

pub trait UsbTransport: Send + Sync + 'static {
    /// Human-readable location, e.g. `usb:001/004`.
    fn describe(&self) -> String;

    /// Blocking device-to-host control transfer. Returns the bytes received.
    fn control_in(&self, setup: &ControlSetup, timeout: Duration) -> Result<Vec<u8>>;

    /// Blocking host-to-device control transfer. Returns bytes written.
    fn control_out(&self, setup: &ControlSetup, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Queue a host-to-device control transfer and return immediately. The
    /// outcome arrives on `sink` as a [`TransferKind::Control`] completion.
    fn submit_control(
        &self,
        setup: ControlSetup,
        data: [u8; CTRL_BUFFER_SIZE],
        sink: CompletionSink,
    ) -> Result<()>;

    /// Address of the limit-status interrupt endpoint, if the unit has one.
    fn limit_endpoint(&self) -> Option<u8> {
        None
    }

    /// Queue an interrupt read of `len` bytes from `endpoint`.
    fn submit_interrupt_in(&self, endpoint: u8, len: usize, sink: CompletionSink) -> Result<()> {
        let _ = (len, sink);
        Err(TransportError::Io(format!(
            "interrupt endpoint 0x{endpoint:02x}: not supported by this transport"
        )))
    }

    /// Cancel in-flight transfers of `kind` and wait until they are gone.
    /// Cancelled transfers complete with [`TransportError::Cancelled`].
    fn cancel(&self, kind: TransferKind);
}

// ── Mock transport for testing ──

/// In-memory transport for unit and integration tests.
///
/// Always compiled (zero runtime cost), hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Condvar, Mutex, PoisonError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::protocol::{INIT_STATUS_SENTINEL, TiltCommand};
    use crate::sync::lock;

    /// Records every transfer and keeps asynchronous ones pending until the
    /// test completes them with [`complete_control`](Self::complete_control)
    /// or [`deliver_interrupt`](Self::deliver_interrupt).
    pub struct MockTransport {
        /// Reply to the status read. Defaults to the healthy sentinel.
        pub status_reply: Mutex<Vec<u8>>,
        /// If set, the status read fails with this error.
        pub fail_control_in: Mutex<Option<TransportError>>,
        /// If set, blocking writes fail with this error.
        pub fail_control_out: Mutex<Option<TransportError>>,
        /// If set, asynchronous submissions fail with this error.
        pub fail_submit: Mutex<Option<TransportError>>,
        /// Blocking control reads, in order.
        pub sync_in: Mutex<Vec<ControlSetup>>,
        /// Blocking control writes, in order.
        pub sync_out: Mutex<Vec<(ControlSetup, Vec<u8>)>>,
        /// Asynchronous control writes, in order.
        pub submitted: Mutex<Vec<ControlSetup>>,
        /// Recorded cancel calls.
        pub cancels: Mutex<Vec<TransferKind>>,
        /// Number of interrupt reads submitted.
        pub interrupt_submissions: AtomicUsize,
        limit_endpoint: Option<u8>,
        pending_control: Mutex<VecDeque<CompletionSink>>,
        pending_interrupt: Mutex<Option<CompletionSink>>,
        unplugged: AtomicBool,
        submit_held: Mutex<bool>,
        submit_resumed: Condvar,
        submit_waiting: AtomicUsize,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockTransport {
        pub fn new() -> Self {
            let mut status = vec![0u8; CTRL_BUFFER_SIZE];
            status[0] = INIT_STATUS_SENTINEL;
            MockTransport {
                status_reply: Mutex::new(status),
                fail_control_in: Mutex::new(None),
                fail_control_out: Mutex::new(None),
                fail_submit: Mutex::new(None),
                sync_in: Mutex::new(Vec::new()),
                sync_out: Mutex::new(Vec::new()),
                submitted: Mutex::new(Vec::new()),
                cancels: Mutex::new(Vec::new()),
                interrupt_submissions: AtomicUsize::new(0),
                limit_endpoint: None,
                pending_control: Mutex::new(VecDeque::new()),
                pending_interrupt: Mutex::new(None),
                unplugged: AtomicBool::new(false),
                submit_held: Mutex::new(false),
                submit_resumed: Condvar::new(),
                submit_waiting: AtomicUsize::new(0),
            }
        }

        /// A unit that reports limit status on `endpoint`.
        pub fn with_limit_endpoint(endpoint: u8) -> Self {
            MockTransport {
                limit_endpoint: Some(endpoint),
                ..Self::new()
            }
        }

        pub fn set_status_reply(&self, reply: Vec<u8>) {
            *lock(&self.status_reply) = reply;
        }

        /// Tilt commands carried by asynchronous writes, in order.
        pub fn submitted_commands(&self) -> Vec<TiltCommand> {
            lock(&self.submitted)
                .iter()
                .map(|s| TiltCommand::from_wire_value(s.value))
                .collect()
        }

        pub fn control_pending(&self) -> usize {
            lock(&self.pending_control).len()
        }

        pub fn interrupt_pending(&self) -> bool {
            lock(&self.pending_interrupt).is_some()
        }

        /// Complete the oldest pending control write. Returns false if none.
        pub fn complete_control(&self, status: Result<()>) -> bool {
            let Some(sink) = lock(&self.pending_control).pop_front() else {
                return false;
            };
            sink.complete(Completion {
                kind: TransferKind::Control,
                status,
                data: Vec::new(),
            });
            true
        }

        /// Complete the pending interrupt read with `data`. Returns false if
        /// no read is pending.
        pub fn deliver_interrupt(&self, data: &[u8]) -> bool {
            let Some(sink) = lock(&self.pending_interrupt).take() else {
                return false;
            };
            sink.complete(Completion::ok(TransferKind::Interrupt, data.to_vec()));
            true
        }

        /// Fail the pending interrupt read with `error`.
        pub fn fail_interrupt(&self, error: TransportError) -> bool {
            let Some(sink) = lock(&self.pending_interrupt).take() else {
                return false;
            };
            sink.complete(Completion::failed(TransferKind::Interrupt, error));
            true
        }

        /// Simulate a physical unplug: pending transfers complete with
        /// `Disconnected` and later submissions are refused.
        pub fn unplug(&self) {
            self.unplugged.store(true, Ordering::SeqCst);
            for sink in lock(&self.pending_control).drain(..) {
                sink.complete(Completion::failed(
                    TransferKind::Control,
                    TransportError::Disconnected,
                ));
            }
            self.fail_interrupt(TransportError::Disconnected);
        }

        /// Park every later `submit_control` until
        /// [`resume_submissions`](Self::resume_submissions). The caller's
        /// instance lock stays held while parked.
        pub fn hold_submissions(&self) {
            *lock(&self.submit_held) = true;
        }

        pub fn resume_submissions(&self) {
            *lock(&self.submit_held) = false;
            self.submit_resumed.notify_all();
        }

        /// Submissions currently parked by [`hold_submissions`](Self::hold_submissions).
        pub fn parked_submissions(&self) -> usize {
            self.submit_waiting.load(Ordering::SeqCst)
        }

        fn wait_while_held(&self) {
            let mut held = lock(&self.submit_held);
            if !*held {
                return;
            }
            self.submit_waiting.fetch_add(1, Ordering::SeqCst);
            while *held {
                held = self
                    .submit_resumed
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            self.submit_waiting.fetch_sub(1, Ordering::SeqCst);
        }

        fn check_plugged(&self) -> Result<()> {
            if self.unplugged.load(Ordering::SeqCst) {
                Err(TransportError::Disconnected)
            } else {
                Ok(())
            }
        }
    }

    impl UsbTransport for MockTransport {
        fn describe(&self) -> String {
            "mock://kinect-motor".into()
        }

        fn control_in(&self, setup: &ControlSetup, _timeout: Duration) -> Result<Vec<u8>> {
            self.check_plugged()?;
            if !setup.is_in() {
                return Err(TransportError::Io("control_in: host-to-device setup".into()));
            }
            lock(&self.sync_in).push(*setup);
            if let Some(e) = lock(&self.fail_control_in).clone() {
                return Err(e);
            }
            let mut reply = lock(&self.status_reply).clone();
            reply.truncate(setup.length as usize);
            Ok(reply)
        }

        fn control_out(
            &self,
            setup: &ControlSetup,
            data: &[u8],
            _timeout: Duration,
        ) -> Result<usize> {
            self.check_plugged()?;
            if setup.is_in() {
                return Err(TransportError::Io("control_out: device-to-host setup".into()));
            }
            lock(&self.sync_out).push((*setup, data.to_vec()));
            if let Some(e) = lock(&self.fail_control_out).clone() {
                return Err(e);
            }
            Ok(data.len())
        }

        fn submit_control(
            &self,
            setup: ControlSetup,
            _data: [u8; CTRL_BUFFER_SIZE],
            sink: CompletionSink,
        ) -> Result<()> {
            self.wait_while_held();
            self.check_plugged()?;
            if let Some(e) = lock(&self.fail_submit).clone() {
                return Err(e);
            }
            lock(&self.submitted).push(setup);
            lock(&self.pending_control).push_back(sink);
            Ok(())
        }

        fn limit_endpoint(&self) -> Option<u8> {
            self.limit_endpoint
        }

        fn submit_interrupt_in(
            &self,
            endpoint: u8,
            _len: usize,
            sink: CompletionSink,
        ) -> Result<()> {
            self.check_plugged()?;
            if self.limit_endpoint != Some(endpoint) {
                return Err(TransportError::Io(format!(
                    "interrupt endpoint 0x{endpoint:02x}: no such endpoint"
                )));
            }
            let mut pending = lock(&self.pending_interrupt);
            if pending.is_some() {
                return Err(TransportError::Io("interrupt read: already queued".into()));
            }
            *pending = Some(sink);
            self.interrupt_submissions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn cancel(&self, kind: TransferKind) {
            lock(&self.cancels).push(kind);
            match kind {
                TransferKind::Control => {
                    for sink in lock(&self.pending_control).drain(..) {
                        sink.complete(Completion::failed(kind, TransportError::Cancelled));
                    }
                }
                TransferKind::Interrupt => {
                    self.fail_interrupt(TransportError::Cancelled);
                }
            }
        }
    }
}
