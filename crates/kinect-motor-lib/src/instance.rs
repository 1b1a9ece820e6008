//! One attached motor: its locks, its transfers, and its completion worker.
//!
//! Two contexts touch an instance:
//!
//! - caller context (open, write, release, detach) serializes on the
//!   [`InstanceLock`] around [`InstanceState`];
//! - the completion worker thread, which only ever takes the
//!   [`SpinLock`] around the [`CommandSlot`].
//!
//! The worker owns a clone of the transport handle and learns about
//! detach through the `attached` flag, so nulling the caller-side handle
//! never races with completion handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::control::{self, CommandSlot};
use crate::error::{MotorError, Result};
use crate::feedback::{FeedbackLoop, FeedbackState};
use crate::protocol::{CTRL_BUFFER_SIZE, TiltCommand, node_name};
use crate::sync::{InstanceLock, Signal, SpinLock, lock};
use crate::transport::{CompletionSink, TransferKind, UsbTransport, WorkerEvent};

/// Caller-context state, guarded by the instance lock.
pub struct InstanceState<T> {
    /// `None` once the device has been detached.
    pub(crate) transport: Option<Arc<T>>,
    pub(crate) open_count: i32,
    pub(crate) ctrl_buffer: [u8; CTRL_BUFFER_SIZE],
}

/// Everything the completion worker needs.
struct Shared<T> {
    transport: Arc<T>,
    command: SpinLock<CommandSlot>,
    feedback: Option<FeedbackLoop>,
    attached: AtomicBool,
    sink: CompletionSink,
}

pub struct MotorInstance<T: UsbTransport> {
    minor: u32,
    pub(crate) state: InstanceLock<InstanceState<T>>,
    shared: Arc<Shared<T>>,
    events: Sender<WorkerEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl<T: UsbTransport> MotorInstance<T> {
    /// Build the instance, start its completion worker, and run the init
    /// handshake. Any failure tears down whatever was set up.
    ///
    /// With `feedback` set and a limit endpoint present, a feedback loop is
    /// created but not armed.
    pub(crate) fn create(
        minor: u32,
        transport: Arc<T>,
        feedback: bool,
        init_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel();
        let feedback = if feedback {
            transport.limit_endpoint().map(FeedbackLoop::new)
        } else {
            None
        };
        let shared = Arc::new(Shared {
            transport: Arc::clone(&transport),
            command: SpinLock::new(CommandSlot::default()),
            feedback,
            attached: AtomicBool::new(true),
            sink: CompletionSink::new(tx.clone()),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{}-completion", node_name(minor)))
                .spawn(move || run_worker(&shared, rx))
                .map_err(|e| MotorError::AllocationFailure(format!("completion worker: {e}")))?
        };

        let instance = Arc::new(MotorInstance {
            minor,
            state: InstanceLock::new(InstanceState {
                transport: Some(Arc::clone(&transport)),
                open_count: 0,
                ctrl_buffer: [0u8; CTRL_BUFFER_SIZE],
            }),
            shared,
            events: tx,
            worker: Mutex::new(Some(worker)),
            torn_down: AtomicBool::new(false),
        });

        let init = {
            let mut state = instance.state.lock();
            control::initialize(&*transport, init_timeout, &mut state.ctrl_buffer)
        };
        if let Err(e) = init {
            instance.teardown();
            return Err(e);
        }
        Ok(instance)
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Device node name, e.g. `kinect-motor0`.
    pub fn name(&self) -> String {
        node_name(self.minor)
    }

    /// Whether this instance drives `transport`.
    pub fn is_bound_to(&self, transport: &Arc<T>) -> bool {
        Arc::ptr_eq(&self.shared.transport, transport)
    }

    pub fn describe(&self) -> String {
        self.shared.transport.describe()
    }

    pub fn is_attached(&self) -> bool {
        self.shared.attached.load(Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> i32 {
        self.state.lock().open_count
    }

    /// The status block read during the init handshake, until the first
    /// command overwrites the buffer.
    pub fn ctrl_buffer(&self) -> [u8; CTRL_BUFFER_SIZE] {
        self.state.lock().ctrl_buffer
    }

    /// Last command sent, or its corrected replacement.
    pub fn current_command(&self) -> TiltCommand {
        self.shared.command.lock().command
    }

    pub fn correction_required(&self) -> bool {
        self.shared.command.lock().correction_required
    }

    pub fn feedback_state(&self) -> FeedbackState {
        match &self.shared.feedback {
            Some(fb) => fb.state(&self.shared.command),
            None => FeedbackState::Idle,
        }
    }

    /// Limit reports handled and corrective writes issued so far.
    pub fn feedback_counters(&self) -> Option<(u64, u64)> {
        self.shared
            .feedback
            .as_ref()
            .map(|fb| (fb.reports(), fb.corrections()))
    }

    /// Start limit polling. A no-op without a feedback loop.
    pub(crate) fn arm_feedback(&self) -> Result<()> {
        match &self.shared.feedback {
            Some(fb) => fb.arm(&*self.shared.transport, self.shared.sink.clone()),
            None => Ok(()),
        }
    }

    /// Open one more handle on this instance.
    pub(crate) fn open(&self, signal: &Signal, exclusive: bool) -> Result<()> {
        let mut state = self.state.lock_interruptible(signal)?;
        if exclusive && state.open_count > 0 {
            log::debug!("{}: refusing second open", self.name());
            return Err(MotorError::AlreadyOpen);
        }
        state.open_count += 1;
        if state.open_count > 1 {
            log::debug!("{}: open_count = {}", self.name(), state.open_count);
        }
        Ok(())
    }

    /// Submit a tilt command.
    pub fn submit(&self, command: TiltCommand, signal: &Signal) -> Result<()> {
        let mut state = self.state.lock_interruptible(signal)?;
        let Some(transport) = state.transport.clone() else {
            log::error!("{}: no device or device unplugged", self.name());
            return Err(MotorError::NotAttached);
        };
        log::debug!("{}: tilt {command}", self.name());
        control::submit_command(
            &*transport,
            &self.shared.command,
            command,
            &mut state.ctrl_buffer,
            self.shared.sink.clone(),
        )
    }

    /// Drop one handle. The last release of a detached instance tears it
    /// down.
    pub(crate) fn release(&self, signal: &Signal) -> Result<()> {
        let mut state = self.state.lock_interruptible(signal)?;
        if state.open_count <= 0 {
            log::error!("{}: release of a device that is not open", self.name());
            return Err(MotorError::NotOpen);
        }
        state.open_count -= 1;

        match state.transport.clone() {
            Some(transport) => {
                transport.cancel(TransferKind::Control);
            }
            None => {
                log::debug!("{}: device unplugged before the file was released", self.name());
                if state.open_count == 0 {
                    drop(state);
                    self.teardown();
                }
            }
        }
        Ok(())
    }

    /// Device-removal half of detach. Always completes; the caller holds the
    /// process-wide disconnect lock and has already unregistered us.
    pub(crate) fn detach(&self) {
        let mut state = self.state.lock();
        self.shared.attached.store(false, Ordering::SeqCst);
        if let Some(fb) = &self.shared.feedback {
            fb.disarm(&*self.shared.transport);
        }
        self.shared.transport.cancel(TransferKind::Control);

        if state.open_count == 0 {
            drop(state);
            self.teardown();
        } else {
            log::debug!(
                "{}: {} handle(s) still open, deferring teardown",
                self.name(),
                state.open_count
            );
            state.transport = None;
        }
    }

    /// Stop all transfer activity and join the completion worker.
    ///
    /// Idempotent; returns `false` if the instance was already torn down.
    pub(crate) fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.attached.store(false, Ordering::SeqCst);
        if let Some(fb) = &self.shared.feedback {
            fb.disarm(&*self.shared.transport);
        }
        self.shared.transport.cancel(TransferKind::Control);

        let _ = self.events.send(WorkerEvent::Shutdown);
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("{}: completion worker panicked", self.name());
            }
        }
        // The worker may have queued a correction or a limit read before it
        // saw the flags.
        self.shared.transport.cancel(TransferKind::Control);
        self.shared.transport.cancel(TransferKind::Interrupt);
        log::debug!("{}: torn down", self.name());
        true
    }

    /// Block until every completion delivered so far has been handled.
    #[doc(hidden)]
    pub fn sync_completions(&self) {
        let (tx, rx) = mpsc::channel();
        if self.events.send(WorkerEvent::Barrier(tx)).is_ok() {
            let _ = rx.recv();
        }
    }
}

impl<T: UsbTransport> Drop for MotorInstance<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn run_worker<T: UsbTransport>(shared: &Shared<T>, events: Receiver<WorkerEvent>) {
    for event in events {
        match event {
            WorkerEvent::Completed(completion) => match completion.kind {
                TransferKind::Control => control::on_complete(&shared.command, &completion),
                TransferKind::Interrupt => {
                    if let Some(fb) = &shared.feedback {
                        fb.on_complete(
                            completion,
                            &*shared.transport,
                            &shared.command,
                            &shared.sink,
                            shared.attached.load(Ordering::SeqCst),
                        );
                    }
                }
            },
            WorkerEvent::Barrier(ack) => {
                let _ = ack.send(());
            }
            WorkerEvent::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AXIS_TILT, MINOR_BASE};
    use crate::transport::TransportError;
    use crate::transport::mock::MockTransport;

    const TIMEOUT: Duration = Duration::from_millis(50);

    type Fixture = (Arc<MockTransport>, Arc<MotorInstance<MockTransport>>);

    fn create(mock: MockTransport, feedback: bool) -> Fixture {
        let mock = Arc::new(mock);
        let instance =
            MotorInstance::create(MINOR_BASE, Arc::clone(&mock), feedback, TIMEOUT).unwrap();
        (mock, instance)
    }

    #[test]
    fn create_runs_handshake() {
        let (mock, instance) = create(MockTransport::new(), false);
        assert_eq!(mock.sync_in.lock().unwrap().len(), 1);
        assert_eq!(mock.sync_out.lock().unwrap().len(), 1);
        assert_eq!(instance.ctrl_buffer()[0], 0x22);
        assert!(instance.is_attached());
        assert_eq!(instance.name(), "kinect-motor0");
    }

    #[test]
    fn create_failure_tears_down() {
        let mock = Arc::new(MockTransport::new());
        mock.set_status_reply(vec![0u8; 8]);
        let err = MotorInstance::create(MINOR_BASE, Arc::clone(&mock), false, TIMEOUT)
            .err()
            .unwrap();
        assert!(matches!(err, MotorError::UnexpectedDeviceResponse(_)));
        assert!(mock.cancels.lock().unwrap().contains(&TransferKind::Control));
    }

    #[test]
    fn submit_sends_command() {
        let (mock, instance) = create(MockTransport::new(), false);
        instance.submit(TiltCommand::from(20), &Signal::new()).unwrap();
        assert_eq!(mock.submitted_commands(), vec![TiltCommand::from(20)]);
        assert_eq!(instance.current_command(), TiltCommand::from(20));
        assert_eq!(instance.ctrl_buffer(), [0u8; 8]);
    }

    #[test]
    fn completions_reach_worker() {
        let (mock, instance) = create(MockTransport::with_limit_endpoint(0x81), true);
        instance.arm_feedback().unwrap();
        instance.submit(TiltCommand::from(30), &Signal::new()).unwrap();
        mock.complete_control(Ok(()));

        assert!(mock.deliver_interrupt(&[AXIS_TILT, 0]));
        instance.sync_completions();
        assert_eq!(instance.current_command(), TiltCommand::STOP);
        assert_eq!(instance.feedback_state(), FeedbackState::Correcting);

        mock.complete_control(Ok(()));
        instance.sync_completions();
        assert_eq!(instance.feedback_state(), FeedbackState::Running);
        assert_eq!(instance.feedback_counters(), Some((1, 1)));
    }

    #[test]
    fn no_feedback_without_endpoint() {
        let (mock, instance) = create(MockTransport::new(), true);
        instance.arm_feedback().unwrap();
        assert_eq!(instance.feedback_state(), FeedbackState::Idle);
        assert_eq!(mock.interrupt_submissions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn teardown_is_idempotent() {
        let (mock, instance) = create(MockTransport::with_limit_endpoint(0x81), true);
        instance.arm_feedback().unwrap();
        assert!(instance.teardown());
        assert!(!instance.teardown());
        assert!(!mock.interrupt_pending());
        assert!(instance.is_torn_down());
        instance.sync_completions();
    }

    #[test]
    fn teardown_cancels_both_kinds_after_join() {
        let (mock, instance) = create(MockTransport::with_limit_endpoint(0x81), true);
        instance.arm_feedback().unwrap();
        instance.teardown();
        assert_eq!(
            *mock.cancels.lock().unwrap(),
            vec![
                TransferKind::Interrupt,
                TransferKind::Control,
                TransferKind::Control,
                TransferKind::Interrupt,
            ]
        );
    }

    #[test]
    fn release_without_open_is_not_open() {
        let (_mock, instance) = create(MockTransport::new(), false);
        assert!(matches!(
            instance.release(&Signal::new()),
            Err(MotorError::NotOpen)
        ));
    }

    #[test]
    fn detach_with_open_handle_defers_teardown() {
        let (mock, instance) = create(MockTransport::new(), false);
        instance.open(&Signal::new(), false).unwrap();
        instance.detach();
        assert!(!instance.is_torn_down());
        assert!(matches!(
            instance.submit(TiltCommand::from(1), &Signal::new()),
            Err(MotorError::NotAttached)
        ));

        instance.release(&Signal::new()).unwrap();
        assert!(instance.is_torn_down());
        assert!(mock.submitted_commands().is_empty());
    }

    #[test]
    fn submit_error_is_reported() {
        let (mock, instance) = create(MockTransport::new(), false);
        *mock.fail_submit.lock().unwrap() = Some(TransportError::Stall);
        assert!(matches!(
            instance.submit(TiltCommand::from(1), &Signal::new()),
            Err(MotorError::TransferSubmit(TransportError::Stall))
        ));
    }
}
