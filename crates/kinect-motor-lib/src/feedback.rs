//! Limit-switch feedback loop.
//!
//! While armed, one interrupt read is kept outstanding on the unit's limit
//! endpoint. Each report is checked against the outstanding command; a
//! command pushing into a limit the motor already reached is replaced with
//! [`TiltCommand::STOP`] and a corrective write goes out.
//!
//! State machine: `Idle -> Armed -> Running <-> Correcting`, with any state
//! returning to `Idle` on disarm, device loss, or a second consecutive
//! read error.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};

use crate::control::CommandSlot;
use crate::error::{MotorError, Result};
use crate::protocol::{CTRL_BUFFER_SIZE, ControlSetup, LIMIT_REPORT_SIZE, LimitReport, TiltCommand};
use crate::sync::SpinLock;
use crate::transport::{Completion, CompletionSink, TransferKind, UsbTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackState {
    /// Not polling.
    Idle,
    /// Read submitted, no report yet.
    Armed,
    /// Reports flowing.
    Running,
    /// A corrective write is in flight.
    Correcting,
}

impl fmt::Display for FeedbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedbackState::Idle => write!(f, "idle"),
            FeedbackState::Armed => write!(f, "armed"),
            FeedbackState::Running => write!(f, "running"),
            FeedbackState::Correcting => write!(f, "correcting"),
        }
    }
}

pub struct FeedbackLoop {
    endpoint: u8,
    running: AtomicBool,
    received: AtomicBool,
    /// The previous read failed and was resubmitted once.
    retried: AtomicBool,
    reports: AtomicU64,
    corrections: AtomicU64,
}

impl FeedbackLoop {
    pub fn new(endpoint: u8) -> Self {
        FeedbackLoop {
            endpoint,
            running: AtomicBool::new(false),
            received: AtomicBool::new(false),
            retried: AtomicBool::new(false),
            reports: AtomicU64::new(0),
            corrections: AtomicU64::new(0),
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Start polling. On submission failure the loop stays idle.
    pub fn arm<T: UsbTransport + ?Sized>(&self, transport: &T, sink: CompletionSink) -> Result<()> {
        self.received.store(false, Ordering::SeqCst);
        self.retried.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        if let Err(e) = transport.submit_interrupt_in(self.endpoint, LIMIT_REPORT_SIZE, sink) {
            self.running.store(false, Ordering::SeqCst);
            return Err(MotorError::TransferSubmit(e));
        }
        log::debug!("limit feedback armed on endpoint 0x{:02x}", self.endpoint);
        Ok(())
    }

    /// Stop polling and kill the outstanding read.
    ///
    /// The flag is published before the cancel so the completion worker
    /// cannot resubmit once the cancelled read comes back.
    pub fn disarm<T: UsbTransport + ?Sized>(&self, transport: &T) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        transport.cancel(TransferKind::Interrupt);
        if was_running {
            log::debug!("limit feedback disarmed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self, slot: &SpinLock<CommandSlot>) -> FeedbackState {
        if !self.is_running() {
            FeedbackState::Idle
        } else if !self.received.load(Ordering::SeqCst) {
            FeedbackState::Armed
        } else if slot.lock().correcting {
            FeedbackState::Correcting
        } else {
            FeedbackState::Running
        }
    }

    /// Reports handled since creation.
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    /// Corrective writes submitted since creation.
    pub fn corrections(&self) -> u64 {
        self.corrections.load(Ordering::Relaxed)
    }

    /// Completion-context handler for the limit read.
    ///
    /// `attached` is false once the device is being detached; no new
    /// transfers are submitted after that.
    pub(crate) fn on_complete<T: UsbTransport + ?Sized>(
        &self,
        completion: Completion,
        transport: &T,
        slot: &SpinLock<CommandSlot>,
        sink: &CompletionSink,
        attached: bool,
    ) {
        match completion.status {
            Ok(()) => self.retried.store(false, Ordering::SeqCst),
            Err(e) if e.is_device_gone() => {
                log::debug!("limit read ended: {e}");
                self.running.store(false, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                if self.retried.swap(true, Ordering::SeqCst) {
                    log::warn!("limit read failed again ({e}), stopping feedback");
                    self.running.store(false, Ordering::SeqCst);
                } else {
                    log::warn!("limit read failed ({e}), resubmitting");
                    self.resubmit(transport, sink, attached);
                }
                return;
            }
        }

        self.received.store(true, Ordering::SeqCst);
        self.reports.fetch_add(1, Ordering::Relaxed);

        match LimitReport::parse(&completion.data) {
            Some(report) => {
                log::trace!("limit report: upper=0x{:02x} lower=0x{:02x}", report.upper, report.lower);
                self.apply(&report, transport, slot, sink, attached);
            }
            None => log::warn!("short limit report ({} bytes)", completion.data.len()),
        }

        self.resubmit(transport, sink, attached);
    }

    fn apply<T: UsbTransport + ?Sized>(
        &self,
        report: &LimitReport,
        transport: &T,
        slot: &SpinLock<CommandSlot>,
        sink: &CompletionSink,
        attached: bool,
    ) {
        let pending = {
            let mut slot = slot.lock();
            if let Some(corrected) = crate::protocol::correct_for_limits(slot.command, report) {
                log::info!("tilt limit reached, {} -> {corrected}", slot.command);
                slot.command = corrected;
                slot.correction_required = true;
            }
            if slot.correction_required && !slot.correcting && attached {
                slot.correction_required = false;
                slot.correcting = true;
                Some(slot.command)
            } else {
                None
            }
        };

        if let Some(command) = pending {
            self.submit_correction(command, transport, slot, sink);
        }
    }

    fn submit_correction<T: UsbTransport + ?Sized>(
        &self,
        command: TiltCommand,
        transport: &T,
        slot: &SpinLock<CommandSlot>,
        sink: &CompletionSink,
    ) {
        let setup = ControlSetup::set_tilt(command);
        match transport.submit_control(setup, [0u8; CTRL_BUFFER_SIZE], sink.clone()) {
            Ok(()) => {
                self.corrections.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::warn!("corrective write failed ({e}), retrying on next report");
                let mut slot = slot.lock();
                slot.correcting = false;
                slot.correction_required = true;
            }
        }
    }

    fn resubmit<T: UsbTransport + ?Sized>(&self, transport: &T, sink: &CompletionSink, attached: bool) {
        if !attached || !self.is_running() {
            return;
        }
        if let Err(e) = transport.submit_interrupt_in(self.endpoint, LIMIT_REPORT_SIZE, sink.clone()) {
            log::warn!("limit read resubmission failed ({e}), stopping feedback");
            self.running.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AXIS_TILT;
    use crate::transport::TransportError;
    use crate::transport::mock::MockTransport;
    use std::sync::mpsc;

    const EP: u8 = 0x81;

    struct Rig {
        mock: MockTransport,
        feedback: FeedbackLoop,
        slot: SpinLock<CommandSlot>,
        sink: CompletionSink,
        rx: mpsc::Receiver<crate::transport::WorkerEvent>,
    }

    impl Rig {
        fn armed(command: i8) -> Self {
            let (tx, rx) = mpsc::channel();
            let rig = Rig {
                mock: MockTransport::with_limit_endpoint(EP),
                feedback: FeedbackLoop::new(EP),
                slot: SpinLock::new(CommandSlot {
                    command: TiltCommand::from(command),
                    ..CommandSlot::default()
                }),
                sink: CompletionSink::new(tx),
                rx,
            };
            rig.feedback.arm(&rig.mock, rig.sink.clone()).unwrap();
            rig
        }

        /// Deliver `data` on the pending read and run the handler on it.
        fn report(&self, data: &[u8]) {
            assert!(self.mock.deliver_interrupt(data));
            self.pump(true);
        }

        fn fail(&self, error: TransportError) {
            assert!(self.mock.fail_interrupt(error));
            self.pump(true);
        }

        fn pump(&self, attached: bool) {
            while let Ok(crate::transport::WorkerEvent::Completed(c)) = self.rx.try_recv() {
                if c.kind == TransferKind::Interrupt {
                    self.feedback
                        .on_complete(c, &self.mock, &self.slot, &self.sink, attached);
                }
            }
        }
    }

    #[test]
    fn arm_submits_one_read() {
        let rig = Rig::armed(0);
        assert!(rig.mock.interrupt_pending());
        assert_eq!(rig.feedback.state(&rig.slot), FeedbackState::Armed);
    }

    #[test]
    fn arm_failure_leaves_idle() {
        let mock = MockTransport::new();
        let feedback = FeedbackLoop::new(EP);
        let (tx, _rx) = mpsc::channel();
        assert!(feedback.arm(&mock, CompletionSink::new(tx)).is_err());
        assert!(!feedback.is_running());
    }

    #[test]
    fn upper_limit_stops_upward_command() {
        let rig = Rig::armed(30);
        rig.report(&[AXIS_TILT, 0]);

        assert_eq!(rig.slot.lock().command, TiltCommand::STOP);
        assert_eq!(rig.mock.submitted_commands(), vec![TiltCommand::STOP]);
        assert_eq!(rig.feedback.state(&rig.slot), FeedbackState::Correcting);
        assert_eq!(rig.feedback.corrections(), 1);
        assert!(rig.mock.interrupt_pending(), "read resubmitted");
    }

    #[test]
    fn repeated_limit_report_corrects_once() {
        let rig = Rig::armed(30);
        rig.report(&[AXIS_TILT, 0]);
        rig.report(&[AXIS_TILT, 0]);
        assert_eq!(rig.mock.submitted_commands().len(), 1);
    }

    #[test]
    fn non_matching_report_leaves_command() {
        let rig = Rig::armed(-20);
        rig.report(&[AXIS_TILT, 0]);
        assert_eq!(rig.slot.lock().command, TiltCommand::from(-20));
        assert!(rig.mock.submitted_commands().is_empty());
        assert_eq!(rig.feedback.state(&rig.slot), FeedbackState::Running);
    }

    #[test]
    fn lower_limit_stops_downward_command() {
        let rig = Rig::armed(-20);
        rig.report(&[0, AXIS_TILT]);
        assert_eq!(rig.mock.submitted_commands(), vec![TiltCommand::STOP]);
    }

    #[test]
    fn failed_correction_retries_on_next_report() {
        let rig = Rig::armed(30);
        *rig.mock.fail_submit.lock().unwrap() = Some(TransportError::Stall);
        rig.report(&[AXIS_TILT, 0]);
        assert!(rig.slot.lock().correction_required);
        assert!(rig.mock.submitted_commands().is_empty());

        *rig.mock.fail_submit.lock().unwrap() = None;
        rig.report(&[0, 0]);
        assert_eq!(rig.mock.submitted_commands(), vec![TiltCommand::STOP]);
        assert!(!rig.slot.lock().correction_required);
    }

    #[test]
    fn one_error_resubmits_two_stop() {
        let rig = Rig::armed(0);
        rig.fail(TransportError::Stall);
        assert!(rig.feedback.is_running());
        assert!(rig.mock.interrupt_pending());

        rig.fail(TransportError::Stall);
        assert!(!rig.feedback.is_running());
        assert!(!rig.mock.interrupt_pending());
    }

    #[test]
    fn success_resets_error_budget() {
        let rig = Rig::armed(0);
        rig.fail(TransportError::Stall);
        rig.report(&[0, 0]);
        rig.fail(TransportError::Stall);
        assert!(rig.feedback.is_running());
    }

    #[test]
    fn device_gone_stops_silently() {
        let rig = Rig::armed(0);
        rig.fail(TransportError::Disconnected);
        assert_eq!(rig.feedback.state(&rig.slot), FeedbackState::Idle);
        assert!(!rig.mock.interrupt_pending());
    }

    #[test]
    fn disarm_cancels_and_prevents_resubmit() {
        let rig = Rig::armed(0);
        rig.feedback.disarm(&rig.mock);
        rig.pump(true);
        assert!(!rig.feedback.is_running());
        assert!(!rig.mock.interrupt_pending());
        assert_eq!(rig.mock.interrupt_submissions.load(Ordering::SeqCst), 1);
        assert_eq!(*rig.mock.cancels.lock().unwrap(), vec![TransferKind::Interrupt]);
    }

    #[test]
    fn detached_report_submits_nothing() {
        let rig = Rig::armed(30);
        assert!(rig.mock.deliver_interrupt(&[AXIS_TILT, 0]));
        rig.pump(false);
        assert!(rig.mock.submitted_commands().is_empty());
        assert!(!rig.mock.interrupt_pending());
    }

    #[test]
    fn short_report_is_ignored() {
        let rig = Rig::armed(30);
        rig.report(&[AXIS_TILT]);
        assert_eq!(rig.slot.lock().command, TiltCommand::from(30));
        assert!(rig.mock.interrupt_pending());
    }
}
