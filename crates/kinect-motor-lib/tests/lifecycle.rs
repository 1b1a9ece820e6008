//! Integration tests: attach → open → write → detach → release sequences
//! through the public API, using MockTransport.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kinect_motor_lib::driver::{DriverOptions, MotorDriver};
use kinect_motor_lib::error::MotorError;
use kinect_motor_lib::feedback::FeedbackState;
use kinect_motor_lib::node::MotorNode;
use kinect_motor_lib::protocol::*;
use kinect_motor_lib::sync::Signal;
use kinect_motor_lib::transport::mock::MockTransport;
use kinect_motor_lib::transport::{TransferKind, TransportError};

const LIMIT_EP: u8 = 0x81;

fn driver() -> MotorDriver<MockTransport> {
    MotorDriver::new(DriverOptions {
        init_timeout: Duration::from_millis(50),
        ..DriverOptions::default()
    })
}

fn attach(driver: &MotorDriver<MockTransport>, mock: MockTransport) -> (Arc<MockTransport>, u32) {
    let mock = Arc::new(mock);
    let minor = driver.attach(Arc::clone(&mock)).unwrap();
    (mock, minor)
}

// ── Commands ──

#[test]
fn every_command_reaches_the_wire_unchanged() {
    let driver = driver();
    let (mock, minor) = attach(&driver, MockTransport::new());
    let node = MotorNode::open(&driver, minor).unwrap();

    for v in -128..=127 {
        assert_eq!(node.write_raw(v).unwrap(), 1);
    }
    let sent: Vec<i32> = mock
        .submitted_commands()
        .iter()
        .map(|c| i32::from(c.value()))
        .collect();
    assert_eq!(sent, (-128..=127).collect::<Vec<_>>());
}

#[test]
fn write_45_sets_value_field_45() {
    let driver = driver();
    let (mock, minor) = attach(&driver, MockTransport::new());
    let node = MotorNode::open(&driver, minor).unwrap();

    node.write(&[45]).unwrap();
    let setup = mock.submitted.lock().unwrap()[0];
    assert_eq!(setup.request_type, REQUEST_TYPE_VENDOR_OUT);
    assert_eq!(setup.request, REQUEST_SET_TILT);
    assert_eq!(setup.value, 45);
    assert_eq!(setup.index, 0);
    assert_eq!(setup.length, 8);
}

#[test]
fn out_of_range_command_is_not_sent() {
    let driver = driver();
    let (mock, minor) = attach(&driver, MockTransport::new());
    let node = MotorNode::open(&driver, minor).unwrap();

    let err = node.write_raw(128).unwrap_err();
    assert!(matches!(err, MotorError::InvalidCommand(128)));
    assert_eq!(err.errno(), -22);
    assert!(mock.submitted_commands().is_empty());
}

#[test]
fn concurrent_writers_all_land() {
    let driver = Arc::new(driver());
    let (mock, minor) = attach(&driver, MockTransport::new());

    let writers: Vec<_> = (0..4)
        .map(|i| {
            let driver = Arc::clone(&driver);
            thread::spawn(move || {
                let node = MotorNode::open(&driver, minor).unwrap();
                for _ in 0..50 {
                    node.write(&[i as u8]).unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }
    assert_eq!(mock.submitted_commands().len(), 200);
    assert_eq!(driver.instances()[0].open_count(), 0);
}

// ── Open / release counting ──

#[test]
fn open_open_release_release_then_not_open() {
    let driver = driver();
    let (_mock, minor) = attach(&driver, MockTransport::new());
    let signal = Signal::new();

    let a = driver.open(minor, &signal).unwrap();
    let b = driver.open(minor, &signal).unwrap();
    assert_eq!(a.open_count(), 2);

    driver.release(&a, &signal).unwrap();
    driver.release(&b, &signal).unwrap();
    assert_eq!(a.open_count(), 0);
    assert!(matches!(
        driver.release(&a, &signal),
        Err(MotorError::NotOpen)
    ));
}

#[test]
fn release_cancels_pending_write() {
    let driver = driver();
    let (mock, minor) = attach(&driver, MockTransport::new());
    let node = MotorNode::open(&driver, minor).unwrap();
    node.write(&[10]).unwrap();
    assert_eq!(mock.control_pending(), 1);

    node.release().unwrap();
    assert_eq!(mock.control_pending(), 0);
    assert!(mock.cancels.lock().unwrap().contains(&TransferKind::Control));
}

#[test]
fn open_with_raised_signal_succeeds_when_uncontended() {
    let driver = driver();
    let (_mock, minor) = attach(&driver, MockTransport::new());
    let signal = Signal::new();
    signal.raise();
    assert!(MotorNode::open_with_signal(&driver, minor, signal).is_ok());
}

#[test]
fn raised_signal_interrupts_contended_calls() {
    let driver = driver();
    let (mock, minor) = attach(&driver, MockTransport::new());
    let busy = MotorNode::open(&driver, minor).unwrap();
    let signal = Signal::new();
    let waiter = MotorNode::open_with_signal(&driver, minor, signal.clone()).unwrap();
    let instance = Arc::clone(waiter.instance().unwrap());

    // Park a write inside the transport so it keeps the instance lock.
    mock.hold_submissions();
    let writer = thread::spawn(move || busy.write(&[7]).map(|_| ()));
    let deadline = Instant::now() + Duration::from_secs(5);
    while mock.parked_submissions() == 0 {
        assert!(Instant::now() < deadline, "write never reached the transport");
        thread::sleep(Duration::from_millis(1));
    }

    signal.raise();
    let err = waiter.write(&[1]).unwrap_err();
    assert!(matches!(err, MotorError::Interrupted));
    assert_eq!(err.errno(), -512);
    assert!(matches!(
        driver.open(minor, &signal),
        Err(MotorError::Interrupted)
    ));
    assert!(matches!(
        driver.release(&instance, &signal),
        Err(MotorError::Interrupted)
    ));

    mock.resume_submissions();
    writer.join().unwrap().unwrap();
    signal.clear();

    // The interrupted calls changed nothing: only `waiter` is still open.
    assert_eq!(instance.open_count(), 1);
    assert_eq!(mock.submitted_commands(), vec![TiltCommand::from(7)]);
    waiter.release().unwrap();
    assert_eq!(instance.open_count(), 0);
}

// ── Detach ──

#[test]
fn detach_while_open_defers_teardown_to_release() {
    let driver = driver();
    let (mock, minor) = attach(&driver, MockTransport::new());
    let node = MotorNode::open(&driver, minor).unwrap();
    let instance = Arc::clone(node.instance().unwrap());

    assert!(driver.detach(minor));
    assert!(!instance.is_attached());
    assert!(!instance.is_torn_down());
    assert!(matches!(
        driver.open(minor, &Signal::new()),
        Err(MotorError::NotFound(_))
    ));

    let err = node.write(&[5]).unwrap_err();
    assert!(matches!(err, MotorError::NotAttached));
    assert_eq!(err.errno(), -19);
    assert!(mock.submitted_commands().is_empty());

    node.release().unwrap();
    assert!(instance.is_torn_down());
}

#[test]
fn teardown_runs_once_with_two_handles() {
    let driver = driver();
    let (_mock, minor) = attach(&driver, MockTransport::new());
    let a = MotorNode::open(&driver, minor).unwrap();
    let b = MotorNode::open(&driver, minor).unwrap();
    let instance = Arc::clone(a.instance().unwrap());

    driver.detach(minor);
    a.release().unwrap();
    assert!(!instance.is_torn_down(), "one handle still open");
    b.release().unwrap();
    assert!(instance.is_torn_down());
}

#[test]
fn detach_while_closed_cancels_then_destroys() {
    let driver = driver();
    let (mock, minor) = attach(&driver, MockTransport::with_limit_endpoint(LIMIT_EP));
    let instance = driver.instances().pop().unwrap();
    assert!(mock.interrupt_pending());

    driver.detach(minor);
    let cancels = mock.cancels.lock().unwrap().clone();
    assert_eq!(cancels[0], TransferKind::Interrupt);
    assert!(cancels.contains(&TransferKind::Control));
    assert!(instance.is_torn_down());
    assert!(!mock.interrupt_pending());
    assert!(driver.instances().is_empty());
}

#[test]
fn physical_unplug_then_detach() {
    let driver = driver();
    let (mock, minor) = attach(&driver, MockTransport::with_limit_endpoint(LIMIT_EP));
    let node = MotorNode::open(&driver, minor).unwrap();
    node.write(&[20]).unwrap();

    mock.unplug();
    let instance = Arc::clone(node.instance().unwrap());
    instance.sync_completions();
    assert_eq!(instance.feedback_state(), FeedbackState::Idle);

    driver.detach(minor);
    assert!(matches!(node.write(&[1]), Err(MotorError::NotAttached)));
    drop(node);
    assert!(instance.is_torn_down());
}

// ── Attach failures ──

#[test]
fn bad_status_byte_registers_nothing() {
    let driver = driver();
    let mock = Arc::new(MockTransport::new());
    mock.set_status_reply(vec![0x33, 0, 0, 0, 0, 0, 0, 0]);

    let err = driver.attach(Arc::clone(&mock)).unwrap_err();
    assert!(matches!(err, MotorError::UnexpectedDeviceResponse(_)));
    assert!(driver.instances().is_empty());
    assert!(matches!(
        driver.open(MINOR_BASE, &Signal::new()),
        Err(MotorError::NotFound(_))
    ));
    assert!(mock.sync_out.lock().unwrap().is_empty());
}

#[test]
fn init_timeout_fails_attach() {
    let driver = driver();
    let mock = MockTransport::new();
    *mock.fail_control_in.lock().unwrap() = Some(TransportError::TimedOut);
    let err = driver.attach(Arc::new(mock)).unwrap_err();
    assert!(err.is_init_failure());
    assert!(driver.instances().is_empty());
}

// ── Feedback ──

#[test]
fn limit_report_triggers_exactly_one_correction() {
    let driver = driver();
    let (mock, minor) = attach(&driver, MockTransport::with_limit_endpoint(LIMIT_EP));
    let node = MotorNode::open(&driver, minor).unwrap();
    let instance = Arc::clone(node.instance().unwrap());

    node.write(&[30]).unwrap();
    assert!(mock.deliver_interrupt(&[AXIS_TILT, 0]));
    instance.sync_completions();

    assert_eq!(
        mock.submitted_commands(),
        vec![TiltCommand::from(30), TiltCommand::STOP]
    );
    assert_eq!(instance.current_command(), TiltCommand::STOP);
    assert!(mock.interrupt_pending(), "polling continues");
}

#[test]
fn non_matching_limit_report_sends_nothing() {
    let driver = driver();
    let (mock, minor) = attach(&driver, MockTransport::with_limit_endpoint(LIMIT_EP));
    let node = MotorNode::open(&driver, minor).unwrap();
    let instance = Arc::clone(node.instance().unwrap());

    node.write(&[30]).unwrap();
    assert!(mock.deliver_interrupt(&[0, AXIS_TILT]));
    instance.sync_completions();

    assert_eq!(mock.submitted_commands(), vec![TiltCommand::from(30)]);
    assert_eq!(instance.feedback_state(), FeedbackState::Running);
}

#[test]
fn feedback_disabled_by_options() {
    let driver = MotorDriver::new(DriverOptions {
        feedback: false,
        init_timeout: Duration::from_millis(50),
        ..DriverOptions::default()
    });
    let (mock, _minor) = attach(&driver, MockTransport::with_limit_endpoint(LIMIT_EP));
    assert!(!mock.interrupt_pending());
    assert_eq!(driver.instances()[0].feedback_state(), FeedbackState::Idle);
}
