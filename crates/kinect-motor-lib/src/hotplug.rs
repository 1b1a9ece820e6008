//! Hotplug polling with exponential backoff for failed attaches.
//!
//! The watcher rescans the bus on every [`poll`](HotplugWatcher::poll),
//! diffs the result against what it attached last time, and drives
//! [`MotorDriver::attach`]/[`MotorDriver::detach`] accordingly. A unit whose
//! handshake keeps failing is retried on a backoff schedule instead of on
//! every scan.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::driver::MotorDriver;
use crate::protocol::node_name;
use crate::transport::{TransportError, UsbTransport};

// ── Backoff ──

/// Configuration for retry backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failure (typically 2.0).
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Retry state machine with exponential backoff.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current_delay: Duration,
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            config,
            last_attempt: None,
            consecutive_failures: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BackoffConfig::default())
    }

    /// Returns `true` if no attempt has failed yet, or if the backoff delay
    /// has elapsed since the last failure.
    pub fn should_attempt(&self) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => last.elapsed() >= self.current_delay,
        }
    }

    /// Record a failed attempt and advance the backoff.
    pub fn record_failure(&mut self) {
        if self.last_attempt.is_some() {
            // current_delay *= multiplier, capped at max_delay
            let next = self.current_delay.as_secs_f64() * self.config.multiplier;
            self.current_delay = Duration::from_secs_f64(next).min(self.config.max_delay);
        }
        self.consecutive_failures += 1;
        self.last_attempt = Some(Instant::now());
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_delay = self.config.initial_delay;
        self.last_attempt = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay that must pass after the last failure before the next attempt.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

// ── Device source ──

/// Bus location of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceAddress {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}/{:03}", self.bus, self.address)
    }
}

/// A matching unit seen on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub address: DeviceAddress,
    pub serial: Option<String>,
}

/// Something that can enumerate motor units and open a transport to one.
pub trait DeviceSource {
    type Transport: UsbTransport;

    fn scan(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    fn open(&self, device: &DeviceInfo) -> Result<Arc<Self::Transport>, TransportError>;
}

// ── Watcher ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HotplugEvent {
    Attached { address: DeviceAddress, minor: u32 },
    Detached { address: DeviceAddress, minor: u32 },
    AttachFailed { address: DeviceAddress, error: String },
}

impl fmt::Display for HotplugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HotplugEvent::Attached { address, minor } => {
                write!(f, "{address} attached as {}", node_name(*minor))
            }
            HotplugEvent::Detached { address, minor } => {
                write!(f, "{address} ({}) detached", node_name(*minor))
            }
            HotplugEvent::AttachFailed { address, error } => {
                write!(f, "{address} attach failed: {error}")
            }
        }
    }
}

pub struct HotplugWatcher<S: DeviceSource> {
    source: S,
    serial: Option<String>,
    backoff: BackoffConfig,
    attached: BTreeMap<DeviceAddress, u32>,
    failing: HashMap<DeviceAddress, Backoff>,
}

impl<S: DeviceSource> HotplugWatcher<S> {
    /// Watch `source`. A non-empty `serial` restricts the watcher to that
    /// one unit.
    pub fn new(source: S, serial: &str) -> Self {
        Self {
            source,
            serial: (!serial.is_empty()).then(|| serial.to_string()),
            backoff: BackoffConfig::default(),
            attached: BTreeMap::new(),
            failing: HashMap::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Units currently attached through this watcher, with their minors.
    pub fn attached(&self) -> impl Iterator<Item = (DeviceAddress, u32)> + '_ {
        self.attached.iter().map(|(a, m)| (*a, *m))
    }

    /// Rescan and reconcile. Returns what changed.
    pub fn poll(&mut self, driver: &MotorDriver<S::Transport>) -> Vec<HotplugEvent> {
        let present: Vec<DeviceInfo> = match self.source.scan() {
            Ok(devices) => devices
                .into_iter()
                .filter(|d| match &self.serial {
                    Some(want) => d.serial.as_deref() == Some(want.as_str()),
                    None => true,
                })
                .collect(),
            Err(e) => {
                log::warn!("bus scan failed: {e}");
                return Vec::new();
            }
        };

        let mut events = Vec::new();

        let gone: Vec<DeviceAddress> = self
            .attached
            .keys()
            .filter(|a| !present.iter().any(|d| d.address == **a))
            .copied()
            .collect();
        for address in gone {
            if let Some(minor) = self.attached.remove(&address) {
                driver.detach(minor);
                events.push(HotplugEvent::Detached { address, minor });
            }
        }
        self.failing
            .retain(|a, _| present.iter().any(|d| d.address == *a));

        for device in &present {
            if self.attached.contains_key(&device.address) {
                continue;
            }
            let backoff = self
                .failing
                .entry(device.address)
                .or_insert_with(|| Backoff::new(self.backoff.clone()));
            if !backoff.should_attempt() {
                continue;
            }

            let result = self
                .source
                .open(device)
                .map_err(|e| e.to_string())
                .and_then(|transport| driver.attach(transport).map_err(|e| e.to_string()));
            match result {
                Ok(minor) => {
                    backoff.record_success();
                    self.failing.remove(&device.address);
                    self.attached.insert(device.address, minor);
                    events.push(HotplugEvent::Attached {
                        address: device.address,
                        minor,
                    });
                }
                Err(error) => {
                    backoff.record_failure();
                    log::warn!(
                        "attach of {} failed: {error} (attempt {}, retry in {:.1}s)",
                        device.address,
                        backoff.consecutive_failures(),
                        backoff.current_delay().as_secs_f64()
                    );
                    events.push(HotplugEvent::AttachFailed {
                        address: device.address,
                        error,
                    });
                }
            }
        }
        events
    }

    /// Poll every `interval` until `running` goes false, then detach
    /// everything this watcher attached.
    pub fn run(
        &mut self,
        driver: &MotorDriver<S::Transport>,
        interval: Duration,
        running: &AtomicBool,
        mut on_event: impl FnMut(&HotplugEvent),
    ) {
        const TICK: Duration = Duration::from_millis(50);
        while running.load(Ordering::SeqCst) {
            for event in self.poll(driver) {
                on_event(&event);
            }
            let mut waited = Duration::ZERO;
            while waited < interval && running.load(Ordering::SeqCst) {
                let step = TICK.min(interval - waited);
                std::thread::sleep(step);
                waited += step;
            }
        }
        for (address, minor) in std::mem::take(&mut self.attached) {
            driver.detach(minor);
            on_event(&HotplugEvent::Detached { address, minor });
        }
    }
}
