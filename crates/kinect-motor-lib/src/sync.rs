//! Locking primitives shared by the caller and completion contexts.
//!
//! - [`InstanceLock`]: the per-instance exclusive lock. Only caller context
//!   takes it; acquisition can be aborted through a [`Signal`].
//! - [`SpinLock`]: guards the one field the completion worker shares with
//!   callers. Critical sections are a handful of loads and stores and never
//!   include a transfer submission.
//! - [`lock`]: poison-tolerant `std::sync::Mutex` acquire for the
//!   process-wide open/detach lock and the registry.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{MotorError, Result};

/// How often a blocked interruptible waiter re-checks its signal.
const SIGNAL_POLL: Duration = Duration::from_millis(5);

/// Acquire a std mutex, recovering the data if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Signal ──

/// Interruption token for a caller-context wait (the userspace stand-in for a
/// pending signal). Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct Signal(Arc<AtomicBool>);

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt any wait currently using this signal, and future ones until
    /// [`clear`](Self::clear) is called.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── SpinLock ──

/// A spin-based mutual exclusion lock (test-and-test-and-set).
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: The SpinLock ensures exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from different threads.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard { lock: self };
            }
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }
}

/// RAII guard that releases the [`SpinLock`] when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ── InstanceLock ──

/// Binary semaphore with an interruptible acquire.
///
/// Unlike `std::sync::Mutex`, a waiter can give up when its [`Signal`] is
/// raised. An uncontended acquire always succeeds, even with a raised
/// signal; only a wait can be interrupted.
pub struct InstanceLock<T> {
    locked: Mutex<bool>,
    released: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: `locked` serializes every access to `data`; a guard exists only
// while `locked` is true and is the sole path to the data.
unsafe impl<T: Send> Send for InstanceLock<T> {}
unsafe impl<T: Send> Sync for InstanceLock<T> {}

impl<T> InstanceLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            locked: Mutex::new(false),
            released: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire without the possibility of interruption.
    pub fn lock(&self) -> InstanceGuard<'_, T> {
        let mut locked = lock(&self.locked);
        while *locked {
            locked = self
                .released
                .wait(locked)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *locked = true;
        InstanceGuard { lock: self }
    }

    /// Acquire, giving up with [`MotorError::Interrupted`] if `signal` is
    /// raised while waiting.
    pub fn lock_interruptible(&self, signal: &Signal) -> Result<InstanceGuard<'_, T>> {
        let mut locked = lock(&self.locked);
        while *locked {
            if signal.is_raised() {
                return Err(MotorError::Interrupted);
            }
            locked = self
                .released
                .wait_timeout(locked, SIGNAL_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *locked = true;
        Ok(InstanceGuard { lock: self })
    }
}

/// RAII guard for [`InstanceLock`].
pub struct InstanceGuard<'a, T> {
    lock: &'a InstanceLock<T>,
}

impl<T> Deref for InstanceGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for InstanceGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for InstanceGuard<'_, T> {
    fn drop(&mut self) {
        *lock(&self.lock.locked) = false;
        self.lock.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn spinlock_mutate_through_guard() {
        let lock = SpinLock::new(0);
        {
            let mut guard = lock.lock();
            *guard = 99;
        }
        assert_eq!(*lock.lock(), 99);
    }

    #[test]
    fn spinlock_contended_increments() {
        let lock = Arc::new(SpinLock::new(0u32));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn instance_lock_uncontended_ignores_signal() {
        let lock = InstanceLock::new(1);
        let signal = Signal::new();
        signal.raise();
        let guard = lock.lock_interruptible(&signal).unwrap();
        assert_eq!(*guard, 1);
    }

    #[test]
    fn instance_lock_wait_is_interrupted() {
        let lock = InstanceLock::new(());
        let signal = Signal::new();
        let _held = lock.lock();
        signal.raise();
        assert!(matches!(
            lock.lock_interruptible(&signal),
            Err(MotorError::Interrupted)
        ));
    }

    #[test]
    fn instance_lock_interrupt_from_other_thread() {
        let lock = Arc::new(InstanceLock::new(()));
        let signal = Signal::new();
        let held = lock.lock();

        let waiter = {
            let lock = Arc::clone(&lock);
            let signal = signal.clone();
            thread::spawn(move || lock.lock_interruptible(&signal).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        signal.raise();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(MotorError::Interrupted)));
        drop(held);
    }

    #[test]
    fn instance_lock_handoff_wakes_waiter() {
        let lock = Arc::new(InstanceLock::new(0));
        let held = lock.lock();
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let mut guard = lock.lock_interruptible(&Signal::new()).unwrap();
                *guard += 1;
            })
        };
        thread::sleep(Duration::from_millis(10));
        drop(held);
        waiter.join().unwrap();
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn signal_clear() {
        let signal = Signal::new();
        let clone = signal.clone();
        clone.raise();
        assert!(signal.is_raised());
        signal.clear();
        assert!(!clone.is_raised());
    }
}
