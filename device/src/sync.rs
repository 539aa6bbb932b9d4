//! Timeline synchronization for device queues.
//!
//! A queue numbers the commands it accepts; its timeline signal advances to a
//! command's number once that command has finished. Waiting for a value is
//! how the registry, views, and dependent copies order themselves behind
//! in-flight transfers.
//!
//! # Example
//!
//! ```ignore
//! let signal = QueueSignal::new();
//!
//! // Queue worker
//! signal.set(1);
//!
//! // Consumer
//! signal.wait(1, 0)?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{DeviceTransferFailureSnafu, Result, TimeoutSnafu};

/// Monotonic timeline signal.
///
/// The signal value only increases; waiters block until it reaches or exceeds
/// their target.
pub trait TimelineSignal: Send + Sync + std::fmt::Debug {
    /// Get the current signal value.
    fn value(&self) -> u64;

    /// Advance the signal to `value`. Lower values are ignored.
    fn set(&self, value: u64);

    /// Wait for the signal to reach or exceed `value`.
    ///
    /// `timeout_ms == 0` waits without a deadline.
    fn wait(&self, value: u64, timeout_ms: u64) -> Result<()>;

    /// Check if the signal has reached `value` without blocking.
    fn is_reached(&self, value: u64) -> bool {
        self.value() >= value
    }
}

#[derive(Debug, Clone)]
struct Fault {
    value: u64,
    reason: String,
}

/// Timeline signal of a host-side queue.
///
/// A failed command is recorded as a sticky fault: every wait for a value at or
/// past the failed one reports [`Error::DeviceTransferFailure`](crate::Error::DeviceTransferFailure).
#[derive(Debug)]
pub struct QueueSignal {
    value: AtomicU64,
    fault: Mutex<Option<Fault>>,
    condvar: Condvar,
}

impl Default for QueueSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueSignal {
    /// Create a new signal starting at 0.
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0), fault: Mutex::new(None), condvar: Condvar::new() }
    }

    /// Mark `value` as failed and complete it, waking every waiter.
    pub fn fail(&self, value: u64, reason: impl Into<String>) {
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(Fault { value, reason: reason.into() });
            }
        }
        self.set(value);
    }

    /// Whether waiting for `value` reports the recorded fault.
    pub fn is_faulted(&self, value: u64) -> bool {
        self.fault.lock().as_ref().is_some_and(|fault| fault.value <= value)
    }

    /// Reason of the first failed command, if any.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().as_ref().map(|fault| fault.reason.clone())
    }

    fn check_fault(fault: &Option<Fault>, target: u64) -> Result<()> {
        match fault {
            Some(fault) if fault.value <= target => DeviceTransferFailureSnafu { reason: fault.reason.clone() }.fail(),
            _ => Ok(()),
        }
    }
}

impl TimelineSignal for QueueSignal {
    fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn set(&self, value: u64) {
        // Hold the lock so a waiter between its check and its park cannot miss the wakeup
        let _guard = self.fault.lock();
        self.value.fetch_max(value, Ordering::AcqRel);
        self.condvar.notify_all();
    }

    fn wait(&self, target: u64, timeout_ms: u64) -> Result<()> {
        let mut guard = self.fault.lock();
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));

        while self.value.load(Ordering::Acquire) < target {
            match deadline {
                None => self.condvar.wait(&mut guard),
                Some(deadline) => {
                    if self.condvar.wait_until(&mut guard, deadline).timed_out()
                        && self.value.load(Ordering::Acquire) < target
                    {
                        return TimeoutSnafu {
                            waited_ms: timeout_ms,
                            target,
                            current: self.value.load(Ordering::Acquire),
                        }
                        .fail();
                    }
                }
            }
        }

        Self::check_fault(&guard, target)
    }
}
