//! Device command queues.
//!
//! Every device owns one queue. The registry submits memory commands to it
//! and gets back a [`Completion`] token; nothing in the registry blocks on a
//! transfer while it holds its table lock.
//!
//! # Queue Types
//!
//! - [`HostQueue`]: runs commands inline on the submitting thread (device 0).
//! - [`WorkerQueue`]: runs commands in FIFO order on a dedicated thread, which
//!   makes accelerator transfers asynchronous with respect to the caller.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{DeviceTransferFailureSnafu, Result};
use crate::memory::DeviceMemory;
use crate::sync::{QueueSignal, TimelineSignal};

/// A unit of work for a device queue.
#[derive(Debug)]
pub enum Command {
    /// Copy all of `src` into `dst` once `after` has completed.
    Copy { src: Arc<DeviceMemory>, dst: Arc<DeviceMemory>, after: Completion },
    /// Drop a memory record after all previously submitted work.
    Free { memory: Arc<DeviceMemory> },
}

impl Command {
    /// Run the command on the calling thread.
    pub fn execute(self) -> Result<()> {
        match self {
            Command::Copy { src, dst, after } => {
                after.wait()?;
                let bytes = src.len();
                dst.copy_from(&src).map_err(|reason| DeviceTransferFailureSnafu { reason }.build())?;
                tracing::trace!(from = src.device(), to = dst.device(), bytes, "copy executed");
                Ok(())
            }
            Command::Free { memory } => {
                drop(memory);
                Ok(())
            }
        }
    }
}

/// Synchronization token for a submitted command.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    signal: Option<Arc<QueueSignal>>,
    value: u64,
}

impl Completion {
    /// A token that is already complete.
    pub fn ready() -> Self {
        Self::default()
    }

    /// Token completing when `signal` reaches `value`.
    pub fn pending(signal: Arc<QueueSignal>, value: u64) -> Self {
        Self { signal: Some(signal), value }
    }

    /// Whether the command finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        self.signal.as_ref().is_none_or(|signal| signal.is_reached(self.value))
    }

    /// Whether the command finished without a fault.
    pub fn succeeded(&self) -> bool {
        self.signal.as_ref().is_none_or(|signal| signal.is_reached(self.value) && !signal.is_faulted(self.value))
    }

    /// Whether the command finished and reported a fault.
    pub fn failed(&self) -> bool {
        self.signal.as_ref().is_some_and(|signal| signal.is_reached(self.value) && signal.is_faulted(self.value))
    }

    /// Block until the command finished; reports a failed transfer.
    pub fn wait(&self) -> Result<()> {
        match &self.signal {
            Some(signal) => signal.wait(self.value, 0),
            None => Ok(()),
        }
    }

    /// Like [`wait`](Self::wait) with a deadline in milliseconds.
    pub fn wait_timeout(&self, timeout_ms: u64) -> Result<()> {
        match &self.signal {
            Some(signal) => signal.wait(self.value, timeout_ms.max(1)),
            None => Ok(()),
        }
    }
}

/// Command queue of one device.
pub trait DeviceQueue: Send + Sync + std::fmt::Debug {
    /// Index of the device this queue belongs to.
    fn device(&self) -> usize;

    /// Enqueue a command. Commands run in submission order.
    ///
    /// Must not block on the command unless [`runs_inline`](Self::runs_inline) is set.
    fn submit(&self, command: Command) -> Result<Completion>;

    /// Whether `submit` runs the command on the calling thread before returning.
    ///
    /// The registry never submits to such a queue while holding its table lock.
    fn runs_inline(&self) -> bool {
        false
    }

    /// Wait for every submitted command to finish.
    fn synchronize(&self) -> Result<()>;
}

/// Queue that executes commands inline.
#[derive(Debug)]
pub struct HostQueue {
    device: usize,
}

impl HostQueue {
    pub fn new(device: usize) -> Self {
        Self { device }
    }
}

impl DeviceQueue for HostQueue {
    fn device(&self) -> usize {
        self.device
    }

    fn submit(&self, command: Command) -> Result<Completion> {
        command.execute()?;
        Ok(Completion::ready())
    }

    fn runs_inline(&self) -> bool {
        true
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

/// Queue backed by a worker thread.
pub struct WorkerQueue {
    device: usize,
    sender: Option<Sender<(u64, Command)>>,
    signal: Arc<QueueSignal>,
    /// Last assigned timeline value; held while sending so values reach the worker in order.
    submitted: Mutex<u64>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerQueue")
            .field("device", &self.device)
            .field("submitted", &*self.submitted.lock())
            .field("completed", &self.signal.value())
            .finish()
    }
}

impl WorkerQueue {
    pub fn new(device: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let signal = Arc::new(QueueSignal::new());
        let worker_signal = Arc::clone(&signal);
        let worker = std::thread::Builder::new()
            .name(format!("tessel-queue-{device}"))
            .spawn(move || Self::run(device, receiver, worker_signal))
            .ok();

        if worker.is_none() {
            tracing::warn!(device, "failed to spawn queue worker, commands will fail");
        }

        Self { device, sender: worker.as_ref().map(|_| sender), signal, submitted: Mutex::new(0), worker }
    }

    fn run(device: usize, receiver: Receiver<(u64, Command)>, signal: Arc<QueueSignal>) {
        for (value, command) in receiver {
            match command.execute() {
                Ok(()) => signal.set(value),
                Err(e) => {
                    tracing::error!(device, value, error = %e, "queue command failed");
                    signal.fail(value, e.to_string());
                }
            }
        }
        tracing::trace!(device, "queue worker exiting");
    }

    /// The queue's timeline signal.
    pub fn signal(&self) -> &Arc<QueueSignal> {
        &self.signal
    }
}

impl DeviceQueue for WorkerQueue {
    fn device(&self) -> usize {
        self.device
    }

    fn submit(&self, command: Command) -> Result<Completion> {
        let Some(sender) = self.sender.as_ref() else {
            return DeviceTransferFailureSnafu { reason: format!("queue of device {} has no worker", self.device) }.fail();
        };

        let mut submitted = self.submitted.lock();
        let value = *submitted + 1;
        sender
            .send((value, command))
            .map_err(|_| DeviceTransferFailureSnafu { reason: format!("queue of device {} is shut down", self.device) }.build())?;
        *submitted = value;
        Ok(Completion::pending(Arc::clone(&self.signal), value))
    }

    fn synchronize(&self) -> Result<()> {
        let target = *self.submitted.lock();
        self.signal.wait(target, 0)
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain pending commands and exit
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!(device = self.device, "queue worker panicked");
        }
    }
}
