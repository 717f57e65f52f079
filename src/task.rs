//! Runs one long external job at a time off the interactive thread.
//!
//! The interactive side polls a [`TaskHandle`] with [`TaskHandle::tick`]
//! and renders the latest [`ProgressSnapshot`]; results only reach it as a
//! [`TaskOutcome`], never as a raw error.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::error::{Result, VaultError};
use crate::progress::{ProgressEvent, ProgressSnapshot};
use crate::util::command::CancelToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<T> {
    Succeeded(T),
    Failed(String),
    Cancelled,
}

impl<T> TaskOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled)
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            TaskOutcome::Succeeded(value) => Ok(value),
            TaskOutcome::Failed(msg) => Err(VaultError::message(msg)),
            TaskOutcome::Cancelled => Err(VaultError::Cancelled),
        }
    }
}

#[derive(Debug)]
pub enum Tick<T> {
    Running {
        elapsed: Duration,
        snapshot: ProgressSnapshot,
    },
    Finished(TaskOutcome<T>),
}

/// What a running job sees of the runner.
#[derive(Debug, Clone)]
pub struct TaskContext {
    cancel: CancelToken,
    progress: Sender<ProgressEvent>,
}

impl TaskContext {
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }

    pub fn report(&self, event: ProgressEvent) {
        // The handle may already be gone; progress is best effort.
        let _ = self.progress.send(event);
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = unbounded();
        (
            Self {
                cancel: CancelToken::new(),
                progress: tx,
            },
            rx,
        )
    }
}

/// Frees the task slot when the worker ends, however it ends.
struct SlotGuard {
    slot: Arc<Mutex<Option<String>>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

/// Proof that the caller holds the task slot.
#[must_use]
pub struct TaskClaim {
    _guard: SlotGuard,
}

/// Single task slot. A second `spawn` while a job runs fails with `Busy`.
#[derive(Debug, Clone, Default)]
pub struct TaskRunner {
    slot: Arc<Mutex<Option<String>>>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the running job, if any.
    pub fn current(&self) -> Option<String> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.current().is_some()
    }

    fn occupy(&self, name: &str) -> Result<SlotGuard> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| VaultError::message("task slot poisoned"))?;
        if let Some(running) = slot.as_ref() {
            debug!("refusing {}: {} is running", name, running);
            return Err(VaultError::Busy);
        }
        *slot = Some(name.to_string());
        Ok(SlotGuard {
            slot: Arc::clone(&self.slot),
        })
    }

    /// Takes the slot for short work done on the calling thread, so nothing
    /// can be spawned meanwhile. The slot is free again when the claim drops.
    pub fn claim(&self, name: &str) -> Result<TaskClaim> {
        let guard = self.occupy(name)?;
        Ok(TaskClaim { _guard: guard })
    }

    pub fn spawn<T, F>(&self, name: &str, job: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        let guard = self.occupy(name)?;

        let cancel = CancelToken::new();
        let (progress_tx, progress_rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        let ctx = TaskContext {
            cancel: cancel.clone(),
            progress: progress_tx,
        };
        let task_name = name.to_string();
        info!("starting {}", task_name);
        let spawned = thread::Builder::new()
            .name(format!("task-{}", task_name))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| job(&ctx)));
                let outcome = match result {
                    Ok(Ok(value)) => TaskOutcome::Succeeded(value),
                    Ok(Err(err)) if err.is_cancelled() || ctx.is_cancelled() => {
                        info!("{} cancelled", task_name);
                        TaskOutcome::Cancelled
                    }
                    Ok(Err(err)) => {
                        warn!("{} failed: {}", task_name, err);
                        TaskOutcome::Failed(err.to_string())
                    }
                    Err(_) => TaskOutcome::Failed(format!("{} panicked", task_name)),
                };
                drop(guard);
                let _ = done_tx.send(outcome);
            });
        if let Err(err) = spawned {
            if let Ok(mut slot) = self.slot.lock() {
                *slot = None;
            }
            return Err(VaultError::Io(err));
        }

        Ok(TaskHandle {
            name: name.to_string(),
            cancel,
            progress: progress_rx,
            done: done_rx,
            snapshot: ProgressSnapshot::default(),
            started: Instant::now(),
        })
    }
}

pub struct TaskHandle<T> {
    name: String,
    cancel: CancelToken,
    progress: Receiver<ProgressEvent>,
    done: Receiver<TaskOutcome<T>>,
    snapshot: ProgressSnapshot,
    started: Instant,
}

impl<T> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kills the live subprocess of the job, if any.
    pub fn cancel(&self) {
        info!("cancel requested for {}", self.name);
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    fn drain(&mut self) {
        while let Ok(event) = self.progress.try_recv() {
            self.snapshot.apply(event);
        }
    }

    /// Waits up to `interval` for the job. Reports `Finished` exactly once.
    pub fn tick(&mut self, interval: Duration) -> Tick<T> {
        let received = self.done.recv_timeout(interval);
        self.drain();
        match received {
            Ok(outcome) => Tick::Finished(outcome),
            Err(RecvTimeoutError::Timeout) => Tick::Running {
                elapsed: self.elapsed(),
                snapshot: self.snapshot.clone(),
            },
            Err(RecvTimeoutError::Disconnected) => {
                Tick::Finished(TaskOutcome::Failed(format!("{} already finished", self.name)))
            }
        }
    }

    pub fn wait(mut self) -> TaskOutcome<T> {
        let outcome = self
            .done
            .recv()
            .unwrap_or_else(|_| TaskOutcome::Failed(format!("{} vanished", self.name)));
        self.drain();
        outcome
    }
}
