#![forbid(unsafe_code)]

//! Dispatch executors: where observer callbacks actually run.
//!
//! Observers never run on the platform callback thread that reported a
//! change. Each registration names an [`Executor`], and the observable hands
//! it one boxed task per delivery.
//!
//! | Executor | Runs tasks on | Typical use |
//! |----------|---------------|-------------|
//! | [`DirectExecutor`] | the notifying thread | tests, already-serialized callers |
//! | [`QueueExecutor`] | whoever calls `run_pending()` | a UI loop that drains posted work |
//! | [`SerialExecutor`] | one dedicated worker thread | background delivery |
//!
//! # Ordering
//!
//! All three executors are FIFO. Because each registration has exactly one
//! executor, an observer sees notifications in `notify_change` call order.

use std::collections::VecDeque;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::config::DispatchConfig;
use crate::error::ObserveError;

/// A unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Accepts tasks and runs them on a caller-chosen thread.
pub trait Executor: Send + Sync {
    /// Schedule `task`. Must not block on the task's completion.
    fn execute(&self, task: Task);
}

/// Runs each task immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExecutor;

impl DirectExecutor {
    /// Shared handle, ready to pass to `add_observer`.
    #[must_use]
    pub fn shared() -> Arc<dyn Executor> {
        Arc::new(Self)
    }
}

impl Executor for DirectExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

/// FIFO queue drained explicitly by its owner.
///
/// Models "post to the main thread": tasks pile up until the owning loop
/// calls [`QueueExecutor::run_pending`].
#[derive(Default)]
pub struct QueueExecutor {
    queue: Mutex<VecDeque<Task>>,
}

impl QueueExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Run queued tasks until the queue is empty, including tasks enqueued by
    /// the tasks themselves. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // Pop under the lock, run outside it so tasks may post more work.
            let next = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl std::fmt::Debug for QueueExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueExecutor")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Executor for QueueExecutor {
    fn execute(&self, task: Task) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
    }
}

enum WorkerMsg {
    Run(Task),
    Shutdown,
}

/// Runs tasks in submission order on a dedicated worker thread.
///
/// The channel is unbounded so that `execute` never blocks a platform
/// callback thread. A backlog above [`DispatchConfig::backlog_warning`] is
/// logged once per crossing. A task that panics is logged and skipped; the
/// worker keeps running.
pub struct SerialExecutor {
    sender: Mutex<Option<mpsc::Sender<WorkerMsg>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    backlog_warning: usize,
    over_backlog: AtomicBool,
    name: String,
}

impl SerialExecutor {
    /// Spawn the worker thread described by `config`.
    pub fn start(config: &DispatchConfig) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<WorkerMsg>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);

        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || worker_loop(rx, worker_pending))?;

        debug!(thread = %config.thread_name, "serial executor started");
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            pending,
            backlog_warning: config.backlog_warning.max(1),
            over_backlog: AtomicBool::new(false),
            name: config.thread_name.clone(),
        })
    }

    /// Tasks submitted but not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Block until every task submitted before this call has run.
    pub fn flush(&self) -> Result<(), ObserveError> {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        self.submit(Box::new(move || {
            let _ = done_tx.send(());
        }))?;
        done_rx.recv().map_err(|_| ObserveError::ExecutorClosed)
    }

    /// Stop accepting tasks, let queued tasks finish, and join the worker.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(WorkerMsg::Shutdown);
        }
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // The last handle can be dropped by one of our own tasks.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
            debug!(thread = %self.name, "serial executor stopped");
        }
    }

    fn submit(&self, task: Task) -> Result<(), ObserveError> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(ObserveError::ExecutorClosed);
        };
        let depth = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if sender.send(WorkerMsg::Run(task)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(ObserveError::ExecutorClosed);
        }
        if depth > self.backlog_warning {
            if !self.over_backlog.swap(true, Ordering::AcqRel) {
                warn!(
                    thread = %self.name,
                    depth,
                    threshold = self.backlog_warning,
                    "dispatch backlog above threshold"
                );
            }
        } else {
            self.over_backlog.store(false, Ordering::Release);
        }
        Ok(())
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, task: Task) {
        if self.submit(task).is_err() {
            warn!(thread = %self.name, "task dropped: serial executor is shut down");
        }
    }
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: mpsc::Receiver<WorkerMsg>, pending: Arc<AtomicUsize>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Run(task) => {
                // A panicking observer must not take delivery down for every
                // other observer sharing this thread.
                if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                        (*s).to_string()
                    } else if let Some(s) = payload.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    error!(panic = %msg, "observer task panicked");
                }
                pending.fetch_sub(1, Ordering::AcqRel);
            }
            WorkerMsg::Shutdown => return,
        }
    }
}
