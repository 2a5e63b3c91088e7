#![forbid(unsafe_code)]

//! In-memory app-ops service.
//!
//! `set_mode` suppresses no-op changes the way the platform does: setting a
//! package's mode to its current value fires nothing. `force_notify` fires
//! regardless, for tests of this layer's own (non-)suppression.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use prefbind_core::ObserveError;
use prefbind_platform::{AppOpsService, OpChangedListener, OpMode};
use tracing::trace;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct MemoryAppOps {
    modes: Mutex<HashMap<(i32, String), OpMode>>,
    listeners: Mutex<Vec<(i32, Arc<dyn OpChangedListener>)>>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    fail_next: AtomicBool,
}

impl std::fmt::Debug for MemoryAppOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAppOps")
            .field("start_calls", &self.start_calls())
            .field("stop_calls", &self.stop_calls())
            .field("active_listeners", &self.active_listeners())
            .finish()
    }
}

impl MemoryAppOps {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the mode of `op` for `package`. Listeners fire only if the mode
    /// actually changed; returns whether they did.
    pub fn set_mode(&self, op: i32, package: &str, mode: OpMode) -> bool {
        let previous = lock(&self.modes).insert((op, package.to_owned()), mode);
        if previous.unwrap_or_default() == mode {
            trace!(op, package, ?mode, "mode unchanged; suppressed");
            return false;
        }
        self.force_notify(op, package);
        true
    }

    /// Fire listeners of `op` without changing any mode.
    pub fn force_notify(&self, op: i32, package: &str) {
        let listeners: Vec<_> = lock(&self.listeners)
            .iter()
            .filter(|(watched, _)| *watched == op)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener.on_op_changed(op, package);
        }
    }

    /// Make the next `start_watching_mode` call fail.
    pub fn fail_next_start(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn active_listeners(&self) -> usize {
        lock(&self.listeners).len()
    }
}

impl AppOpsService for MemoryAppOps {
    fn start_watching_mode(
        &self,
        op: i32,
        listener: Arc<dyn OpChangedListener>,
    ) -> Result<(), ObserveError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ObserveError::upstream(format!("app-op {op}"), "watch refused"));
        }
        lock(&self.listeners).push((op, listener));
        Ok(())
    }

    fn stop_watching_mode(&self, listener: &Arc<dyn OpChangedListener>) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).retain(|(_, l)| !Arc::ptr_eq(l, listener));
    }

    fn check_mode(&self, op: i32, _uid: u32, package: &str) -> OpMode {
        lock(&self.modes)
            .get(&(op, package.to_owned()))
            .copied()
            .unwrap_or_default()
    }
}
