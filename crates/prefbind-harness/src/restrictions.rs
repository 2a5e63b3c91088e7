#![forbid(unsafe_code)]

//! In-memory user restriction service.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use prefbind_core::ObserveError;
use prefbind_platform::{RestrictionListener, UserRestrictionService};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct State {
    active: BTreeSet<String>,
}

/// Restriction set with batched change delivery.
#[derive(Default)]
pub struct MemoryUserRestrictions {
    state: Mutex<State>,
    listeners: Mutex<Vec<Arc<dyn RestrictionListener>>>,
    registrations: AtomicUsize,
}

impl std::fmt::Debug for MemoryUserRestrictions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryUserRestrictions")
            .field("state", &*lock(&self.state))
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl MemoryUserRestrictions {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set one restriction; returns whether it changed.
    pub fn set_restriction(&self, name: &str, restricted: bool) -> bool {
        self.apply(&[(name, restricted)]) == 1
    }

    /// Apply several changes and deliver the ones that took effect as one
    /// batch. Returns the batch size.
    pub fn apply(&self, changes: &[(&str, bool)]) -> usize {
        let changed: Vec<String> = {
            let mut state = lock(&self.state);
            changes
                .iter()
                .filter(|(name, restricted)| {
                    if *restricted {
                        state.active.insert((*name).to_owned())
                    } else {
                        state.active.remove(*name)
                    }
                })
                .map(|(name, _)| (*name).to_owned())
                .collect()
        };
        if !changed.is_empty() {
            let listeners = lock(&self.listeners).clone();
            for listener in listeners {
                listener.on_restrictions_changed(&changed);
            }
        }
        changed.len()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    #[must_use]
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

impl UserRestrictionService for MemoryUserRestrictions {
    fn has_restriction(&self, name: &str) -> bool {
        lock(&self.state).active.contains(name)
    }

    fn register_listener(&self, listener: Arc<dyn RestrictionListener>) -> Result<(), ObserveError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).push(listener);
        Ok(())
    }

    fn unregister_listener(&self, listener: &Arc<dyn RestrictionListener>) {
        lock(&self.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }
}
