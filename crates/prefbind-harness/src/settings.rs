#![forbid(unsafe_code)]

//! In-memory settings table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use prefbind_core::{ChangeReason, ObserveError};
use prefbind_platform::{Namespace, SettingsListener, SettingsProvider};
use tracing::trace;

/// Settings provider backed by a map. Listeners are called synchronously on
/// the writing thread, outside the provider's locks.
#[derive(Default)]
pub struct MemorySettingsProvider {
    values: Mutex<HashMap<(Namespace, String), String>>,
    listeners: Mutex<Vec<(Namespace, Arc<dyn SettingsListener>)>>,
    registrations: AtomicUsize,
    fail_next: AtomicBool,
}

impl std::fmt::Debug for MemorySettingsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySettingsProvider")
            .field("values", &lock(&self.values).len())
            .field("listeners", &lock(&self.listeners).len())
            .field("registrations", &self.registrations())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemorySettingsProvider {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Write `value` and notify with `reason`.
    pub fn put_with_reason(&self, namespace: Namespace, name: &str, value: &str, reason: ChangeReason) {
        lock(&self.values).insert((namespace, name.to_owned()), value.to_owned());
        self.notify(namespace, name, reason);
    }

    /// Remove `name`; notifies with [`ChangeReason::Delete`] if it existed.
    pub fn delete(&self, namespace: Namespace, name: &str) -> bool {
        let existed = lock(&self.values)
            .remove(&(namespace, name.to_owned()))
            .is_some();
        if existed {
            self.notify(namespace, name, ChangeReason::Delete);
        }
        existed
    }

    /// Notify without touching the stored value.
    pub fn notify(&self, namespace: Namespace, name: &str, reason: ChangeReason) {
        let listeners: Vec<_> = lock(&self.listeners)
            .iter()
            .filter(|(ns, _)| *ns == namespace)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        trace!(namespace = %namespace, name, listeners = listeners.len(), "settings change");
        for listener in listeners {
            listener.on_setting_changed(name, reason);
        }
    }

    /// Make the next `register_observer` call fail.
    pub fn fail_next_registration(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Listeners currently registered for `namespace`.
    #[must_use]
    pub fn listener_count(&self, namespace: Namespace) -> usize {
        lock(&self.listeners)
            .iter()
            .filter(|(ns, _)| *ns == namespace)
            .count()
    }

    /// Total successful `register_observer` calls.
    #[must_use]
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

impl SettingsProvider for MemorySettingsProvider {
    fn get_string(&self, namespace: Namespace, name: &str) -> Option<String> {
        lock(&self.values).get(&(namespace, name.to_owned())).cloned()
    }

    fn put_string(&self, namespace: Namespace, name: &str, value: &str) -> bool {
        self.put_with_reason(namespace, name, value, ChangeReason::Update);
        true
    }

    fn register_observer(
        &self,
        namespace: Namespace,
        listener: Arc<dyn SettingsListener>,
    ) -> Result<(), ObserveError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ObserveError::upstream(
                format!("settings:{namespace}"),
                "registration refused",
            ));
        }
        self.registrations.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).push((namespace, listener));
        Ok(())
    }

    fn unregister_observer(&self, namespace: Namespace, listener: &Arc<dyn SettingsListener>) {
        lock(&self.listeners).retain(|(ns, l)| !(*ns == namespace && Arc::ptr_eq(l, listener)));
    }
}
