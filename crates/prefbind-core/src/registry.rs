#![forbid(unsafe_code)]

//! Shared cache of resource-backed observables, one per resource id.
//!
//! The registry collapses every logical subscription to a resource (an
//! app-op code, a settings namespace, ...) onto a single
//! [`ResourceBackedObservable`], and therefore a single upstream listener.
//!
//! # Invariants
//!
//! 1. At most one live (non-retired) observable per resource id. Lookup and
//!    insert happen under one mutex.
//! 2. An entry leaves the map only from its own observable's release hook,
//!    and only if the map still points at that exact instance. A fresh
//!    observable that replaced a retiring one is never evicted.
//! 3. Callers never need to hold an instance across calls: [`observe`]
//!    re-fetches and retries when it races with a retirement.
//!
//! The registry is an explicit service object. Cloning it yields another
//! handle to the same cache; pass it to the call sites that observe.
//!
//! [`observe`]: SharedObservableRegistry::observe

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, debug_span};

use crate::error::ObserveError;
use crate::executor::Executor;
use crate::keyed::{ObserverRef, Subscription};
use crate::resource::{ChangeSource, ResourceBackedObservable};

/// Builds the upstream source for a resource id.
pub type SourceFactory<Id, K> = Box<dyn Fn(&Id) -> Arc<dyn ChangeSource<K>> + Send + Sync>;

struct RegistryInner<Id, K> {
    entries: Mutex<HashMap<Id, Arc<ResourceBackedObservable<K>>>>,
    factory: SourceFactory<Id, K>,
}

impl<Id, K> RegistryInner<Id, K>
where
    Id: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    fn lock(&self) -> MutexGuard<'_, HashMap<Id, Arc<ResourceBackedObservable<K>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict(&self, id: &Id, me: &Weak<ResourceBackedObservable<K>>) {
        let removed = {
            let mut entries = self.lock();
            match entries.get(id) {
                Some(current) if std::ptr::eq(Arc::as_ptr(current), me.as_ptr()) => {
                    entries.remove(id)
                }
                Some(_) => {
                    debug!(id = ?id, "eviction skipped: entry already replaced");
                    None
                }
                None => None,
            }
        };
        // Drop outside the lock.
        if removed.is_some() {
            debug!(id = ?id, "resource observable evicted");
        }
    }
}

/// Process-wide cache mapping resource ids to their shared observable.
pub struct SharedObservableRegistry<Id, K> {
    inner: Arc<RegistryInner<Id, K>>,
}

impl<Id, K> Clone for SharedObservableRegistry<Id, K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Id: fmt::Debug, K> fmt::Debug for SharedObservableRegistry<Id, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SharedObservableRegistry")
            .field("ids", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Id, K> SharedObservableRegistry<Id, K>
where
    Id: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    /// Registry that builds sources with `factory` on first use of an id.
    pub fn new(
        factory: impl Fn(&Id) -> Arc<dyn ChangeSource<K>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                factory: Box::new(factory),
            }),
        }
    }

    /// Return the live observable for `id`, creating it if absent or retired.
    ///
    /// A created entry stays cached until an observer comes and goes; use
    /// [`peek`](Self::peek) to inspect without creating. Do not keep the
    /// result across add/remove rounds; prefer [`observe`](Self::observe),
    /// which re-fetches for you.
    pub fn get(&self, id: &Id) -> Arc<ResourceBackedObservable<K>> {
        let _span = debug_span!("registry_get", id = ?id).entered();
        let mut entries = self.inner.lock();
        if let Some(existing) = entries.get(id)
            && !existing.is_retired()
        {
            return Arc::clone(existing);
        }

        let source = (self.inner.factory)(id);
        let registry = Arc::downgrade(&self.inner);
        let evict_id = id.clone();
        let observable = ResourceBackedObservable::with_release(
            source,
            Box::new(move |me: &Weak<ResourceBackedObservable<K>>| {
                if let Some(registry) = registry.upgrade() {
                    registry.evict(&evict_id, me);
                }
            }),
        );
        let replaced = entries.insert(id.clone(), Arc::clone(&observable));
        debug!(
            id = ?id,
            replaced_retired = replaced.is_some(),
            entries = entries.len(),
            "resource observable created"
        );
        observable
    }

    /// The live observable for `id`, if one is cached. Never creates.
    #[must_use]
    pub fn peek(&self, id: &Id) -> Option<Arc<ResourceBackedObservable<K>>> {
        self.inner
            .lock()
            .get(id)
            .filter(|existing| !existing.is_retired())
            .cloned()
    }

    /// Add `observer` for `key` (or all keys) on the observable for `id`.
    ///
    /// The first observer of an id starts its upstream listener; a failure
    /// there is returned to this caller and nothing stays registered.
    pub fn observe(
        &self,
        id: &Id,
        key: Option<K>,
        observer: ObserverRef<K>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), ObserveError> {
        loop {
            let observable = self.get(id);
            match observable.add_observer(key.clone(), Arc::clone(&observer), Arc::clone(&executor)) {
                Err(ObserveError::Retired) => {
                    debug!(id = ?id, "observable retired during add; refetching");
                }
                other => return other,
            }
        }
    }

    /// Remove `observer` from `key` on the observable for `id`. Returns
    /// `false` if nothing was registered.
    pub fn unobserve(&self, id: &Id, key: Option<&K>, observer: &ObserverRef<K>) -> bool {
        let observable = self.inner.lock().get(id).cloned();
        match observable {
            Some(observable) => observable.remove_observer(key, observer),
            None => false,
        }
    }

    /// [`observe`](Self::observe) and return a guard that unobserves on drop.
    pub fn subscribe(
        &self,
        id: &Id,
        key: Option<K>,
        observer: ObserverRef<K>,
        executor: Arc<dyn Executor>,
    ) -> Result<Subscription, ObserveError> {
        self.observe(id, key.clone(), Arc::clone(&observer), executor)?;
        let registry = self.clone();
        let id = id.clone();
        Ok(Subscription::from_fn(move || {
            registry.unobserve(&id, key.as_ref(), &observer);
        }))
    }

    /// Number of cached observables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, id: &Id) -> bool {
        self.inner.lock().contains_key(id)
    }
}
