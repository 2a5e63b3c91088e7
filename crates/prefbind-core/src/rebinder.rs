#![forbid(unsafe_code)]

//! Lifecycle-scoped rebinding of preferences to the resources they read.
//!
//! A screen declares, per preference, which resource keys it depends on. The
//! [`LifecycleBoundRebinder`] inverts that into `resource key -> preference
//! keys`, registers **one** observer per distinct resource key while the
//! screen is active, and calls `on_rebind(preference_key)` for every
//! preference affected by a change.
//!
//! ```text
//!  bind()/node_added()      start()                stop()        close()
//!  ───────────────▶ Idle ─────────────▶ Active ─────────▶ Stopped ───────▶ Closed
//!                                         ▲                │
//!                                         └──── start() ───┘
//! ```
//!
//! `close()` (also run on drop) is idempotent and releases whatever was
//! registered, including a partially completed `start()`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::error::ObserveError;
use crate::executor::Executor;
use crate::keyed::{KeyedObservable, ObserverRef, observer_fn};
use crate::reason::ChangeReason;
use crate::registry::SharedObservableRegistry;
use crate::resource::ResourceBackedObservable;

/// One node of a preference hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferenceNode<K> {
    /// Preference key to rebind.
    pub key: String,
    /// Resource keys whose changes invalidate this preference.
    pub dependencies: Vec<K>,
}

impl<K> PreferenceNode<K> {
    pub fn new(key: impl Into<String>, dependencies: impl IntoIterator<Item = K>) -> Self {
        Self {
            key: key.into(),
            dependencies: dependencies.into_iter().collect(),
        }
    }
}

/// Something that can be walked for preference nodes.
pub trait PreferenceHierarchy<K> {
    fn for_each_node(&self, visit: &mut dyn FnMut(&PreferenceNode<K>));
}

impl<K> PreferenceHierarchy<K> for [PreferenceNode<K>] {
    fn for_each_node(&self, visit: &mut dyn FnMut(&PreferenceNode<K>)) {
        self.iter().for_each(visit);
    }
}

impl<K> PreferenceHierarchy<K> for Vec<PreferenceNode<K>> {
    fn for_each_node(&self, visit: &mut dyn FnMut(&PreferenceNode<K>)) {
        self.as_slice().for_each_node(visit);
    }
}

/// The observable side the rebinder registers with.
pub trait ObservableHandle<K>: Send + Sync {
    fn add_observer(
        &self,
        key: Option<K>,
        observer: ObserverRef<K>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), ObserveError>;

    fn remove_observer(&self, key: Option<&K>, observer: &ObserverRef<K>) -> bool;
}

impl<K> ObservableHandle<K> for KeyedObservable<K>
where
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    fn add_observer(
        &self,
        key: Option<K>,
        observer: ObserverRef<K>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), ObserveError> {
        KeyedObservable::add_observer(self, key, observer, executor)
    }

    fn remove_observer(&self, key: Option<&K>, observer: &ObserverRef<K>) -> bool {
        KeyedObservable::remove_observer(self, key, observer)
    }
}

impl<K> ObservableHandle<K> for ResourceBackedObservable<K>
where
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    fn add_observer(
        &self,
        key: Option<K>,
        observer: ObserverRef<K>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), ObserveError> {
        ResourceBackedObservable::add_observer(self, key, observer, executor)
    }

    fn remove_observer(&self, key: Option<&K>, observer: &ObserverRef<K>) -> bool {
        ResourceBackedObservable::remove_observer(self, key, observer)
    }
}

/// One resource id of a [`SharedObservableRegistry`], re-fetched on every
/// call so no stale instance is ever held.
pub struct RegistryBinding<Id, K> {
    registry: SharedObservableRegistry<Id, K>,
    id: Id,
}

impl<Id, K> RegistryBinding<Id, K> {
    pub fn new(registry: SharedObservableRegistry<Id, K>, id: Id) -> Self {
        Self { registry, id }
    }
}

impl<Id, K> ObservableHandle<K> for RegistryBinding<Id, K>
where
    Id: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    fn add_observer(
        &self,
        key: Option<K>,
        observer: ObserverRef<K>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), ObserveError> {
        self.registry.observe(&self.id, key, observer, executor)
    }

    fn remove_observer(&self, key: Option<&K>, observer: &ObserverRef<K>) -> bool {
        self.registry.unobserve(&self.id, key, observer)
    }
}

/// Lifecycle of a [`LifecycleBoundRebinder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebinderState {
    Idle,
    Active,
    Stopped,
    Closed,
}

type Dependents<K> = Arc<Mutex<HashMap<K, BTreeSet<String>>>>;

/// Rebinds preferences while their screen is active.
pub struct LifecycleBoundRebinder<K> {
    source: Arc<dyn ObservableHandle<K>>,
    executor: Arc<dyn Executor>,
    dependents: Dependents<K>,
    observer: ObserverRef<K>,
    registered: Vec<K>,
    state: RebinderState,
}

impl<K: fmt::Debug> fmt::Debug for LifecycleBoundRebinder<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleBoundRebinder")
            .field("state", &self.state)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

impl<K> LifecycleBoundRebinder<K>
where
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    /// `on_rebind` runs on `executor` with the key of each preference whose
    /// dependency changed.
    pub fn new(
        source: Arc<dyn ObservableHandle<K>>,
        executor: Arc<dyn Executor>,
        on_rebind: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        let dependents: Dependents<K> = Arc::default();
        let lookup = Arc::clone(&dependents);
        let observer = observer_fn(move |key: &K, _reason: ChangeReason| {
            let preferences: Vec<String> = lookup
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .map(|prefs| prefs.iter().cloned().collect())
                .unwrap_or_default();
            for preference in &preferences {
                on_rebind(preference);
            }
        });
        Self {
            source,
            executor,
            dependents,
            observer,
            registered: Vec::new(),
            state: RebinderState::Idle,
        }
    }

    /// Walk `hierarchy` once and record every declared dependency.
    pub fn bind(&mut self, hierarchy: &(impl PreferenceHierarchy<K> + ?Sized)) -> Result<(), ObserveError> {
        let mut nodes = Vec::new();
        hierarchy.for_each_node(&mut |node| nodes.push(node.clone()));
        for node in nodes {
            self.node_added(&node)?;
        }
        Ok(())
    }

    /// Record a node that appeared after the initial walk. While active, a
    /// dependency on a not-yet-registered resource key is registered now.
    pub fn node_added(&mut self, node: &PreferenceNode<K>) -> Result<(), ObserveError> {
        {
            let mut dependents = self
                .dependents
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for dep in &node.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(node.key.clone());
            }
        }
        if self.state != RebinderState::Active {
            return Ok(());
        }
        for dep in &node.dependencies {
            self.register(dep)?;
        }
        Ok(())
    }

    /// Register one observer per distinct resource key. A no-op while
    /// already active. On failure, keys registered so far stay tracked so
    /// `stop`/`close` release them.
    pub fn start(&mut self) -> Result<(), ObserveError> {
        match self.state {
            RebinderState::Active => return Ok(()),
            RebinderState::Closed => return Err(ObserveError::Retired),
            RebinderState::Idle | RebinderState::Stopped => {}
        }
        let keys: Vec<K> = self
            .dependents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for key in &keys {
            if let Err(err) = self.register(key) {
                warn!(key = ?key, error = %err, "rebinder start failed");
                self.state = RebinderState::Stopped;
                return Err(err);
            }
        }
        self.state = RebinderState::Active;
        debug!(keys = self.registered.len(), "rebinder started");
        Ok(())
    }

    /// Deregister everything registered so far.
    pub fn stop(&mut self) {
        let released = self.registered.len();
        for key in self.registered.drain(..) {
            self.source.remove_observer(Some(&key), &self.observer);
        }
        if self.state != RebinderState::Closed {
            self.state = RebinderState::Stopped;
        }
        debug!(keys = released, "rebinder stopped");
    }

    /// Stop for good. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == RebinderState::Closed {
            return;
        }
        self.stop();
        self.state = RebinderState::Closed;
    }

    #[must_use]
    pub fn state(&self) -> RebinderState {
        self.state
    }

    /// Resource keys currently registered with the source.
    #[must_use]
    pub fn registered_keys(&self) -> &[K] {
        &self.registered
    }

    /// Preferences that depend on `key`, in key order.
    #[must_use]
    pub fn preferences_for(&self, key: &K) -> Vec<String> {
        self.dependents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|prefs| prefs.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn register(&mut self, key: &K) -> Result<(), ObserveError> {
        if self.registered.contains(key) {
            return Ok(());
        }
        self.source.add_observer(
            Some(key.clone()),
            Arc::clone(&self.observer),
            Arc::clone(&self.executor),
        )?;
        self.registered.push(key.clone());
        Ok(())
    }
}

impl<K> Drop for LifecycleBoundRebinder<K> {
    fn drop(&mut self) {
        if self.state == RebinderState::Closed {
            return;
        }
        for key in self.registered.drain(..) {
            self.source.remove_observer(Some(&key), &self.observer);
        }
        self.state = RebinderState::Closed;
    }
}
