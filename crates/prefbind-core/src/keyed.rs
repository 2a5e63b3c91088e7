#![forbid(unsafe_code)]

//! Keyed, multi-subscriber change notification with a watch state machine.
//!
//! # Design
//!
//! A [`KeyedObservable<K>`] holds observer registrations keyed either by a
//! specific key or by the wildcard (`None`), each paired with the
//! [`Executor`] that must run its callback. [`KeyedObservable::notify_change`]
//! snapshots the matching registrations under the table lock and hands one
//! task per observer to its executor.
//!
//! Upstream watching is driven by two injected hooks ([`WatchHooks`]) rather
//! than subclassing:
//!
//! ```text
//!            add (empty -> 1)           remove (1 -> empty)
//! Unwatched ─────────────────▶ Watched ─────────────────────▶ Unwatched
//!            on_watch()                 on_unwatch()            (or Retired)
//! ```
//!
//! # Invariants
//!
//! 1. `on_watch` runs exactly once per Unwatched→Watched transition and
//!    `on_unwatch` exactly once per Watched→Unwatched transition, both
//!    synchronously inside the add/remove that caused them.
//! 2. Transitions are serialized by a gate lock separate from the observer
//!    table, so `notify_change` never waits on a hook.
//! 3. An add/remove issued from inside a hook on the same thread mutates the
//!    table but never runs a hook itself. When the hook returns, the
//!    outer call runs whatever transition brings the state back in line
//!    with the table (empty ⇔ not Watched).
//! 4. Once `remove_observer` returns, the removed registration receives
//!    nothing more, including tasks already queued on its executor.
//! 5. Re-adding the same observer for the same key replaces its executor.
//!
//! # Failure Modes
//!
//! - **Upstream registration failure**: `on_watch` returns an error. The add
//!   is rolled back and the error is returned to that caller.
//! - **Retired observable**: with [`KeyedObservable::retire_when_unwatched`],
//!   adds after the last removal fail with [`ObserveError::Retired`].

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, trace, warn};

use crate::error::ObserveError;
use crate::executor::Executor;
use crate::reason::ChangeReason;

/// Receives keyed change notifications.
pub trait KeyedObserver<K>: Send + Sync {
    /// Called on the observer's executor after `key` changed.
    fn on_key_changed(&self, key: &K, reason: ChangeReason);
}

impl<K, F> KeyedObserver<K> for F
where
    F: Fn(&K, ChangeReason) + Send + Sync,
{
    fn on_key_changed(&self, key: &K, reason: ChangeReason) {
        self(key, reason);
    }
}

/// Shared observer handle. Identity is the `Arc` allocation.
pub type ObserverRef<K> = Arc<dyn KeyedObserver<K>>;

/// Wrap a closure as an observer handle.
pub fn observer_fn<K, F>(f: F) -> ObserverRef<K>
where
    K: 'static,
    F: Fn(&K, ChangeReason) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn observer_id<K>(observer: &ObserverRef<K>) -> usize {
    Arc::as_ptr(observer) as *const () as usize
}

/// Where an observable sits in its watch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// No observers; upstream is not being watched.
    Unwatched,
    /// At least one observer; `on_watch` has succeeded.
    Watched,
    /// Torn down for good; adds fail with [`ObserveError::Retired`].
    Retired,
}

type WatchFn = Box<dyn Fn() -> Result<(), ObserveError> + Send + Sync>;
type UnwatchFn = Box<dyn Fn() + Send + Sync>;

/// Start/stop callbacks for the upstream resource behind an observable.
pub struct WatchHooks {
    on_watch: WatchFn,
    on_unwatch: UnwatchFn,
}

impl WatchHooks {
    pub fn new(
        on_watch: impl Fn() -> Result<(), ObserveError> + Send + Sync + 'static,
        on_unwatch: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_watch: Box::new(on_watch),
            on_unwatch: Box::new(on_unwatch),
        }
    }

    /// Hooks that do nothing.
    #[must_use]
    pub fn none() -> Self {
        Self::new(|| Ok(()), || {})
    }
}

impl fmt::Debug for WatchHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHooks").finish_non_exhaustive()
    }
}

struct Registration<K> {
    observer: ObserverRef<K>,
    executor: Arc<dyn Executor>,
    active: Arc<AtomicBool>,
}

impl<K> Registration<K> {
    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

struct ObserverTable<K> {
    keyed: HashMap<K, Vec<Registration<K>>>,
    wildcard: Vec<Registration<K>>,
    len: usize,
    state: WatchState,
}

impl<K: Eq + Hash + Clone> ObserverTable<K> {
    fn slot_mut(&mut self, key: Option<&K>) -> Option<&mut Vec<Registration<K>>> {
        match key {
            Some(k) => self.keyed.get_mut(k),
            None => Some(&mut self.wildcard),
        }
    }

    /// Insert or replace. Returns `true` when a new registration was added.
    fn insert(&mut self, key: Option<K>, reg: Registration<K>) -> bool {
        let id = observer_id(&reg.observer);
        let slot = match key {
            Some(k) => match self.keyed.entry(k) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => e.insert(Vec::new()),
            },
            None => &mut self.wildcard,
        };
        if let Some(existing) = slot.iter_mut().find(|r| observer_id(&r.observer) == id) {
            existing.deactivate();
            *existing = reg;
            return false;
        }
        slot.push(reg);
        self.len += 1;
        true
    }

    fn remove(&mut self, key: Option<&K>, id: usize) -> bool {
        let Some(slot) = self.slot_mut(key) else {
            return false;
        };
        let Some(pos) = slot.iter().position(|r| observer_id(&r.observer) == id) else {
            return false;
        };
        let reg = slot.remove(pos);
        reg.deactivate();
        let now_empty = slot.is_empty();
        if let (Some(k), true) = (key, now_empty) {
            self.keyed.remove(k);
        }
        self.len -= 1;
        true
    }
}

/// Serializes watch transitions and remembers which thread holds it so a
/// hook calling back into the same observable does not deadlock.
struct Gate {
    lock: Mutex<()>,
    owner: Mutex<Option<ThreadId>>,
}

enum GateGuard<'a> {
    Owned {
        owner: &'a Mutex<Option<ThreadId>>,
        _guard: MutexGuard<'a, ()>,
    },
    Reentrant,
}

impl Gate {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            owner: Mutex::new(None),
        }
    }

    fn enter(&self) -> GateGuard<'_> {
        let me = thread::current().id();
        if *self.owner.lock().unwrap_or_else(PoisonError::into_inner) == Some(me) {
            return GateGuard::Reentrant;
        }
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = Some(me);
        GateGuard::Owned {
            owner: &self.owner,
            _guard: guard,
        }
    }
}

impl GateGuard<'_> {
    fn runs_hooks(&self) -> bool {
        matches!(self, Self::Owned { .. })
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if let Self::Owned { owner, .. } = self {
            *owner.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
    }
}

/// Multi-subscriber change registry keyed by `K`, with per-observer executors.
pub struct KeyedObservable<K> {
    table: Mutex<ObserverTable<K>>,
    gate: Gate,
    hooks: WatchHooks,
    retire_when_unwatched: bool,
    label: String,
}

impl<K> fmt::Debug for KeyedObservable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("KeyedObservable")
            .field("label", &self.label)
            .field("state", &table.state)
            .field("observer_count", &table.len)
            .finish()
    }
}

impl<K> Default for KeyedObservable<K>
where
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedObservable<K>
where
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    /// Observable with no upstream hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hooks(WatchHooks::none())
    }

    /// Observable whose first add and last remove drive `hooks`.
    #[must_use]
    pub fn with_hooks(hooks: WatchHooks) -> Self {
        Self {
            table: Mutex::new(ObserverTable {
                keyed: HashMap::new(),
                wildcard: Vec::new(),
                len: 0,
                state: WatchState::Unwatched,
            }),
            gate: Gate::new(),
            hooks,
            retire_when_unwatched: false,
            label: String::from("keyed-observable"),
        }
    }

    /// Name used in log events.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Retire instead of returning to `Unwatched` once the last observer
    /// leaves (or the first watch fails).
    #[must_use]
    pub fn retire_when_unwatched(mut self) -> Self {
        self.retire_when_unwatched = true;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn lock_table(&self) -> MutexGuard<'_, ObserverTable<K>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn idle_state(&self) -> WatchState {
        if self.retire_when_unwatched {
            WatchState::Retired
        } else {
            WatchState::Unwatched
        }
    }

    /// Register `observer` for `key`, or for every key when `key` is `None`.
    ///
    /// Adding an observer that is already registered for the same key
    /// replaces its executor; it is never delivered to twice.
    pub fn add_observer(
        &self,
        key: Option<K>,
        observer: ObserverRef<K>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), ObserveError> {
        let gate = self.gate.enter();
        let id = observer_id(&observer);
        {
            let mut table = self.lock_table();
            if table.state == WatchState::Retired {
                return Err(ObserveError::Retired);
            }
            let added = table.insert(
                key.clone(),
                Registration {
                    observer,
                    executor,
                    active: Arc::new(AtomicBool::new(true)),
                },
            );
            debug!(
                observable = %self.label,
                key = ?key,
                replaced = !added,
                observers = table.len,
                "observer added"
            );
        }

        if !gate.runs_hooks() {
            return Ok(());
        }

        self.settle().inspect_err(|err| {
            let mut table = self.lock_table();
            table.remove(key.as_ref(), id);
            if table.len == 0 {
                table.state = self.idle_state();
            }
            warn!(observable = %self.label, error = %err, "watch failed; add rolled back");
        })
    }

    /// Unregister `observer` from `key` (or from the wildcard slot). Returns
    /// `false` if it was not registered there.
    pub fn remove_observer(&self, key: Option<&K>, observer: &ObserverRef<K>) -> bool {
        let gate = self.gate.enter();
        {
            let mut table = self.lock_table();
            if !table.remove(key, observer_id(observer)) {
                return false;
            }
            debug!(
                observable = %self.label,
                key = ?key,
                observers = table.len,
                "observer removed"
            );
        }

        if gate.runs_hooks()
            && let Err(err) = self.settle()
        {
            warn!(observable = %self.label, error = %err, "re-watch after unwatch failed");
        }
        true
    }

    /// Run hooks until the watch state matches the table. Caller holds the
    /// gate as owner.
    ///
    /// A hook may add or remove on this observable from its own thread; each
    /// pass re-reads the table, so a remove inside `on_watch` is followed by
    /// an unwatch and an add inside `on_unwatch` by a fresh watch. Once
    /// retired, nothing is re-watched.
    fn settle(&self) -> Result<(), ObserveError> {
        loop {
            let watch = {
                let mut table = self.lock_table();
                match (table.state, table.len > 0) {
                    (WatchState::Unwatched, true) => true,
                    (WatchState::Watched, false) => {
                        table.state = self.idle_state();
                        false
                    }
                    _ => return Ok(()),
                }
            };

            if watch {
                (self.hooks.on_watch)()?;
                let mut table = self.lock_table();
                if table.state == WatchState::Unwatched {
                    table.state = WatchState::Watched;
                }
                debug!(observable = %self.label, observers = table.len, "watch started");
            } else {
                (self.hooks.on_unwatch)();
                debug!(observable = %self.label, "watch stopped");
            }
        }
    }

    /// Deliver `(key, reason)` to observers of `key` and to wildcard
    /// observers, each on its own executor. Callable from any thread.
    pub fn notify_change(&self, key: &K, reason: ChangeReason) {
        let targets: Vec<(ObserverRef<K>, Arc<dyn Executor>, Arc<AtomicBool>)> = {
            let table = self.lock_table();
            let keyed = table.keyed.get(key).map(Vec::as_slice).unwrap_or_default();
            let mut targets = Vec::with_capacity(keyed.len() + table.wildcard.len());
            for reg in keyed {
                targets.push((
                    Arc::clone(&reg.observer),
                    Arc::clone(&reg.executor),
                    Arc::clone(&reg.active),
                ));
            }
            // An observer registered both for this key and for every key
            // hears about this change once.
            for reg in &table.wildcard {
                let id = observer_id(&reg.observer);
                if keyed.iter().any(|k| observer_id(&k.observer) == id) {
                    continue;
                }
                targets.push((
                    Arc::clone(&reg.observer),
                    Arc::clone(&reg.executor),
                    Arc::clone(&reg.active),
                ));
            }
            targets
        };

        trace!(
            observable = %self.label,
            key = ?key,
            reason = reason.as_str(),
            targets = targets.len(),
            "notify"
        );
        for (observer, executor, active) in targets {
            let key = key.clone();
            executor.execute(Box::new(move || {
                if active.load(Ordering::Acquire) {
                    observer.on_key_changed(&key, reason);
                }
            }));
        }
    }

    /// Notify each key in order.
    pub fn notify_keys<'a>(&self, keys: impl IntoIterator<Item = &'a K>, reason: ChangeReason) {
        for key in keys {
            self.notify_change(key, reason);
        }
    }

    /// Total registrations across all keys and the wildcard slot.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.lock_table().len
    }

    #[must_use]
    pub fn has_observers(&self) -> bool {
        self.observer_count() > 0
    }

    /// Whether anything is registered specifically for `key`.
    #[must_use]
    pub fn has_observer_for(&self, key: &K) -> bool {
        self.lock_table().keyed.contains_key(key)
    }

    #[must_use]
    pub fn state(&self) -> WatchState {
        self.lock_table().state
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.state() == WatchState::Retired
    }

    /// Register and return a guard that unregisters on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        key: Option<K>,
        observer: ObserverRef<K>,
        executor: Arc<dyn Executor>,
    ) -> Result<Subscription, ObserveError> {
        self.add_observer(key.clone(), Arc::clone(&observer), executor)?;
        let weak: Weak<Self> = Arc::downgrade(self);
        Ok(Subscription::from_fn(move || {
            if let Some(observable) = weak.upgrade() {
                observable.remove_observer(key.as_ref(), &observer);
            }
        }))
    }
}

/// RAII guard for an observer registration.
///
/// Dropping the guard (or calling [`Subscription::cancel`]) removes the
/// registration. Removal is synchronous, so no notification issued after the
/// drop reaches the observer.
#[must_use = "dropping a Subscription unregisters the observer immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn from_fn(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Unregister now.
    pub fn cancel(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{DirectExecutor, QueueExecutor};
    use std::sync::atomic::AtomicU32;
    use std::sync::{Barrier, Mutex};

    type Log = Arc<Mutex<Vec<(String, ChangeReason)>>>;

    fn recording(log: &Log) -> ObserverRef<String> {
        let log = Arc::clone(log);
        observer_fn(move |key: &String, reason| log.lock().unwrap().push((key.clone(), reason)))
    }

    fn counting_hooks() -> (WatchHooks, Arc<AtomicU32>, Arc<AtomicU32>) {
        let watches = Arc::new(AtomicU32::new(0));
        let unwatches = Arc::new(AtomicU32::new(0));
        let (w, u) = (Arc::clone(&watches), Arc::clone(&unwatches));
        let hooks = WatchHooks::new(
            move || {
                w.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            move || {
                u.fetch_add(1, Ordering::SeqCst);
            },
        );
        (hooks, watches, unwatches)
    }

    #[test]
    fn transitions_fire_hooks_once() {
        let (hooks, watches, unwatches) = counting_hooks();
        let obs = KeyedObservable::<String>::with_hooks(hooks);
        let log: Log = Arc::default();
        let a = recording(&log);
        let b = recording(&log);

        obs.add_observer(Some("k1".into()), Arc::clone(&a), DirectExecutor::shared())
            .unwrap();
        obs.add_observer(Some("k2".into()), Arc::clone(&b), DirectExecutor::shared())
            .unwrap();
        obs.add_observer(None, Arc::clone(&b), DirectExecutor::shared())
            .unwrap();
        assert_eq!(watches.load(Ordering::SeqCst), 1);
        assert_eq!(obs.state(), WatchState::Watched);

        assert!(obs.remove_observer(Some(&"k1".to_string()), &a));
        assert!(obs.remove_observer(None, &b));
        assert_eq!(unwatches.load(Ordering::SeqCst), 0);

        assert!(obs.remove_observer(Some(&"k2".to_string()), &b));
        assert_eq!(unwatches.load(Ordering::SeqCst), 1);
        assert_eq!(obs.state(), WatchState::Unwatched);

        // A second round starts a fresh watch.
        obs.add_observer(None, a, DirectExecutor::shared()).unwrap();
        assert_eq!(watches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn keyed_and_wildcard_fan_out() {
        let obs = KeyedObservable::<String>::new();
        let k1_log: Log = Arc::default();
        let any_log: Log = Arc::default();
        obs.add_observer(Some("k1".into()), recording(&k1_log), DirectExecutor::shared())
            .unwrap();
        obs.add_observer(None, recording(&any_log), DirectExecutor::shared())
            .unwrap();

        obs.notify_change(&"k1".into(), ChangeReason::Update);
        obs.notify_change(&"k2".into(), ChangeReason::Delete);

        assert_eq!(
            *k1_log.lock().unwrap(),
            vec![("k1".to_string(), ChangeReason::Update)]
        );
        assert_eq!(
            *any_log.lock().unwrap(),
            vec![
                ("k1".to_string(), ChangeReason::Update),
                ("k2".to_string(), ChangeReason::Delete)
            ]
        );
    }

    #[test]
    fn keyed_plus_wildcard_same_observer_delivers_once() {
        let obs = KeyedObservable::<String>::new();
        let log: Log = Arc::default();
        let observer = recording(&log);
        obs.add_observer(Some("k".into()), Arc::clone(&observer), DirectExecutor::shared())
            .unwrap();
        obs.add_observer(None, observer, DirectExecutor::shared())
            .unwrap();

        obs.notify_change(&"k".into(), ChangeReason::Update);
        assert_eq!(log.lock().unwrap().len(), 1);
        obs.notify_change(&"other".into(), ChangeReason::Update);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn duplicate_add_replaces_executor() {
        let (hooks, watches, _) = counting_hooks();
        let obs = KeyedObservable::<String>::with_hooks(hooks);
        let log: Log = Arc::default();
        let observer = recording(&log);
        let first = Arc::new(QueueExecutor::new());
        let second = Arc::new(QueueExecutor::new());

        obs.add_observer(Some("k".into()), Arc::clone(&observer), first.clone())
            .unwrap();
        obs.notify_change(&"k".into(), ChangeReason::Update);
        obs.add_observer(Some("k".into()), Arc::clone(&observer), second.clone())
            .unwrap();
        assert_eq!(obs.observer_count(), 1);
        assert_eq!(watches.load(Ordering::SeqCst), 1);

        obs.notify_change(&"k".into(), ChangeReason::Restore);
        // The task queued before the replacement is suppressed.
        assert_eq!(first.run_pending(), 1);
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(second.run_pending(), 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec![("k".to_string(), ChangeReason::Restore)]
        );
    }

    #[test]
    fn remove_twice_is_noop() {
        let (hooks, _, unwatches) = counting_hooks();
        let obs = KeyedObservable::<String>::with_hooks(hooks);
        let log: Log = Arc::default();
        let observer = recording(&log);
        obs.add_observer(None, Arc::clone(&observer), DirectExecutor::shared())
            .unwrap();

        assert!(obs.remove_observer(None, &observer));
        assert!(!obs.remove_observer(None, &observer));
        assert!(!obs.remove_observer(Some(&"never".to_string()), &observer));
        assert_eq!(unwatches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_suppresses_queued_deliveries() {
        let obs = KeyedObservable::<String>::new();
        let log: Log = Arc::default();
        let observer = recording(&log);
        let queue = Arc::new(QueueExecutor::new());
        obs.add_observer(Some("k".into()), Arc::clone(&observer), queue.clone())
            .unwrap();

        obs.notify_change(&"k".into(), ChangeReason::Update);
        obs.remove_observer(Some(&"k".to_string()), &observer);
        obs.notify_change(&"k".into(), ChangeReason::Update);

        assert_eq!(queue.run_pending(), 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn per_observer_order_is_call_order() {
        let obs = KeyedObservable::<String>::new();
        let log: Log = Arc::default();
        let queue = Arc::new(QueueExecutor::new());
        obs.add_observer(None, recording(&log), queue.clone())
            .unwrap();

        for i in 0..20 {
            obs.notify_change(&format!("k{i}"), ChangeReason::Update);
        }
        queue.run_pending();
        let keys: Vec<String> = log.lock().unwrap().iter().map(|(k, _)| k.clone()).collect();
        let expected: Vec<String> = (0..20).map(|i| format!("k{i}")).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn failed_watch_rolls_back() {
        let attempts = Arc::new(AtomicU32::new(0));
        let unwatches = Arc::new(AtomicU32::new(0));
        let (a, u) = (Arc::clone(&attempts), Arc::clone(&unwatches));
        let obs = KeyedObservable::<String>::with_hooks(WatchHooks::new(
            move || {
                if a.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ObserveError::upstream("test", "denied"))
                } else {
                    Ok(())
                }
            },
            move || {
                u.fetch_add(1, Ordering::SeqCst);
            },
        ));
        let log: Log = Arc::default();
        let observer = recording(&log);

        let err = obs
            .add_observer(None, Arc::clone(&observer), DirectExecutor::shared())
            .unwrap_err();
        assert!(matches!(err, ObserveError::UpstreamRegistration { .. }));
        assert_eq!(obs.observer_count(), 0);
        assert_eq!(obs.state(), WatchState::Unwatched);
        assert_eq!(unwatches.load(Ordering::SeqCst), 0);

        obs.add_observer(None, observer, DirectExecutor::shared())
            .unwrap();
        assert_eq!(obs.state(), WatchState::Watched);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retiring_observable_rejects_late_adds() {
        let obs = KeyedObservable::<String>::new().retire_when_unwatched();
        let log: Log = Arc::default();
        let observer = recording(&log);
        obs.add_observer(None, Arc::clone(&observer), DirectExecutor::shared())
            .unwrap();
        obs.remove_observer(None, &observer);
        assert!(obs.is_retired());
        assert_eq!(
            obs.add_observer(None, observer, DirectExecutor::shared()),
            Err(ObserveError::Retired)
        );
    }

    #[test]
    fn hook_reentry_does_not_recurse() {
        let slot: Arc<Mutex<Option<Weak<KeyedObservable<String>>>>> = Arc::default();
        let watches = Arc::new(AtomicU32::new(0));
        let unwatches = Arc::new(AtomicU32::new(0));
        let (slot_w, w, u) = (Arc::clone(&slot), Arc::clone(&watches), Arc::clone(&unwatches));
        let helper: ObserverRef<String> = observer_fn(|_: &String, _| {});
        let helper_in_hook = Arc::clone(&helper);

        let obs = Arc::new(KeyedObservable::<String>::with_hooks(WatchHooks::new(
            move || {
                w.fetch_add(1, Ordering::SeqCst);
                // Adding from inside the hook must neither deadlock nor
                // trigger a second watch.
                let target = slot_w.lock().unwrap().as_ref().and_then(Weak::upgrade);
                if let Some(obs) = target {
                    obs.add_observer(
                        Some("helper".into()),
                        Arc::clone(&helper_in_hook),
                        DirectExecutor::shared(),
                    )?;
                }
                Ok(())
            },
            move || {
                u.fetch_add(1, Ordering::SeqCst);
            },
        )));
        *slot.lock().unwrap() = Some(Arc::downgrade(&obs));

        let log: Log = Arc::default();
        let observer = recording(&log);
        obs.add_observer(None, Arc::clone(&observer), DirectExecutor::shared())
            .unwrap();
        assert_eq!(watches.load(Ordering::SeqCst), 1);
        assert_eq!(obs.observer_count(), 2);

        obs.remove_observer(None, &observer);
        obs.remove_observer(Some(&"helper".to_string()), &helper);
        assert_eq!(unwatches.load(Ordering::SeqCst), 1);
    }

    type Slot = Arc<Mutex<Option<Weak<KeyedObservable<String>>>>>;

    fn target(slot: &Slot) -> Option<Arc<KeyedObservable<String>>> {
        slot.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    #[test]
    fn remove_inside_on_watch_unwatches_again() {
        let slot: Slot = Arc::default();
        let unwatches = Arc::new(AtomicU32::new(0));
        let one_shot: ObserverRef<String> = observer_fn(|_: &String, _| {});
        let (slot_w, u, in_hook) = (Arc::clone(&slot), Arc::clone(&unwatches), Arc::clone(&one_shot));

        let obs = Arc::new(KeyedObservable::<String>::with_hooks(WatchHooks::new(
            move || {
                // Upstream fires during registration and the one-shot
                // observer leaves immediately.
                if let Some(obs) = target(&slot_w) {
                    obs.remove_observer(Some(&"once".to_string()), &in_hook);
                }
                Ok(())
            },
            move || {
                u.fetch_add(1, Ordering::SeqCst);
            },
        )));
        *slot.lock().unwrap() = Some(Arc::downgrade(&obs));

        obs.add_observer(Some("once".into()), Arc::clone(&one_shot), DirectExecutor::shared())
            .unwrap();
        assert_eq!(obs.observer_count(), 0);
        assert_eq!(obs.state(), WatchState::Unwatched);
        assert_eq!(unwatches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn add_inside_on_unwatch_watches_again() {
        let slot: Slot = Arc::default();
        let watches = Arc::new(AtomicU32::new(0));
        let rearmed = Arc::new(AtomicBool::new(false));
        let log: Log = Arc::default();
        let late = recording(&log);
        let (slot_u, w, flag, in_hook) = (
            Arc::clone(&slot),
            Arc::clone(&watches),
            Arc::clone(&rearmed),
            Arc::clone(&late),
        );

        let obs = Arc::new(KeyedObservable::<String>::with_hooks(WatchHooks::new(
            move || {
                w.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            move || {
                if !flag.swap(true, Ordering::SeqCst)
                    && let Some(obs) = target(&slot_u)
                {
                    obs.add_observer(Some("late".into()), Arc::clone(&in_hook), DirectExecutor::shared())
                        .unwrap();
                }
            },
        )));
        *slot.lock().unwrap() = Some(Arc::downgrade(&obs));

        let first: ObserverRef<String> = observer_fn(|_: &String, _| {});
        obs.add_observer(None, Arc::clone(&first), DirectExecutor::shared())
            .unwrap();
        assert!(obs.remove_observer(None, &first));

        assert_eq!(obs.observer_count(), 1);
        assert_eq!(obs.state(), WatchState::Watched);
        assert_eq!(watches.load(Ordering::SeqCst), 2);
        obs.notify_change(&"late".into(), ChangeReason::Update);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn add_inside_on_unwatch_of_retiring_observable_is_refused() {
        let slot: Slot = Arc::default();
        let refused = Arc::new(Mutex::new(None));
        let (slot_u, refused_u) = (Arc::clone(&slot), Arc::clone(&refused));
        let obs = Arc::new(
            KeyedObservable::<String>::with_hooks(WatchHooks::new(
                || Ok(()),
                move || {
                    if let Some(obs) = target(&slot_u) {
                        let late: ObserverRef<String> = observer_fn(|_: &String, _| {});
                        *refused_u.lock().unwrap() =
                            Some(obs.add_observer(None, late, DirectExecutor::shared()));
                    }
                },
            ))
            .retire_when_unwatched(),
        );
        *slot.lock().unwrap() = Some(Arc::downgrade(&obs));

        let only: ObserverRef<String> = observer_fn(|_: &String, _| {});
        obs.add_observer(None, Arc::clone(&only), DirectExecutor::shared())
            .unwrap();
        obs.remove_observer(None, &only);

        assert_eq!(*refused.lock().unwrap(), Some(Err(ObserveError::Retired)));
        assert!(obs.is_retired());
        assert_eq!(obs.observer_count(), 0);
    }

    #[test]
    fn subscription_drop_unsubscribes() {
        let (hooks, _, unwatches) = counting_hooks();
        let obs = Arc::new(KeyedObservable::<String>::with_hooks(hooks));
        let log: Log = Arc::default();
        let sub = obs
            .subscribe(Some("k".into()), recording(&log), DirectExecutor::shared())
            .unwrap();
        obs.notify_change(&"k".into(), ChangeReason::Update);
        drop(sub);
        obs.notify_change(&"k".into(), ChangeReason::Update);

        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(unwatches.load(Ordering::SeqCst), 1);
        assert!(!obs.has_observers());
    }

    #[test]
    fn concurrent_adds_watch_once() {
        let (hooks, watches, unwatches) = counting_hooks();
        let obs = KeyedObservable::<String>::with_hooks(hooks);
        let threads = 8;
        let barrier = Barrier::new(threads);
        let observers: Vec<ObserverRef<String>> =
            (0..threads).map(|_| observer_fn(|_: &String, _| {})).collect();

        thread::scope(|s| {
            for (i, observer) in observers.iter().enumerate() {
                let (obs, barrier) = (&obs, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    obs.add_observer(
                        Some(format!("pkg{i}")),
                        Arc::clone(observer),
                        DirectExecutor::shared(),
                    )
                    .unwrap();
                });
            }
        });
        assert_eq!(watches.load(Ordering::SeqCst), 1);
        assert_eq!(obs.observer_count(), threads);

        thread::scope(|s| {
            for (i, observer) in observers.iter().enumerate() {
                let obs = &obs;
                s.spawn(move || {
                    obs.remove_observer(Some(&format!("pkg{i}")), observer);
                });
            }
        });
        assert_eq!(unwatches.load(Ordering::SeqCst), 1);
        assert_eq!(obs.state(), WatchState::Unwatched);
    }

    #[test]
    fn debug_format() {
        let obs = KeyedObservable::<String>::new().with_label("settings/secure");
        let dbg = format!("{obs:?}");
        assert!(dbg.contains("settings/secure"));
        assert!(dbg.contains("Unwatched"));
    }
}
