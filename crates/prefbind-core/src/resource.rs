#![forbid(unsafe_code)]

//! Observables backed by a single upstream platform listener.
//!
//! A [`ResourceBackedObservable`] multiplexes many logical subscribers onto
//! one upstream registration. The first observer starts the upstream
//! [`ChangeSource`]; the last one to leave stops it and retires the instance.
//!
//! The upstream only ever sees a [`ChangeSink`], which holds a `Weak`
//! reference: a platform service that forgets to unregister cannot keep the
//! observable (or its observers) alive.

use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::error::ObserveError;
use crate::executor::Executor;
use crate::keyed::{KeyedObservable, ObserverRef, Subscription, WatchHooks, WatchState};
use crate::reason::ChangeReason;

/// An upstream resource that can be watched for keyed changes.
pub trait ChangeSource<K>: Send + Sync {
    /// Install exactly one upstream listener that forwards into `sink`.
    fn start_watching(&self, sink: ChangeSink<K>) -> Result<(), ObserveError>;

    /// Remove the listener installed by `start_watching`.
    fn stop_watching(&self);

    /// Short description for logs and errors.
    fn describe(&self) -> String {
        String::from("change-source")
    }
}

/// Handle the upstream uses to report changes.
pub struct ChangeSink<K> {
    target: Weak<ResourceBackedObservable<K>>,
}

impl<K> Clone for ChangeSink<K> {
    fn clone(&self) -> Self {
        Self {
            target: Weak::clone(&self.target),
        }
    }
}

impl<K> fmt::Debug for ChangeSink<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSink")
            .field("connected", &(self.target.strong_count() > 0))
            .finish()
    }
}

impl<K> ChangeSink<K>
where
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    /// Report a change. Dropped silently if the observable is gone.
    pub fn send(&self, key: K, reason: ChangeReason) {
        match self.target.upgrade() {
            Some(observable) => observable.notify_change(&key, reason),
            None => trace!(key = ?key, "change for dropped observable ignored"),
        }
    }

    /// Whether the observable behind this sink still exists.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.target.strong_count() > 0
    }
}

type ReleaseFn<K> = Box<dyn Fn(&Weak<ResourceBackedObservable<K>>) + Send + Sync>;

/// Keyed observable whose notifications come from one shared upstream
/// listener.
pub struct ResourceBackedObservable<K> {
    inner: KeyedObservable<K>,
    source: Arc<dyn ChangeSource<K>>,
}

impl<K> fmt::Debug for ResourceBackedObservable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceBackedObservable")
            .field("inner", &self.inner)
            .field("source", &self.source.describe())
            .finish()
    }
}

impl<K> ResourceBackedObservable<K>
where
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    /// Standalone observable over `source`.
    pub fn new(source: Arc<dyn ChangeSource<K>>) -> Arc<Self> {
        Self::with_release(source, Box::new(|_: &Weak<Self>| {}))
    }

    /// Observable that calls `release` with its own `Weak` once it retires,
    /// either after the last observer leaves or after the first watch fails.
    pub(crate) fn with_release(source: Arc<dyn ChangeSource<K>>, release: ReleaseFn<K>) -> Arc<Self> {
        let label = source.describe();
        let release = Arc::new(release);
        Arc::new_cyclic(|me: &Weak<Self>| {
            let watch_me = Weak::clone(me);
            let unwatch_me = Weak::clone(me);
            let watch_source = Arc::clone(&source);
            let unwatch_source = Arc::clone(&source);
            let watch_release = Arc::clone(&release);
            let unwatch_release = release;

            let hooks = WatchHooks::new(
                move || {
                    let sink = ChangeSink {
                        target: Weak::clone(&watch_me),
                    };
                    let result = watch_source.start_watching(sink);
                    if result.is_err() {
                        (*watch_release)(&watch_me);
                    }
                    result
                },
                move || {
                    unwatch_source.stop_watching();
                    (*unwatch_release)(&unwatch_me);
                },
            );

            debug!(source = %label, "resource observable created");
            Self {
                inner: KeyedObservable::with_hooks(hooks)
                    .with_label(label)
                    .retire_when_unwatched(),
                source,
            }
        })
    }

    pub fn add_observer(
        &self,
        key: Option<K>,
        observer: ObserverRef<K>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), ObserveError> {
        self.inner.add_observer(key, observer, executor)
    }

    pub fn remove_observer(&self, key: Option<&K>, observer: &ObserverRef<K>) -> bool {
        self.inner.remove_observer(key, observer)
    }

    /// Fan a change out to matching observers. Upstream listeners normally
    /// reach this through their [`ChangeSink`].
    pub fn notify_change(&self, key: &K, reason: ChangeReason) {
        self.inner.notify_change(key, reason);
    }

    /// Register and return a guard that unregisters on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        key: Option<K>,
        observer: ObserverRef<K>,
        executor: Arc<dyn Executor>,
    ) -> Result<Subscription, ObserveError> {
        self.inner
            .add_observer(key.clone(), Arc::clone(&observer), executor)?;
        let weak = Arc::downgrade(self);
        Ok(Subscription::from_fn(move || {
            if let Some(observable) = weak.upgrade() {
                observable.remove_observer(key.as_ref(), &observer);
            }
        }))
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.observer_count()
    }

    #[must_use]
    pub fn has_observers(&self) -> bool {
        self.inner.has_observers()
    }

    #[must_use]
    pub fn state(&self) -> WatchState {
        self.inner.state()
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.inner.is_retired()
    }

    /// The underlying keyed observable.
    pub fn observable(&self) -> &KeyedObservable<K> {
        &self.inner
    }
}
