#![forbid(unsafe_code)]

//! Recording observers, counting sources, and static hierarchies.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use prefbind_core::{
    ChangeReason, ChangeSink, ChangeSource, KeyedObserver, ObserveError, ObserverRef,
    PreferenceHierarchy, PreferenceNode,
};
use std::hash::Hash;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Observer that records every delivery.
pub struct RecordingObserver<K> {
    events: Mutex<Vec<(K, ChangeReason)>>,
}

impl<K: fmt::Debug> fmt::Debug for RecordingObserver<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingObserver")
            .field("events", &*lock(&self.events))
            .finish()
    }
}

impl<K> RecordingObserver<K>
where
    K: Clone + PartialEq + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    /// Registration handle. Every call returns the same identity.
    #[must_use]
    pub fn handle(self: &Arc<Self>) -> ObserverRef<K> {
        Arc::clone(self) as ObserverRef<K>
    }

    #[must_use]
    pub fn count(&self) -> usize {
        lock(&self.events).len()
    }

    #[must_use]
    pub fn count_for(&self, key: &K) -> usize {
        lock(&self.events).iter().filter(|(k, _)| k == key).count()
    }

    #[must_use]
    pub fn events(&self) -> Vec<(K, ChangeReason)> {
        lock(&self.events).clone()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        lock(&self.events).iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl<K: Clone + Send + Sync> KeyedObserver<K> for RecordingObserver<K> {
    fn on_key_changed(&self, key: &K, reason: ChangeReason) {
        lock(&self.events).push((key.clone(), reason));
    }
}

/// Change source that counts start/stop calls and can emit on demand.
pub struct CountingSource<K> {
    name: String,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_next: AtomicBool,
    sink: Mutex<Option<ChangeSink<K>>>,
}

impl<K> fmt::Debug for CountingSource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingSource")
            .field("name", &self.name)
            .field("starts", &self.starts())
            .field("stops", &self.stops())
            .finish()
    }
}

impl<K> CountingSource<K>
where
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
            sink: Mutex::new(None),
        })
    }

    /// Make the next `start_watching` call fail.
    pub fn fail_next_start(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Emit through the installed sink. Returns `false` when not watching.
    pub fn emit(&self, key: K, reason: ChangeReason) -> bool {
        let sink = lock(&self.sink).clone();
        match sink {
            Some(sink) => {
                sink.send(key, reason);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_watching(&self) -> bool {
        lock(&self.sink).is_some()
    }
}

impl<K> CountingSource<K> {
    #[must_use]
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl<K> ChangeSource<K> for CountingSource<K>
where
    K: Send + Sync,
{
    fn start_watching(&self, sink: ChangeSink<K>) -> Result<(), ObserveError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ObserveError::upstream(self.name.clone(), "start refused"));
        }
        *lock(&self.sink) = Some(sink);
        Ok(())
    }

    fn stop_watching(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *lock(&self.sink) = None;
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Fixed preference hierarchy.
#[derive(Debug, Clone)]
pub struct StaticHierarchy<K> {
    nodes: Vec<PreferenceNode<K>>,
}

impl<K> Default for StaticHierarchy<K> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<K> StaticHierarchy<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_node(mut self, key: &str, dependencies: impl IntoIterator<Item = K>) -> Self {
        self.nodes.push(PreferenceNode::new(key, dependencies));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl<K> PreferenceHierarchy<K> for StaticHierarchy<K> {
    fn for_each_node(&self, visit: &mut dyn FnMut(&PreferenceNode<K>)) {
        self.nodes.iter().for_each(visit);
    }
}
