//! Concurrent registry access: one upstream registration and one cache entry
//! per resource id, no matter how callers interleave.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use prefbind_core::{
    ChangeReason, ChangeSource, DirectExecutor, ObserverRef, SharedObservableRegistry,
};
use prefbind_harness::{CountingSource, RecordingObserver, init_test_tracing};

const THREADS: usize = 8;

fn registry_over(source: &Arc<CountingSource<String>>) -> SharedObservableRegistry<u32, String> {
    let source = Arc::clone(source);
    SharedObservableRegistry::new(move |_id: &u32| {
        let source: Arc<dyn ChangeSource<String>> = Arc::clone(&source) as _;
        source
    })
}

#[test]
fn concurrent_first_observers_register_upstream_once() {
    init_test_tracing();
    let source = CountingSource::new("race");
    let registry = registry_over(&source);
    let barrier = Barrier::new(THREADS);
    let recorders: Vec<_> = (0..THREADS)
        .map(|_| RecordingObserver::<String>::new())
        .collect();

    thread::scope(|scope| {
        for (i, recorder) in recorders.iter().enumerate() {
            let registry = registry.clone();
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                registry
                    .observe(&7, Some(format!("pkg{i}")), recorder.handle(), DirectExecutor::shared())
                    .unwrap();
            });
        }
    });

    assert_eq!(source.starts(), 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.peek(&7).unwrap().observer_count(), THREADS);

    assert!(source.emit("pkg3".into(), ChangeReason::Update));
    let delivered: usize = recorders.iter().map(|r| r.count()).sum();
    assert_eq!(delivered, 1);
    assert_eq!(recorders[3].count(), 1);
}

#[test]
fn churn_never_leaves_duplicate_or_stale_entries() {
    init_test_tracing();
    let source = CountingSource::new("churn");
    let registry = registry_over(&source);
    let barrier = Barrier::new(THREADS);
    let rounds = 200;

    thread::scope(|scope| {
        for i in 0..THREADS {
            let registry = registry.clone();
            let barrier = &barrier;
            scope.spawn(move || {
                let observer: ObserverRef<String> = RecordingObserver::<String>::new().handle();
                let key = Some(format!("pkg{i}"));
                barrier.wait();
                for _ in 0..rounds {
                    registry
                        .observe(&1, key.clone(), Arc::clone(&observer), DirectExecutor::shared())
                        .unwrap();
                    assert!(registry.unobserve(&1, key.as_ref(), &observer));
                }
            });
        }
    });

    // Every watch was matched by an unwatch and the map is empty again.
    assert_eq!(source.starts(), source.stops());
    assert!(!source.is_watching());
    assert!(registry.is_empty());

    // A fresh observer after the storm registers upstream again.
    let before = source.starts();
    let recorder = RecordingObserver::new();
    registry
        .observe(&1, None, recorder.handle(), DirectExecutor::shared())
        .unwrap();
    assert_eq!(source.starts(), before + 1);
    assert_eq!(registry.len(), 1);
}

#[test]
fn retiring_instance_does_not_evict_its_replacement() {
    init_test_tracing();
    let source = CountingSource::new("identity");
    let registry = registry_over(&source);
    let first = RecordingObserver::new();
    let second = RecordingObserver::new();

    registry
        .observe(&5, None, first.handle(), DirectExecutor::shared())
        .unwrap();
    let old = registry.peek(&5).unwrap();
    assert!(registry.unobserve(&5, None, &first.handle()));
    assert!(old.is_retired());

    registry
        .observe(&5, None, second.handle(), DirectExecutor::shared())
        .unwrap();
    let current = registry.peek(&5).unwrap();
    assert!(!Arc::ptr_eq(&old, &current));

    // The retired handle is inert: adds are refused, removes are no-ops,
    // and none of it touches the live entry.
    assert!(old.add_observer(None, first.handle(), DirectExecutor::shared()).is_err());
    assert!(!old.remove_observer(None, &second.handle()));
    assert_eq!(registry.len(), 1);
    assert!(Arc::ptr_eq(&registry.peek(&5).unwrap(), &current));
}

#[test]
fn notify_races_with_add_and_remove() {
    init_test_tracing();
    let source = CountingSource::new("notify-race");
    let registry = registry_over(&source);
    let anchor = RecordingObserver::new();
    registry
        .observe(&9, Some("anchor".into()), anchor.handle(), DirectExecutor::shared())
        .unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    let barrier = Barrier::new(3);

    thread::scope(|scope| {
        scope.spawn(|| {
            barrier.wait();
            for _ in 0..500 {
                source.emit("anchor".into(), ChangeReason::Update);
            }
        });
        scope.spawn(|| {
            let counter = Arc::clone(&delivered);
            let observer = prefbind_core::observer_fn(move |_: &String, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            barrier.wait();
            for _ in 0..500 {
                registry
                    .observe(&9, None, Arc::clone(&observer), DirectExecutor::shared())
                    .unwrap();
                registry.unobserve(&9, None, &observer);
            }
        });
        barrier.wait();
    });

    assert_eq!(anchor.count(), 500);
    assert!(delivered.load(Ordering::SeqCst) <= 500);
    assert_eq!(source.starts(), 1);
}
