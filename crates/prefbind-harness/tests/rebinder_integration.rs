//! Rebinder driven by real platform sources: user restrictions and app-op
//! modes, across start/stop/close and late hierarchy nodes.

use std::sync::{Arc, Mutex};

use prefbind_core::{
    ChangeSource, DirectExecutor, LifecycleBoundRebinder, ObservableHandle, ObserveError,
    PreferenceNode, QueueExecutor, RebinderState, RegistryBinding, ResourceBackedObservable,
};
use prefbind_harness::{MemoryAppOps, MemoryUserRestrictions, StaticHierarchy, init_test_tracing};
use prefbind_platform::{AppOpsModeObservables, OpMode, UserRestrictionSource};

fn rebind_log() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Send + Sync + 'static) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    (log, move |pref: &str| sink.lock().unwrap().push(pref.to_owned()))
}

fn wifi_screen() -> StaticHierarchy<String> {
    StaticHierarchy::new()
        .with_node("wifi_toggle", ["no_config_wifi".to_string()])
        .with_node("wifi_add_network", ["no_config_wifi".to_string()])
        .with_node("tethering", ["no_config_tethering".to_string()])
        .with_node("about", Vec::<String>::new())
}

fn restriction_observable(
    restrictions: &Arc<MemoryUserRestrictions>,
) -> Arc<ResourceBackedObservable<String>> {
    let source: Arc<dyn ChangeSource<String>> =
        Arc::new(UserRestrictionSource::new(Arc::clone(restrictions) as _));
    ResourceBackedObservable::new(source)
}

#[test]
fn restriction_changes_rebind_dependent_preferences() {
    init_test_tracing();
    let restrictions = MemoryUserRestrictions::new();
    let observable = restriction_observable(&restrictions);
    let (log, on_rebind) = rebind_log();
    let mut rebinder = LifecycleBoundRebinder::new(
        Arc::clone(&observable) as Arc<dyn ObservableHandle<String>>,
        DirectExecutor::shared(),
        on_rebind,
    );
    rebinder.bind(&wifi_screen()).unwrap();
    rebinder.start().unwrap();

    // Two distinct keys, one platform listener.
    assert_eq!(observable.observer_count(), 2);
    assert_eq!(restrictions.listener_count(), 1);

    restrictions.set_restriction("no_config_wifi", true);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["wifi_add_network", "wifi_toggle"]
    );

    log.lock().unwrap().clear();
    restrictions.apply(&[("no_config_tethering", true), ("no_sms", true)]);
    assert_eq!(*log.lock().unwrap(), vec!["tethering"]);
}

#[test]
fn stop_releases_platform_listener_and_restart_reacquires() {
    init_test_tracing();
    let restrictions = MemoryUserRestrictions::new();
    let source: Arc<dyn ChangeSource<String>> =
        Arc::new(UserRestrictionSource::new(Arc::clone(&restrictions) as _));
    let (log, on_rebind) = rebind_log();

    // A resource-backed observable retires once unwatched, so the rebinder
    // goes through a registry to get a fresh instance on restart.
    let registry = prefbind_core::SharedObservableRegistry::new(move |_: &u8| Arc::clone(&source));
    let handle: Arc<dyn ObservableHandle<String>> =
        Arc::new(RegistryBinding::new(registry.clone(), 0u8));
    let mut rebinder = LifecycleBoundRebinder::new(
        handle,
        DirectExecutor::shared(),
        on_rebind,
    );
    rebinder.bind(&wifi_screen()).unwrap();
    rebinder.start().unwrap();
    assert_eq!(restrictions.listener_count(), 1);

    rebinder.stop();
    assert_eq!(rebinder.state(), RebinderState::Stopped);
    assert_eq!(restrictions.listener_count(), 0);
    assert!(registry.is_empty());
    restrictions.set_restriction("no_config_wifi", true);
    assert!(log.lock().unwrap().is_empty());

    rebinder.start().unwrap();
    assert_eq!(restrictions.listener_count(), 1);
    assert_eq!(restrictions.registrations(), 2);
    restrictions.set_restriction("no_config_wifi", false);
    assert_eq!(log.lock().unwrap().len(), 2);

    rebinder.close();
    assert_eq!(restrictions.listener_count(), 0);
    assert_eq!(rebinder.start(), Err(ObserveError::Retired));
}

#[test]
fn app_op_rebinder_follows_late_nodes() {
    init_test_tracing();
    let ops = MemoryAppOps::new();
    let observables = AppOpsModeObservables::new(Arc::clone(&ops) as _);
    let ui = Arc::new(QueueExecutor::new());
    let (log, on_rebind) = rebind_log();
    let handle: Arc<dyn ObservableHandle<String>> =
        Arc::new(RegistryBinding::new(observables.registry().clone(), 24));
    let mut rebinder = LifecycleBoundRebinder::new(
        handle,
        Arc::clone(&ui) as _,
        on_rebind,
    );
    rebinder
        .bind(&StaticHierarchy::new().with_node("maps_location", ["com.example.maps".to_string()]))
        .unwrap();
    rebinder.start().unwrap();
    assert_eq!(ops.start_calls(), 1);

    // A node discovered after start registers its key immediately.
    rebinder
        .node_added(&PreferenceNode::new("camera_location", ["com.example.camera".to_string()]))
        .unwrap();
    assert_eq!(rebinder.registered_keys().len(), 2);
    assert_eq!(ops.start_calls(), 1);

    ops.set_mode(24, "com.example.camera", OpMode::Allowed);
    ops.set_mode(24, "com.example.other", OpMode::Allowed);
    assert!(log.lock().unwrap().is_empty());
    ui.run_pending();
    assert_eq!(*log.lock().unwrap(), vec!["camera_location"]);

    drop(rebinder);
    assert_eq!(ops.active_listeners(), 0);
    assert!(observables.registry().is_empty());
}

#[test]
fn shared_key_is_registered_once_across_preferences() {
    init_test_tracing();
    let restrictions = MemoryUserRestrictions::new();
    let observable = restriction_observable(&restrictions);
    let (_log, on_rebind) = rebind_log();
    let mut rebinder = LifecycleBoundRebinder::new(
        Arc::clone(&observable) as Arc<dyn ObservableHandle<String>>,
        DirectExecutor::shared(),
        on_rebind,
    );
    let screen = StaticHierarchy::new()
        .with_node("a", ["no_usb".to_string()])
        .with_node("b", ["no_usb".to_string()])
        .with_node("c", ["no_usb".to_string()]);
    rebinder.bind(&screen).unwrap();
    rebinder.start().unwrap();
    rebinder.start().unwrap();
    assert_eq!(observable.observer_count(), 1);
    assert_eq!(
        rebinder.preferences_for(&"no_usb".to_string()),
        vec!["a", "b", "c"]
    );
}
