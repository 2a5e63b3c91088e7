#![forbid(unsafe_code)]

//! The scripted replay.
//!
//! One in-memory platform, four kinds of observer, and a fixed sequence of
//! changes per round:
//!
//! | Source | Observers | Change per round |
//! |--------|-----------|------------------|
//! | app-op 24 | `maps`, `camera`, wildcard | mode flip for both packages, plus a suppressed repeat |
//! | global settings | wildcard | `airplane_mode_on` toggle |
//! | daltonizer mode | wildcard | next mode selected |
//! | user restrictions | rebinder over a small screen | `no_config_wifi` toggle |
//!
//! Every delivery is recorded with its source tag and returned as a
//! [`DemoReport`]. All observers dispatch on one [`SerialExecutor`]; the
//! report is assembled after a flush so it is complete.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use prefbind_core::{
    ChangeReason, ChangeSource, DispatchConfig, Executor, KeyValueStoreExt,
    LifecycleBoundRebinder, ObservableHandle, ObserveError, ObserverRef, PreferenceNode,
    ResourceBackedObservable, SerialExecutor, observer_fn,
};
use prefbind_harness::{MemoryAppOps, MemorySettingsProvider, MemoryUserRestrictions};
use prefbind_platform::{
    AppOpsModeObservables, ModeSelectionStore, Namespace, OpMode, SettingSpec, SettingsProvider,
    SettingsStore, UserRestrictionSource,
};
use serde::Serialize;
use tracing::{debug, info, info_span};

const OP_SYSTEM_ALERT_WINDOW: i32 = 24;
const MAPS: &str = "com.example.maps";
const CAMERA: &str = "com.example.camera";
const DALTONIZER: &str = "accessibility_display_daltonizer";
const DALTONIZER_MODES: [(&str, i32); 4] = [
    ("deuteranomaly", 12),
    ("protanomaly", 11),
    ("tritanomaly", 13),
    ("grayscale", 0),
];

/// One observer callback as it arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub source: &'static str,
    pub key: String,
    pub reason: ChangeReason,
}

/// Everything the replay observed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DemoReport {
    pub rounds: u32,
    pub deliveries: Vec<Delivery>,
    /// Successful upstream listener registrations across all platform services.
    pub upstream_registrations: usize,
    /// Platform listeners still attached after teardown. Zero unless
    /// something leaked.
    pub listeners_after_teardown: usize,
}

impl DemoReport {
    /// Deliveries tagged `source`.
    #[must_use]
    pub fn count_from(&self, source: &str) -> usize {
        self.deliveries.iter().filter(|d| d.source == source).count()
    }
}

#[derive(Debug)]
pub enum DemoError {
    /// The dispatch thread could not be spawned.
    Spawn(std::io::Error),
    Observe(ObserveError),
}

impl fmt::Display for DemoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(err) => write!(f, "failed to start dispatch thread: {err}"),
            Self::Observe(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DemoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(err) => Some(err),
            Self::Observe(err) => Some(err),
        }
    }
}

impl From<ObserveError> for DemoError {
    fn from(err: ObserveError) -> Self {
        Self::Observe(err)
    }
}

#[derive(Clone, Default)]
struct DeliveryLog(Arc<Mutex<Vec<Delivery>>>);

impl DeliveryLog {
    fn push(&self, delivery: Delivery) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delivery);
    }

    fn observer(&self, source: &'static str) -> ObserverRef<String> {
        let log = self.clone();
        observer_fn(move |key: &String, reason: ChangeReason| {
            debug!(source, key = %key, ?reason, "delivered");
            log.push(Delivery {
                source,
                key: key.clone(),
                reason,
            });
        })
    }

    fn take(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

fn wifi_screen() -> Vec<PreferenceNode<String>> {
    vec![
        PreferenceNode::new("wifi_toggle", ["no_config_wifi".to_string()]),
        PreferenceNode::new("wifi_add_network", ["no_config_wifi".to_string()]),
        PreferenceNode::new("tethering", ["no_config_tethering".to_string()]),
    ]
}

/// Run `rounds` change rounds against a fresh in-memory platform.
pub fn run(dispatch: &DispatchConfig, rounds: u32) -> Result<DemoReport, DemoError> {
    let _span = info_span!("prefbind_demo", rounds).entered();
    let worker = Arc::new(SerialExecutor::start(dispatch).map_err(DemoError::Spawn)?);
    let executor: Arc<dyn Executor> = Arc::clone(&worker) as _;
    let log = DeliveryLog::default();

    let ops = MemoryAppOps::new();
    let settings = MemorySettingsProvider::new();
    let restrictions = MemoryUserRestrictions::new();

    // App-op modes: two packages and a wildcard share one platform listener.
    let app_ops = AppOpsModeObservables::new(Arc::clone(&ops) as _);
    let maps = log.observer("app_op.maps");
    let camera = log.observer("app_op.camera");
    let any_package = log.observer("app_op.any");
    let app_op_guards = [
        app_ops.subscribe(OP_SYSTEM_ALERT_WINDOW, Some(MAPS), maps, Arc::clone(&executor))?,
        app_ops.subscribe(OP_SYSTEM_ALERT_WINDOW, Some(CAMERA), camera, Arc::clone(&executor))?,
        app_ops.subscribe(OP_SYSTEM_ALERT_WINDOW, None, any_package, Arc::clone(&executor))?,
    ];

    let provider = Arc::clone(&settings) as Arc<dyn SettingsProvider>;
    let global = SettingsStore::new(
        Arc::clone(&provider),
        Namespace::Global,
        [
            SettingSpec::bool("airplane_mode_on", false),
            SettingSpec::int("wifi_sleep_policy", 2),
        ],
    );
    let global_observer = log.observer("settings.global");
    global.add_observer(None, Arc::clone(&global_observer), Arc::clone(&executor))?;

    let daltonizer = ModeSelectionStore::new(
        provider,
        Namespace::Secure,
        DALTONIZER,
        DALTONIZER_MODES[0].1,
        DALTONIZER_MODES,
    );
    let mode_observer = log.observer("mode.daltonizer");
    daltonizer.add_observer(None, Arc::clone(&mode_observer), Arc::clone(&executor))?;

    let source: Arc<dyn ChangeSource<String>> =
        Arc::new(UserRestrictionSource::new(Arc::clone(&restrictions) as _));
    let restriction_observable = ResourceBackedObservable::new(source);
    let rebind_log = log.clone();
    let mut rebinder = LifecycleBoundRebinder::new(
        restriction_observable as Arc<dyn ObservableHandle<String>>,
        Arc::clone(&executor),
        move |preference: &str| {
            rebind_log.push(Delivery {
                source: "rebind",
                key: preference.to_owned(),
                reason: ChangeReason::Update,
            });
        },
    );
    rebinder.bind(&wifi_screen())?;
    rebinder.start()?;

    for round in 0..rounds {
        let on = round % 2 == 0;
        let mode = if on { OpMode::Allowed } else { OpMode::Ignored };
        info!(round, ?mode, "replaying round");

        ops.set_mode(OP_SYSTEM_ALERT_WINDOW, MAPS, mode);
        // Unchanged: the platform drops it.
        ops.set_mode(OP_SYSTEM_ALERT_WINDOW, MAPS, mode);
        ops.set_mode(OP_SYSTEM_ALERT_WINDOW, CAMERA, mode);

        global.set("airplane_mode_on", on);

        let (option, _) = DALTONIZER_MODES[(round as usize + 1) % DALTONIZER_MODES.len()];
        daltonizer.set(option, true);

        restrictions.set_restriction("no_config_wifi", on);
    }
    worker.flush()?;

    let upstream_registrations =
        ops.start_calls() + settings.registrations() + restrictions.registrations();

    // Teardown: guards, explicit removes, and the rebinder all release.
    drop(app_op_guards);
    global.remove_observer(None, &global_observer);
    daltonizer.remove_observer(None, &mode_observer);
    rebinder.close();
    worker.shutdown();

    let listeners_after_teardown = ops.active_listeners()
        + settings.listener_count(Namespace::Global)
        + settings.listener_count(Namespace::Secure)
        + restrictions.listener_count();
    let report = DemoReport {
        rounds,
        deliveries: log.take(),
        upstream_registrations,
        listeners_after_teardown,
    };
    info!(
        deliveries = report.deliveries.len(),
        upstream_registrations, listeners_after_teardown, "replay finished"
    );
    Ok(report)
}
