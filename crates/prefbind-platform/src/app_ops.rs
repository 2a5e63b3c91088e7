#![forbid(unsafe_code)]

//! App-op mode watching.
//!
//! The platform reports op-mode changes per op code through one listener
//! registration each. [`AppOpsModeObservables`] caches one
//! [`ResourceBackedObservable`] per op in a [`SharedObservableRegistry`], so
//! any number of observers of the same op share a single platform listener.
//! Observers key on the package name; `None` observes every package.
//!
//! # Failure Modes
//!
//! | Failure | Behavior |
//! |---------|----------|
//! | `start_watching_mode` fails | error returned to the observer that triggered it, nothing stays registered |
//! | event for another op | dropped |
//! | repeated identical mode | forwarded; suppression belongs to the platform |
//!
//! [`ResourceBackedObservable`]: prefbind_core::ResourceBackedObservable

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use prefbind_core::{
    ChangeReason, ChangeSink, ChangeSource, Executor, ObserveError, ObserverRef,
    SharedObservableRegistry, Subscription,
};
use tracing::{debug, trace, warn};

/// Mode of an app-op for one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OpMode {
    Allowed,
    Ignored,
    Errored,
    #[default]
    Default,
    Foreground,
}

impl OpMode {
    /// Platform integer code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Allowed => 0,
            Self::Ignored => 1,
            Self::Errored => 2,
            Self::Default => 3,
            Self::Foreground => 4,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Allowed),
            1 => Some(Self::Ignored),
            2 => Some(Self::Errored),
            3 => Some(Self::Default),
            4 => Some(Self::Foreground),
            _ => None,
        }
    }
}

/// Platform callback for op-mode changes.
pub trait OpChangedListener: Send + Sync {
    fn on_op_changed(&self, op: i32, package: &str);
}

/// Platform app-ops service.
pub trait AppOpsService: Send + Sync {
    /// Start delivering mode changes of `op` to `listener`.
    fn start_watching_mode(
        &self,
        op: i32,
        listener: Arc<dyn OpChangedListener>,
    ) -> Result<(), ObserveError>;

    fn stop_watching_mode(&self, listener: &Arc<dyn OpChangedListener>);

    fn check_mode(&self, op: i32, uid: u32, package: &str) -> OpMode;
}

struct SinkListener {
    op: i32,
    sink: ChangeSink<String>,
}

impl OpChangedListener for SinkListener {
    fn on_op_changed(&self, op: i32, package: &str) {
        if op != self.op {
            trace!(expected = self.op, op, package, "event for other op ignored");
            return;
        }
        self.sink.send(package.to_owned(), ChangeReason::Update);
    }
}

/// Upstream source for one op code.
pub struct AppOpModeSource {
    op: i32,
    service: Arc<dyn AppOpsService>,
    listener: Mutex<Option<Arc<dyn OpChangedListener>>>,
}

impl fmt::Debug for AppOpModeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppOpModeSource")
            .field("op", &self.op)
            .field("watching", &self.is_watching())
            .finish()
    }
}

impl AppOpModeSource {
    pub fn new(op: i32, service: Arc<dyn AppOpsService>) -> Self {
        Self {
            op,
            service,
            listener: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn op(&self) -> i32 {
        self.op
    }

    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl ChangeSource<String> for AppOpModeSource {
    fn start_watching(&self, sink: ChangeSink<String>) -> Result<(), ObserveError> {
        let listener: Arc<dyn OpChangedListener> = Arc::new(SinkListener { op: self.op, sink });
        self.service
            .start_watching_mode(self.op, Arc::clone(&listener))
            .inspect_err(|err| warn!(op = self.op, error = %err, "start watching op mode failed"))?;
        let previous = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(listener);
        if let Some(previous) = previous {
            warn!(op = self.op, "listener already installed; replacing");
            self.service.stop_watching_mode(&previous);
        }
        debug!(op = self.op, "watching op mode");
        Ok(())
    }

    fn stop_watching(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            self.service.stop_watching_mode(&listener);
            debug!(op = self.op, "stopped watching op mode");
        }
    }

    fn describe(&self) -> String {
        format!("app-op {}", self.op)
    }
}

/// Shared per-op observables keyed by package name.
#[derive(Clone)]
pub struct AppOpsModeObservables {
    service: Arc<dyn AppOpsService>,
    registry: SharedObservableRegistry<i32, String>,
}

impl fmt::Debug for AppOpsModeObservables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppOpsModeObservables")
            .field("registry", &self.registry)
            .finish()
    }
}

impl AppOpsModeObservables {
    pub fn new(service: Arc<dyn AppOpsService>) -> Self {
        let factory_service = Arc::clone(&service);
        let registry = SharedObservableRegistry::new(move |op: &i32| {
            let source: Arc<dyn ChangeSource<String>> =
                Arc::new(AppOpModeSource::new(*op, Arc::clone(&factory_service)));
            source
        });
        Self { service, registry }
    }

    /// Observe mode changes of `op` for `package`, or for all packages.
    pub fn observe(
        &self,
        op: i32,
        package: Option<&str>,
        observer: ObserverRef<String>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), ObserveError> {
        self.registry
            .observe(&op, package.map(str::to_owned), observer, executor)
    }

    pub fn unobserve(&self, op: i32, package: Option<&str>, observer: &ObserverRef<String>) -> bool {
        let package = package.map(str::to_owned);
        self.registry.unobserve(&op, package.as_ref(), observer)
    }

    pub fn subscribe(
        &self,
        op: i32,
        package: Option<&str>,
        observer: ObserverRef<String>,
        executor: Arc<dyn Executor>,
    ) -> Result<Subscription, ObserveError> {
        self.registry
            .subscribe(&op, package.map(str::to_owned), observer, executor)
    }

    /// Current mode, read straight from the service.
    #[must_use]
    pub fn check_mode(&self, op: i32, uid: u32, package: &str) -> OpMode {
        self.service.check_mode(op, uid, package)
    }

    /// The underlying registry, for binding rebinders and for inspection.
    #[must_use]
    pub fn registry(&self) -> &SharedObservableRegistry<i32, String> {
        &self.registry
    }
}
