#![forbid(unsafe_code)]

//! User restriction watching.
//!
//! The platform reports restriction changes in batches. [`UserRestrictionSource`]
//! splits each batch into one keyed event per restriction name, so a
//! preference that depends on `no_config_wifi` only hears about that name.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use prefbind_core::{ChangeReason, ChangeSink, ChangeSource, ObserveError};
use tracing::{debug, trace};

/// Platform callback for restriction changes.
pub trait RestrictionListener: Send + Sync {
    fn on_restrictions_changed(&self, names: &[String]);
}

/// Platform user-restriction service.
pub trait UserRestrictionService: Send + Sync {
    fn has_restriction(&self, name: &str) -> bool;

    fn register_listener(&self, listener: Arc<dyn RestrictionListener>) -> Result<(), ObserveError>;

    fn unregister_listener(&self, listener: &Arc<dyn RestrictionListener>);
}

struct FanOutListener {
    sink: ChangeSink<String>,
}

impl RestrictionListener for FanOutListener {
    fn on_restrictions_changed(&self, names: &[String]) {
        trace!(count = names.len(), "restriction batch");
        for name in names {
            self.sink.send(name.clone(), ChangeReason::Update);
        }
    }
}

/// Change source keyed by restriction name.
pub struct UserRestrictionSource {
    service: Arc<dyn UserRestrictionService>,
    listener: Mutex<Option<Arc<dyn RestrictionListener>>>,
}

impl fmt::Debug for UserRestrictionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let watching = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("UserRestrictionSource")
            .field("watching", &watching)
            .finish()
    }
}

impl UserRestrictionSource {
    pub fn new(service: Arc<dyn UserRestrictionService>) -> Self {
        Self {
            service,
            listener: Mutex::new(None),
        }
    }

    /// Current state of `name`, read from the service.
    #[must_use]
    pub fn is_restricted(&self, name: &str) -> bool {
        self.service.has_restriction(name)
    }
}

impl ChangeSource<String> for UserRestrictionSource {
    fn start_watching(&self, sink: ChangeSink<String>) -> Result<(), ObserveError> {
        let listener: Arc<dyn RestrictionListener> = Arc::new(FanOutListener { sink });
        self.service.register_listener(Arc::clone(&listener))?;
        let previous = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(listener);
        if let Some(previous) = previous {
            self.service.unregister_listener(&previous);
        }
        debug!("watching user restrictions");
        Ok(())
    }

    fn stop_watching(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            self.service.unregister_listener(&listener);
            debug!("stopped watching user restrictions");
        }
    }

    fn describe(&self) -> String {
        String::from("user-restrictions")
    }
}
