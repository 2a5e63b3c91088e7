#![forbid(unsafe_code)]

//! Core: keyed observables, shared observable registry, and typed stores.
//!
//! # Role in prefbind
//! `prefbind-core` is the platform-independent layer between a settings
//! screen and the platform values it displays. Platform adapters live in
//! `prefbind-platform`; in-memory doubles live in `prefbind-harness`.
//!
//! # Primary responsibilities
//! - **KeyedObservable**: per-key and wildcard observers, each delivered on
//!   its own executor, with watch/unwatch hooks on the empty boundary.
//! - **ResourceBackedObservable**: a keyed observable that holds one upstream
//!   platform listener only while it has observers.
//! - **SharedObservableRegistry**: at most one live resource-backed observable
//!   per resource id, evicted when its last observer leaves.
//! - **KeyValueStore**: typed read/write/observe over platform values.
//! - **LifecycleBoundRebinder**: one shared observer per resource key, bound
//!   to a screen's start/stop/close.
//!
//! # How it fits in the system
//! Platform callbacks arrive on arbitrary threads and call `notify_change`
//! (directly or through a [`resource::ChangeSink`]). Observers never run on
//! the notifying thread unless they chose [`executor::DirectExecutor`].

pub mod config;
pub mod error;
pub mod executor;
pub mod keyed;
pub mod logging;
pub mod reason;
pub mod rebinder;
pub mod registry;
pub mod resource;
pub mod store;
pub mod value;

pub use config::{DispatchConfig, LoggingConfig, PrefbindConfig};
pub use error::{ConfigError, ObserveError};
pub use executor::{DirectExecutor, Executor, QueueExecutor, SerialExecutor, Task};
pub use keyed::{
    KeyedObservable, KeyedObserver, ObserverRef, Subscription, WatchHooks, WatchState, observer_fn,
};
pub use reason::ChangeReason;
pub use rebinder::{
    LifecycleBoundRebinder, ObservableHandle, PreferenceHierarchy, PreferenceNode, RebinderState,
    RegistryBinding,
};
pub use registry::SharedObservableRegistry;
pub use resource::{ChangeSink, ChangeSource, ResourceBackedObservable};
pub use store::{KeyValueStore, KeyValueStoreExt};
pub use value::{SettingType, SettingValue, ValueKind};
