#![forbid(unsafe_code)]

//! Key-value stores: read, write, and observe one platform value per key.
//!
//! A [`KeyValueStore`] pairs a platform accessor with a
//! [`KeyedObservable<String>`]. Reads always go to the platform (nothing is
//! cached); writes are synchronous; observers hear about changes through the
//! store's observable, whose watch hooks install one platform listener.
//!
//! # Failure Modes
//!
//! | Failure | Behavior |
//! |---------|----------|
//! | Unknown key | `get_value` returns `None`, `set_value` logs and does nothing |
//! | Kind mismatch | same as unknown key |
//! | Malformed stored data | `get_value` logs and returns `None` |
//!
//! None of these cross the store boundary as errors.

use std::sync::Arc;

use tracing::warn;

use crate::error::ObserveError;
use crate::executor::Executor;
use crate::keyed::{KeyedObservable, ObserverRef};
use crate::value::{SettingType, SettingValue, ValueKind};

/// Read/write/observe access to a set of keyed platform values.
pub trait KeyValueStore: Send + Sync {
    /// Whether this store serves `key`.
    fn contains(&self, key: &str) -> bool;

    /// The kind `key` produces, if served.
    fn value_kind(&self, key: &str) -> Option<ValueKind>;

    /// Current value of `key` read from the platform, or `None` if the key is
    /// unknown, `kind` does not match, or nothing is stored.
    fn get_value(&self, key: &str, kind: ValueKind) -> Option<SettingValue>;

    /// Write `value` to `key`. Unknown keys and mismatched kinds are logged
    /// and ignored.
    fn set_value(&self, key: &str, value: SettingValue);

    /// Value reported when nothing is stored.
    fn default_value(&self, _key: &str) -> Option<SettingValue> {
        None
    }

    /// Change notifications for this store's keys.
    fn observable(&self) -> &KeyedObservable<String>;
}

/// Typed and observer conveniences for every [`KeyValueStore`].
pub trait KeyValueStoreExt: KeyValueStore {
    fn get<T: SettingType>(&self, key: &str) -> Option<T> {
        self.get_value(key, T::KIND).and_then(T::from_value)
    }

    /// Stored value, falling back to the store's default.
    fn get_or_default<T: SettingType>(&self, key: &str) -> Option<T> {
        self.get::<T>(key)
            .or_else(|| self.default_value(key).and_then(T::from_value))
    }

    fn set<T: SettingType>(&self, key: &str, value: T) {
        self.set_value(key, value.into_value());
    }

    fn add_observer(
        &self,
        key: Option<&str>,
        observer: ObserverRef<String>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), ObserveError> {
        self.observable()
            .add_observer(key.map(str::to_owned), observer, executor)
    }

    fn remove_observer(&self, key: Option<&str>, observer: &ObserverRef<String>) -> bool {
        let key = key.map(str::to_owned);
        self.observable().remove_observer(key.as_ref(), observer)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// Log and return `false` unless `requested` is what `key` produces.
///
/// Store implementations call this at the top of `get_value`/`set_value`.
pub fn check_kind(store: &str, key: &str, expected: Option<ValueKind>, requested: ValueKind) -> bool {
    match expected {
        Some(kind) if kind == requested => true,
        Some(kind) => {
            warn!(store, key, expected = kind.as_str(), requested = requested.as_str(), "value kind mismatch");
            false
        }
        None => {
            warn!(store, key, "unknown key");
            false
        }
    }
}
