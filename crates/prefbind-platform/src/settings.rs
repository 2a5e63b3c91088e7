#![forbid(unsafe_code)]

//! Typed store over a string-valued settings provider.
//!
//! The provider is the platform's settings table: every value is a string,
//! partitioned by [`Namespace`]. [`SettingsStore`] declares which names it
//! serves and at what type, converts on the way in and out, and turns the
//! provider's change callbacks into keyed notifications.
//!
//! # Encoding
//!
//! | Kind | Stored form | Also accepted on read |
//! |------|-------------|-----------------------|
//! | `Bool` | `"1"` / `"0"` | `"true"` / `"false"` |
//! | `Int`, `Long`, `Float` | decimal | surrounding whitespace |
//! | `Text` | verbatim | |
//!
//! # Invariants
//!
//! 1. At most one provider listener per store, installed by the first
//!    observer and removed with the last.
//! 2. Reads always hit the provider. Nothing is cached.
//! 3. Changes to names the store does not declare are dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use prefbind_core::store::check_kind;
use prefbind_core::{
    ChangeReason, KeyValueStore, KeyedObservable, ObserveError, SettingValue, ValueKind,
    WatchHooks,
};
use tracing::{debug, trace, warn};

/// Partition of the platform settings table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Global,
    Secure,
    System,
}

impl Namespace {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Secure => "secure",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback for provider-side setting changes.
pub trait SettingsListener: Send + Sync {
    fn on_setting_changed(&self, name: &str, reason: ChangeReason);
}

/// Platform settings table accessor.
pub trait SettingsProvider: Send + Sync {
    fn get_string(&self, namespace: Namespace, name: &str) -> Option<String>;

    /// Returns `false` if the platform rejected the write.
    fn put_string(&self, namespace: Namespace, name: &str, value: &str) -> bool;

    /// Deliver every change in `namespace` to `listener`.
    fn register_observer(
        &self,
        namespace: Namespace,
        listener: Arc<dyn SettingsListener>,
    ) -> Result<(), ObserveError>;

    fn unregister_observer(&self, namespace: Namespace, listener: &Arc<dyn SettingsListener>);
}

/// One declared setting.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingSpec {
    pub name: String,
    pub kind: ValueKind,
    pub default: Option<SettingValue>,
}

impl SettingSpec {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    pub fn bool(name: impl Into<String>, default: bool) -> Self {
        Self::new(name, ValueKind::Bool).with_default(default)
    }

    pub fn int(name: impl Into<String>, default: i32) -> Self {
        Self::new(name, ValueKind::Int).with_default(default)
    }

    pub fn long(name: impl Into<String>, default: i64) -> Self {
        Self::new(name, ValueKind::Long).with_default(default)
    }

    pub fn float(name: impl Into<String>, default: f32) -> Self {
        Self::new(name, ValueKind::Float).with_default(default)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Text)
    }

    /// Set the default. A default of the wrong kind is discarded with a warning.
    #[must_use]
    pub fn with_default(mut self, default: impl Into<SettingValue>) -> Self {
        let default = default.into();
        if default.kind() == self.kind {
            self.default = Some(default);
        } else {
            warn!(
                name = %self.name,
                kind = self.kind.as_str(),
                default_kind = default.kind().as_str(),
                "setting default kind mismatch; ignored"
            );
        }
        self
    }
}

pub(crate) fn encode(value: &SettingValue) -> String {
    match value {
        SettingValue::Bool(true) => "1".to_owned(),
        SettingValue::Bool(false) => "0".to_owned(),
        SettingValue::Int(v) => v.to_string(),
        SettingValue::Long(v) => v.to_string(),
        SettingValue::Float(v) => v.to_string(),
        SettingValue::Text(v) => v.clone(),
    }
}

/// Parse a stored string as `kind`. `None` if malformed.
pub(crate) fn decode(raw: &str, kind: ValueKind) -> Option<SettingValue> {
    match kind {
        ValueKind::Bool => match raw.trim() {
            "1" | "true" => Some(SettingValue::Bool(true)),
            "0" | "false" => Some(SettingValue::Bool(false)),
            _ => None,
        },
        ValueKind::Int => raw.trim().parse().ok().map(SettingValue::Int),
        ValueKind::Long => raw.trim().parse().ok().map(SettingValue::Long),
        ValueKind::Float => raw.trim().parse().ok().map(SettingValue::Float),
        ValueKind::Text => Some(SettingValue::Text(raw.to_owned())),
    }
}

struct ForwardingListener {
    observable: Weak<KeyedObservable<String>>,
    declared: Arc<HashMap<String, SettingSpec>>,
}

impl SettingsListener for ForwardingListener {
    fn on_setting_changed(&self, name: &str, reason: ChangeReason) {
        if !self.declared.contains_key(name) {
            trace!(name, "undeclared setting change ignored");
            return;
        }
        if let Some(observable) = self.observable.upgrade() {
            observable.notify_change(&name.to_owned(), reason);
        }
    }
}

/// Build an observable whose first observer registers `listener` with the
/// provider and whose last observer unregisters it.
pub(crate) fn provider_backed_observable(
    provider: &Arc<dyn SettingsProvider>,
    namespace: Namespace,
    label: String,
    make_listener: impl FnOnce(Weak<KeyedObservable<String>>) -> Arc<dyn SettingsListener>,
) -> Arc<KeyedObservable<String>> {
    Arc::new_cyclic(|me| {
        let listener = make_listener(Weak::clone(me));
        let watch_provider = Arc::clone(provider);
        let unwatch_provider = Arc::clone(provider);
        let watch_listener = Arc::clone(&listener);
        let watch_label = label.clone();
        let unwatch_label = label.clone();
        let hooks = WatchHooks::new(
            move || {
                debug!(store = %watch_label, namespace = %namespace, "registering provider listener");
                watch_provider.register_observer(namespace, Arc::clone(&watch_listener))
            },
            move || {
                debug!(store = %unwatch_label, namespace = %namespace, "unregistering provider listener");
                unwatch_provider.unregister_observer(namespace, &listener);
            },
        );
        KeyedObservable::with_hooks(hooks).with_label(label)
    })
}

/// Store over the declared settings of one namespace.
pub struct SettingsStore {
    name: String,
    namespace: Namespace,
    provider: Arc<dyn SettingsProvider>,
    specs: Arc<HashMap<String, SettingSpec>>,
    observable: Arc<KeyedObservable<String>>,
}

impl fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsStore")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("settings", &self.specs.len())
            .field("observers", &self.observable.observer_count())
            .finish()
    }
}

impl SettingsStore {
    pub fn new(
        provider: Arc<dyn SettingsProvider>,
        namespace: Namespace,
        settings: impl IntoIterator<Item = SettingSpec>,
    ) -> Self {
        let specs: Arc<HashMap<String, SettingSpec>> = Arc::new(
            settings
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
        );
        let name = format!("settings:{namespace}");
        let declared = Arc::clone(&specs);
        let observable = provider_backed_observable(&provider, namespace, name.clone(), |me| {
            let listener: Arc<dyn SettingsListener> = Arc::new(ForwardingListener {
                observable: me,
                declared,
            });
            listener
        });
        Self {
            name,
            namespace,
            provider,
            specs,
            observable,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Declared setting names, unordered.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }
}

impl KeyValueStore for SettingsStore {
    fn contains(&self, key: &str) -> bool {
        self.specs.contains_key(key)
    }

    fn value_kind(&self, key: &str) -> Option<ValueKind> {
        self.specs.get(key).map(|spec| spec.kind)
    }

    fn get_value(&self, key: &str, kind: ValueKind) -> Option<SettingValue> {
        if !check_kind(&self.name, key, self.value_kind(key), kind) {
            return None;
        }
        let raw = self.provider.get_string(self.namespace, key)?;
        let value = decode(&raw, kind);
        if value.is_none() {
            warn!(store = %self.name, key, raw = %raw, kind = kind.as_str(), "malformed stored value");
        }
        value
    }

    fn set_value(&self, key: &str, value: SettingValue) {
        if !check_kind(&self.name, key, self.value_kind(key), value.kind()) {
            return;
        }
        let encoded = encode(&value);
        if !self.provider.put_string(self.namespace, key, &encoded) {
            warn!(store = %self.name, key, value = %encoded, "provider rejected write");
        }
    }

    fn default_value(&self, key: &str) -> Option<SettingValue> {
        self.specs.get(key).and_then(|spec| spec.default.clone())
    }

    fn observable(&self) -> &KeyedObservable<String> {
        &self.observable
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use prefbind_core::{DirectExecutor, KeyValueStoreExt, observer_fn};
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Minimal provider for unit tests; the full double lives in the harness.
    #[derive(Default)]
    pub(crate) struct TableProvider {
        values: Mutex<HashMap<(Namespace, String), String>>,
        listeners: Mutex<Vec<(Namespace, Arc<dyn SettingsListener>)>>,
        pub(crate) registrations: AtomicUsize,
    }

    impl TableProvider {
        pub(crate) fn listeners(&self) -> usize {
            self.listeners.lock().unwrap().len()
        }
    }

    impl SettingsProvider for TableProvider {
        fn get_string(&self, namespace: Namespace, name: &str) -> Option<String> {
            self.values
                .lock()
                .unwrap()
                .get(&(namespace, name.to_owned()))
                .cloned()
        }

        fn put_string(&self, namespace: Namespace, name: &str, value: &str) -> bool {
            self.values
                .lock()
                .unwrap()
                .insert((namespace, name.to_owned()), value.to_owned());
            let listeners: Vec<_> = self
                .listeners
                .lock()
                .unwrap()
                .iter()
                .filter(|(ns, _)| *ns == namespace)
                .map(|(_, l)| Arc::clone(l))
                .collect();
            for listener in listeners {
                listener.on_setting_changed(name, ChangeReason::Update);
            }
            true
        }

        fn register_observer(
            &self,
            namespace: Namespace,
            listener: Arc<dyn SettingsListener>,
        ) -> Result<(), ObserveError> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            self.listeners.lock().unwrap().push((namespace, listener));
            Ok(())
        }

        fn unregister_observer(&self, namespace: Namespace, listener: &Arc<dyn SettingsListener>) {
            self.listeners
                .lock()
                .unwrap()
                .retain(|(ns, l)| !(*ns == namespace && Arc::ptr_eq(l, listener)));
        }
    }

    fn store(provider: &Arc<TableProvider>) -> SettingsStore {
        let provider: Arc<dyn SettingsProvider> = Arc::clone(provider) as _;
        SettingsStore::new(
            provider,
            Namespace::Secure,
            [
                SettingSpec::bool("adb_enabled", false),
                SettingSpec::int("screen_timeout", 30_000),
                SettingSpec::text("device_name"),
            ],
        )
    }

    #[test]
    fn bool_encoding() {
        let provider = Arc::new(TableProvider::default());
        let store = store(&provider);
        store.set("adb_enabled", true);
        assert_eq!(
            provider.get_string(Namespace::Secure, "adb_enabled").as_deref(),
            Some("1")
        );
        provider.put_string(Namespace::Secure, "adb_enabled", "true");
        assert_eq!(store.get::<bool>("adb_enabled"), Some(true));
        provider.put_string(Namespace::Secure, "adb_enabled", "maybe");
        assert_eq!(store.get::<bool>("adb_enabled"), None);
    }

    #[test]
    fn absent_value_falls_back_to_declared_default() {
        let provider = Arc::new(TableProvider::default());
        let store = store(&provider);
        assert_eq!(store.get::<i32>("screen_timeout"), None);
        assert_eq!(store.get_or_default::<i32>("screen_timeout"), Some(30_000));
        assert_eq!(store.get_or_default::<String>("device_name"), None);
    }

    #[test]
    fn undeclared_and_mismatched_keys_are_no_ops() {
        let provider = Arc::new(TableProvider::default());
        let store = store(&provider);
        store.set("unknown", 3);
        store.set_value("screen_timeout", SettingValue::from("ten"));
        assert!(!store.contains("unknown"));
        assert_eq!(provider.get_string(Namespace::Secure, "unknown"), None);
        assert_eq!(provider.get_string(Namespace::Secure, "screen_timeout"), None);
    }

    #[test]
    fn one_provider_listener_for_many_observers() {
        let provider = Arc::new(TableProvider::default());
        let store = store(&provider);
        let hits = Arc::new(AtomicUsize::new(0));
        let mut observers = Vec::new();
        for key in ["adb_enabled", "screen_timeout", "device_name"] {
            let hits = Arc::clone(&hits);
            let observer = observer_fn(move |_: &String, _| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
            store
                .add_observer(Some(key), Arc::clone(&observer), DirectExecutor::shared())
                .unwrap();
            observers.push((key, observer));
        }
        assert_eq!(provider.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(provider.listeners(), 1);

        store.set("screen_timeout", 60_000);
        provider.put_string(Namespace::Secure, "not_declared", "x");
        provider.put_string(Namespace::Global, "adb_enabled", "1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        for (key, observer) in &observers {
            assert!(store.remove_observer(Some(*key), observer));
        }
        assert_eq!(provider.listeners(), 0);
    }

    #[test]
    fn mismatched_default_is_dropped() {
        let spec = SettingSpec::new("brightness", ValueKind::Int).with_default(true);
        assert_eq!(spec.default, None);
    }

    proptest! {
        #[test]
        fn decode_never_panics(raw in ".{0,16}") {
            for kind in [ValueKind::Bool, ValueKind::Int, ValueKind::Long, ValueKind::Float, ValueKind::Text] {
                if let Some(value) = decode(&raw, kind) {
                    prop_assert_eq!(value.kind(), kind);
                }
            }
        }

        #[test]
        fn ints_survive_storage(v in any::<i32>()) {
            prop_assert_eq!(decode(&encode(&SettingValue::Int(v)), ValueKind::Int), Some(SettingValue::Int(v)));
        }
    }
}
