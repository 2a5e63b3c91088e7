#![forbid(unsafe_code)]

//! Boolean preferences derived from a single int mode setting.
//!
//! A settings screen often shows one switch per mode of a single platform
//! setting (e.g. one radio option per colour-correction mode). Each switch is
//! a boolean preference key mapped to a mode constant:
//!
//! - reading key `k` yields `current_mode == mode(k)`;
//! - writing `true` to `k` stores `mode(k)`;
//! - writing `false` does nothing, since turning one option off does not
//!   pick another.
//!
//! Any change to the backing setting notifies every mapped key, because the
//! derived value of each may have flipped.

use std::fmt;
use std::sync::{Arc, Weak};

use prefbind_core::store::check_kind;
use prefbind_core::{ChangeReason, KeyValueStore, KeyedObservable, SettingValue, ValueKind};
use tracing::{debug, trace, warn};

use crate::settings::{Namespace, SettingsListener, SettingsProvider, provider_backed_observable};

struct ModeListener {
    observable: Weak<KeyedObservable<String>>,
    setting: String,
    keys: Arc<Vec<String>>,
}

impl SettingsListener for ModeListener {
    fn on_setting_changed(&self, name: &str, reason: ChangeReason) {
        if name != self.setting {
            trace!(name, "unrelated setting change ignored");
            return;
        }
        if let Some(observable) = self.observable.upgrade() {
            observable.notify_keys(self.keys.iter(), reason);
        }
    }
}

/// Store of boolean preferences over one int setting.
pub struct ModeSelectionStore {
    name: String,
    provider: Arc<dyn SettingsProvider>,
    namespace: Namespace,
    setting: String,
    default_mode: i32,
    modes: Vec<(String, i32)>,
    observable: Arc<KeyedObservable<String>>,
}

impl fmt::Debug for ModeSelectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeSelectionStore")
            .field("namespace", &self.namespace)
            .field("setting", &self.setting)
            .field("default_mode", &self.default_mode)
            .field("modes", &self.modes)
            .finish()
    }
}

impl ModeSelectionStore {
    /// `modes` maps preference keys to the mode each one selects. Keys are
    /// notified in this order.
    pub fn new(
        provider: Arc<dyn SettingsProvider>,
        namespace: Namespace,
        setting: impl Into<String>,
        default_mode: i32,
        modes: impl IntoIterator<Item = (impl Into<String>, i32)>,
    ) -> Self {
        let setting = setting.into();
        let modes: Vec<(String, i32)> = modes
            .into_iter()
            .map(|(key, mode)| (key.into(), mode))
            .collect();
        let keys = Arc::new(modes.iter().map(|(key, _)| key.clone()).collect::<Vec<_>>());
        let name = format!("mode:{namespace}/{setting}");
        let listen_setting = setting.clone();
        let observable = provider_backed_observable(&provider, namespace, name.clone(), |me| {
            let listener: Arc<dyn SettingsListener> = Arc::new(ModeListener {
                observable: me,
                setting: listen_setting,
                keys,
            });
            listener
        });
        debug!(store = %name, keys = modes.len(), "mode selection store created");
        Self {
            name,
            provider,
            namespace,
            setting,
            default_mode,
            modes,
            observable,
        }
    }

    fn mode_for(&self, key: &str) -> Option<i32> {
        self.modes
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, mode)| *mode)
    }

    /// Current value of the backing setting, or the default when absent or
    /// malformed.
    #[must_use]
    pub fn current_mode(&self) -> i32 {
        match self.provider.get_string(self.namespace, &self.setting) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(store = %self.name, raw = %raw, "malformed mode value; using default");
                self.default_mode
            }),
            None => self.default_mode,
        }
    }

    /// Preference keys in notification order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.modes.iter().map(|(key, _)| key.as_str())
    }
}

impl KeyValueStore for ModeSelectionStore {
    fn contains(&self, key: &str) -> bool {
        self.mode_for(key).is_some()
    }

    fn value_kind(&self, key: &str) -> Option<ValueKind> {
        self.mode_for(key).map(|_| ValueKind::Bool)
    }

    fn get_value(&self, key: &str, kind: ValueKind) -> Option<SettingValue> {
        if !check_kind(&self.name, key, self.value_kind(key), kind) {
            return None;
        }
        let mode = self.mode_for(key)?;
        Some(SettingValue::Bool(self.current_mode() == mode))
    }

    fn set_value(&self, key: &str, value: SettingValue) {
        if !check_kind(&self.name, key, self.value_kind(key), value.kind()) {
            return;
        }
        let (Some(mode), SettingValue::Bool(selected)) = (self.mode_for(key), value) else {
            return;
        };
        if !selected {
            trace!(store = %self.name, key, "deselect ignored");
            return;
        }
        if !self
            .provider
            .put_string(self.namespace, &self.setting, &mode.to_string())
        {
            warn!(store = %self.name, key, mode, "provider rejected write");
        }
    }

    fn default_value(&self, key: &str) -> Option<SettingValue> {
        self.mode_for(key)
            .map(|mode| SettingValue::Bool(mode == self.default_mode))
    }

    fn observable(&self) -> &KeyedObservable<String> {
        &self.observable
    }
}
