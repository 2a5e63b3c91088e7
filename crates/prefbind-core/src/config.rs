#![forbid(unsafe_code)]

//! Configuration for logging and background dispatch.
//!
//! Config is plain data: a JSON document (every field optional) overlaid
//! with `PREFBIND_*` environment variables.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `PREFBIND_LOG` | `logging.filter` |
//! | `PREFBIND_LOG_JSON` | `logging.json` (`1/true/yes/on`) |
//! | `PREFBIND_DISPATCH_BACKLOG_WARN` | `dispatch.backlog_warning` |

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const ENV_LOG: &str = "PREFBIND_LOG";
const ENV_LOG_JSON: &str = "PREFBIND_LOG_JSON";
const ENV_BACKLOG_WARN: &str = "PREFBIND_DISPATCH_BACKLOG_WARN";

#[inline]
fn env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `info,prefbind_core=debug`.
    pub filter: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: String::from("info"),
            json: false,
        }
    }
}

impl LoggingConfig {
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Settings for [`crate::executor::SerialExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Worker thread name.
    pub thread_name: String,
    /// Pending-task depth above which a warning is logged.
    pub backlog_warning: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            thread_name: String::from("prefbind-dispatch"),
            backlog_warning: 1024,
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    #[must_use]
    pub fn with_backlog_warning(mut self, depth: usize) -> Self {
        self.backlog_warning = depth;
        self
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefbindConfig {
    pub logging: LoggingConfig,
    pub dispatch: DispatchConfig,
}

impl PrefbindConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Overlay `PREFBIND_*` variables from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Overlay variables from an arbitrary lookup.
    pub fn apply_env_with<F>(mut self, get_env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(filter) = get_env(ENV_LOG) {
            self.logging.filter = filter;
        }
        if let Some(json) = get_env(ENV_LOG_JSON) {
            self.logging.json = env_flag(&json);
        }
        if let Some(depth) = get_env(ENV_BACKLOG_WARN) {
            self.dispatch.backlog_warning =
                depth.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: ENV_BACKLOG_WARN.to_string(),
                    value: depth.clone(),
                })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.backlog_warning == 0 {
            return Err(ConfigError::InvalidValue {
                key: "dispatch.backlog_warning".into(),
                value: "0".into(),
            });
        }
        if self.dispatch.thread_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "dispatch.thread_name".into(),
                value: self.dispatch.thread_name.clone(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    #[must_use]
    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }
}
