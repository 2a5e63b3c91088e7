#![forbid(unsafe_code)]

//! Error types shared by the observable layer.
//!
//! Store-level failures (type mismatch, unknown key, malformed stored data)
//! are deliberately absent here: stores log them and degrade to `None` or a
//! no-op instead of returning an error.

use std::fmt;
use std::io;

/// Errors from observer registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserveError {
    /// The platform refused or failed an upstream listener registration.
    UpstreamRegistration {
        /// Human-readable description of the upstream resource.
        resource: String,
        /// Reason reported by the platform.
        reason: String,
    },
    /// The observable was torn down after its last observer left. Fetch a
    /// fresh instance from the registry and retry.
    Retired,
    /// A serial executor's worker thread has shut down.
    ExecutorClosed,
}

impl ObserveError {
    /// Convenience constructor for upstream registration failures.
    #[must_use]
    pub fn upstream(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamRegistration {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ObserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpstreamRegistration { resource, reason } => {
                write!(f, "upstream registration failed for {resource}: {reason}")
            }
            Self::Retired => write!(f, "observable retired after last observer was removed"),
            Self::ExecutorClosed => write!(f, "dispatch executor is shut down"),
        }
    }
}

impl std::error::Error for ObserveError {}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Io(io::Error),
    /// The config document is not valid JSON for [`crate::config::PrefbindConfig`].
    Parse(serde_json::Error),
    /// A field or environment override holds an unusable value.
    InvalidValue { key: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "config read failed: {err}"),
            Self::Parse(err) => write!(f, "config parse failed: {err}"),
            Self::InvalidValue { key, value } => {
                write!(f, "invalid value '{value}' for config key '{key}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::InvalidValue { .. } => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err)
    }
}
