#![forbid(unsafe_code)]

//! Change reason codes passed through to observers.

use serde::{Deserialize, Serialize};

/// Why a keyed value changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// The value was written.
    #[default]
    Update,
    /// The value was removed and now reads as its default.
    Delete,
    /// The value was restored from a backup.
    Restore,
    /// The value was synchronized from another user profile.
    SyncAcrossProfiles,
    /// The platform did not say.
    Unknown,
}

impl ChangeReason {
    /// Stable lowercase name, used in structured log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Restore => "restore",
            Self::SyncAcrossProfiles => "sync_across_profiles",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
