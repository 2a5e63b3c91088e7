#![forbid(unsafe_code)]

//! Platform adapters: the collaborator traits a host platform implements and
//! the stores and sources built over them.
//!
//! - [`settings`]: string-typed settings provider and a typed store over it.
//! - [`mode`]: several boolean preferences derived from one int setting.
//! - [`app_ops`]: per-op mode watching shared through a registry.
//! - [`restrictions`]: user restriction changes fanned out per name.

pub mod app_ops;
pub mod mode;
pub mod restrictions;
pub mod settings;

pub use app_ops::{AppOpModeSource, AppOpsModeObservables, AppOpsService, OpChangedListener, OpMode};
pub use mode::ModeSelectionStore;
pub use restrictions::{RestrictionListener, UserRestrictionService, UserRestrictionSource};
pub use settings::{Namespace, SettingSpec, SettingsListener, SettingsProvider, SettingsStore};
