#![forbid(unsafe_code)]

//! In-memory platform and test fixtures for prefbind.
//!
//! The doubles implement the `prefbind-platform` collaborator traits over
//! plain maps and deliver callbacks synchronously on the calling thread,
//! which is what a test wants: trigger a change, then assert.
//!
//! Every double counts its upstream registrations so tests can verify
//! listener multiplexing without inspecting internals.

pub mod app_ops;
pub mod fixtures;
pub mod restrictions;
pub mod settings;

pub use app_ops::MemoryAppOps;
pub use fixtures::{CountingSource, RecordingObserver, StaticHierarchy};
pub use prefbind_core::logging::init_test_tracing;
pub use restrictions::MemoryUserRestrictions;
pub use settings::MemorySettingsProvider;
