#![forbid(unsafe_code)]

//! Scripted demo for prefbind: an in-memory platform, a few settings-screen
//! observers, and a replay of platform changes with structured logging.

pub mod cli;
pub mod scenario;
