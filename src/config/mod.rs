//! Configuration management module
//!
//! Process-wide immutable configuration: app-data root, service label
//! prefix, and the environment knobs. Initialised once at startup and
//! treated as read-only for the process lifetime.

mod config;

pub use config::*;
