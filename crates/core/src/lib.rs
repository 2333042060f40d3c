//! Core library for the first-boot bootstrap orchestrator
//!
//! This crate contains the completion store, retry helper, step executor,
//! reporter, orchestrator, the standard provisioning pipeline and the session
//! watcher, together with configuration, logging and error handling.

pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod redaction;
pub mod report;
pub mod retry;
pub mod runner;
pub mod step;
pub mod store;
pub mod watcher;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
