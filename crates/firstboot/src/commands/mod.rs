//! Command implementations
//!
//! This module contains implementations for all CLI subcommands.

pub mod reset;
pub mod run;
pub mod status;
pub mod steps;
pub mod watch;
