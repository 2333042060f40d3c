//! Error types and handling
//!
//! The error taxonomy is structured with specific error enums for each domain
//! (configuration, completion store, command execution, reporting, session
//! watcher) that are then wrapped in the main [`BootstrapError`] enum for
//! unified error handling.
//!
//! Step failures are not errors of the pipeline: a step action returning `Err`
//! is recorded as a FAIL or WARN result. Only store and report faults escape
//! the orchestrator.

use std::time::Duration;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    Parsing { message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },
}

/// Completion store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Step name cannot be used as a completion key
    #[error("Invalid step name '{name}': expected [a-z0-9][a-z0-9._-]*")]
    InvalidName { name: String },

    /// The durable medium could not be read or written
    #[error("Completion store I/O error at {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// External command errors
#[derive(Error, Debug)]
pub enum CommandError {
    /// The process could not be started at all
    #[error("Failed to spawn command `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process ran and exited unsuccessfully
    #[error("Command `{command}` failed with {}{}", exit_label(.code), stderr_suffix(.stderr_tail))]
    Failed {
        command: String,
        code: Option<i32>,
        stderr_tail: String,
    },
}

impl CommandError {
    /// One-line form for the summary log: the first line of the command, the
    /// exit status and the stderr tail
    pub fn summary(&self) -> String {
        match self {
            Self::Failed {
                command,
                code,
                stderr_tail,
            } => format!(
                "`{}` failed with {}{}",
                first_line(command),
                exit_label(code),
                stderr_suffix(stderr_tail)
            ),
            other => first_line(&other.to_string()),
        }
    }
}

fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().trim().to_string()
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn stderr_suffix(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {}", tail)
    }
}

/// Reporter errors (detail log and summary log)
#[derive(Error, Debug)]
pub enum ReportError {
    /// A log file could not be opened or appended to
    #[error("Failed to write log file {path}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A log file could not be read back
    #[error("Failed to read log file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Session watcher errors
#[derive(Error, Debug)]
pub enum WatcherError {
    /// The watched service never became active
    #[error("Service {service} did not become active within {waited:?}")]
    DependencyTimeout { service: String, waited: Duration },

    /// A session backend query produced output that could not be interpreted
    #[error("Session backend error: {message}")]
    Backend { message: String },
}

/// Internal/generic fallback errors
#[derive(Error, Debug)]
pub enum InternalError {
    /// Generic internal error
    #[error("Internal error: {message}")]
    Generic { message: String },
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Completion store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// External command errors
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Reporter errors
    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    /// Session watcher errors
    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),

    /// Step-level failure not tied to a single command
    #[error("Step error: {0}")]
    Step(String),

    /// Internal/generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] InternalError),
}

impl BootstrapError {
    /// One-line form for the summary log
    pub fn summary(&self) -> String {
        match self {
            Self::Command(e) => e.summary(),
            other => first_line(&other.to_string()),
        }
    }
}

/// Convenience type alias for Results with BootstrapError
pub type Result<T> = std::result::Result<T, BootstrapError>;
