//! Run context threaded through the orchestrator and step executor

use crate::config::BootstrapConfig;
use crate::redaction::Redactor;
use crate::report::Reporter;
use crate::runner::{CommandRunner, SystemRunner};
use crate::store::{CompletionStore, MarkerStore};
use std::sync::Arc;

/// Everything a run needs: configuration, completion store, reporter and the
/// command runner. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Arc<BootstrapConfig>,
    pub store: Arc<dyn CompletionStore>,
    pub reporter: Reporter,
    pub runner: Arc<dyn CommandRunner>,
}

impl RunContext {
    pub fn new(
        config: BootstrapConfig,
        store: Arc<dyn CompletionStore>,
        reporter: Reporter,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        if let Some(password) = &config.password {
            reporter.redactor().add_secret(password);
        }
        Self {
            config: Arc::new(config),
            store,
            reporter,
            runner,
        }
    }

    /// Production wiring: marker files under `state_dir`, the configured log
    /// files and real processes.
    pub fn from_config(config: BootstrapConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner::new()))
    }

    /// Production store and logs with a caller-supplied runner
    pub fn with_runner(config: BootstrapConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let store = Arc::new(MarkerStore::new(config.state_dir.clone()));
        let reporter = Reporter::new(
            config.log_file.clone(),
            config.summary_file.clone(),
            Redactor::new(),
        );
        Self::new(config, store, reporter, runner)
    }
}
