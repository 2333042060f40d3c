//! Watch command implementation
//!
//! Entrypoint of the session watcher unit. Runs the watcher state machine
//! once; FAILED_TO_START exits non-zero so systemd can restart the unit.

use anyhow::Result;
use firstboot_core::config::BootstrapConfig;
use firstboot_core::runner::SystemRunner;
use firstboot_core::watcher::{DcvBackend, SessionWatcher};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Execute the watch command
#[instrument(skip_all)]
pub async fn execute_watch(config: BootstrapConfig) -> Result<()> {
    let backend = DcvBackend::new(Arc::new(SystemRunner::new()), config.watcher.service.clone());
    let watcher = SessionWatcher::from_config(&config, Arc::new(backend));

    let report = watcher.run().await;
    if let Some(err) = report.failure(watcher.service()) {
        return Err(err.into());
    }

    if let Some(error) = &report.create_error {
        warn!("Session was not created: {}", error);
    }
    for (label, error) in &report.preferences_failed {
        warn!("Preference {} not applied: {}", label, error);
    }
    info!(
        created = report.created,
        already_present = report.already_present,
        applied = report.preferences_applied.len(),
        "Session watcher finished"
    );
    Ok(())
}
