//! Session watcher
//!
//! Long-running companion of the pipeline, started as a systemd unit by the
//! `session-watcher` step. It never talks to the orchestrator; it only polls
//! the remote-visualization service until it reports active, then makes sure
//! the well-known console session exists and applies desktop preferences.
//!
//! State machine:
//!
//! ```text
//! WAIT_FOR_DEPENDENCY --active--> CHECK_EXISTENCE --absent--> CREATE --+
//!        |                              |                               |
//!     timeout                        present                            v
//!        v                              +--------------------> APPLY_PREFERENCES --> DONE
//! FAILED_TO_START
//! ```
//!
//! The wait backs off exponentially from the poll interval up to the maximum
//! interval. A probe error counts as "not ready". CREATE is guarded by the
//! existence check only; a failed existence query is treated as "absent".
//! Each preference is applied independently and failures are only recorded.

use crate::config::{BootstrapConfig, Preference};
use crate::errors::{BootstrapError, Result, WatcherError};
use crate::runner::{run_checked, CommandRunner, CommandSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Watcher states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatcherState {
    WaitForDependency,
    CheckExistence,
    Create,
    ApplyPreferences,
    Done,
    FailedToStart,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatcherState::WaitForDependency => "WAIT_FOR_DEPENDENCY",
            WatcherState::CheckExistence => "CHECK_EXISTENCE",
            WatcherState::Create => "CREATE",
            WatcherState::ApplyPreferences => "APPLY_PREFERENCES",
            WatcherState::Done => "DONE",
            WatcherState::FailedToStart => "FAILED_TO_START",
        };
        f.write_str(name)
    }
}

/// Operations the watcher needs from the visualization server and desktop
#[async_trait]
pub trait SessionBackend: Send + Sync + fmt::Debug {
    /// Whether the server reports active
    async fn server_active(&self) -> Result<bool>;

    /// Whether a session with `session_id` exists
    async fn session_exists(&self, session_id: &str) -> Result<bool>;

    /// Create the console session
    async fn create_session(&self, session_id: &str, owner: &str) -> Result<()>;

    /// Apply one desktop preference as `owner`
    async fn apply_preference(&self, owner: &str, preference: &Preference) -> Result<()>;
}

/// Backend driving `systemctl`, the `dcv` CLI and `gsettings`
#[derive(Debug, Clone)]
pub struct DcvBackend {
    runner: Arc<dyn CommandRunner>,
    service: String,
}

impl DcvBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, service: impl Into<String>) -> Self {
        Self {
            runner,
            service: service.into(),
        }
    }
}

/// Session identifiers in `dcv list-sessions` output
/// (`Session: 'console' (owner:ubuntu type:console)`)
pub fn parse_session_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("Session:")?.trim_start();
            let rest = rest.strip_prefix('\'')?;
            let end = rest.find('\'')?;
            Some(rest[..end].to_string())
        })
        .collect()
}

#[async_trait]
impl SessionBackend for DcvBackend {
    async fn server_active(&self) -> Result<bool> {
        let spec = CommandSpec::new("systemctl").args(["is-active", "--quiet", self.service.as_str()]);
        Ok(self.runner.run(&spec).await?.success())
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool> {
        let output = run_checked(self.runner.as_ref(), &CommandSpec::new("dcv").arg("list-sessions")).await?;
        Ok(parse_session_ids(&output.stdout).iter().any(|id| id == session_id))
    }

    async fn create_session(&self, session_id: &str, owner: &str) -> Result<()> {
        let spec = CommandSpec::new("dcv")
            .args(["create-session", "--type=console", "--owner", owner, session_id]);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }

    async fn apply_preference(&self, owner: &str, preference: &Preference) -> Result<()> {
        let spec = CommandSpec::new("dbus-launch")
            .args([
                "gsettings",
                "set",
                preference.schema.as_str(),
                preference.key.as_str(),
                preference.value.as_str(),
            ])
            .as_user(owner);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }
}

/// How a watcher pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherOutcome {
    /// The dependency became active and the remaining states ran
    Completed,
    /// The dependency never became active within the timeout
    FailedToStart,
}

/// Record of one watcher pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherReport {
    pub outcome: WatcherOutcome,
    /// States entered, in order
    pub transitions: Vec<WatcherState>,
    /// Readiness probes issued
    pub polls: u32,
    pub waited: Duration,
    /// The session already existed at CHECK_EXISTENCE
    pub already_present: bool,
    /// CREATE ran and succeeded
    pub created: bool,
    pub create_error: Option<String>,
    pub preferences_applied: Vec<String>,
    /// `(label, error)` for every preference that failed
    pub preferences_failed: Vec<(String, String)>,
}

impl WatcherReport {
    fn new() -> Self {
        Self {
            outcome: WatcherOutcome::Completed,
            transitions: Vec::new(),
            polls: 0,
            waited: Duration::ZERO,
            already_present: false,
            created: false,
            create_error: None,
            preferences_applied: Vec::new(),
            preferences_failed: Vec::new(),
        }
    }

    fn enter(&mut self, state: WatcherState) {
        debug!("Watcher entering {}", state);
        self.transitions.push(state);
    }

    /// The timeout error matching a FAILED_TO_START outcome
    pub fn failure(&self, service: &str) -> Option<BootstrapError> {
        (self.outcome == WatcherOutcome::FailedToStart).then(|| {
            BootstrapError::Watcher(WatcherError::DependencyTimeout {
                service: service.to_string(),
                waited: self.waited,
            })
        })
    }
}

/// Session watcher driven by a [`SessionBackend`]
#[derive(Debug, Clone)]
pub struct SessionWatcher {
    backend: Arc<dyn SessionBackend>,
    service: String,
    session_id: String,
    owner: String,
    poll_interval: Duration,
    max_poll_interval: Duration,
    timeout: Option<Duration>,
    preferences: Vec<Preference>,
}

impl SessionWatcher {
    pub fn from_config(config: &BootstrapConfig, backend: Arc<dyn SessionBackend>) -> Self {
        let watcher = &config.watcher;
        Self {
            backend,
            service: watcher.service.clone(),
            session_id: watcher.session_id.clone(),
            owner: config.session_owner().to_string(),
            poll_interval: watcher.poll_interval(),
            max_poll_interval: watcher.max_poll_interval(),
            timeout: watcher.timeout(),
            preferences: watcher.preferences.clone(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Run the state machine once, to DONE or FAILED_TO_START
    #[instrument(skip_all, fields(service = %self.service, session = %self.session_id))]
    pub async fn run(&self) -> WatcherReport {
        let mut report = WatcherReport::new();

        report.enter(WatcherState::WaitForDependency);
        if !self.wait_for_dependency(&mut report).await {
            warn!(
                "Service {} not active after {:?}; giving up",
                self.service, report.waited
            );
            report.outcome = WatcherOutcome::FailedToStart;
            report.enter(WatcherState::FailedToStart);
            return report;
        }
        info!(
            "Service {} active after {} poll(s)",
            self.service, report.polls
        );

        report.enter(WatcherState::CheckExistence);
        let exists = match self.backend.session_exists(&self.session_id).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("Session existence query failed, assuming absent: {}", e);
                false
            }
        };

        if exists {
            info!("Session {} already present", self.session_id);
            report.already_present = true;
        } else {
            report.enter(WatcherState::Create);
            match self
                .backend
                .create_session(&self.session_id, &self.owner)
                .await
            {
                Ok(()) => {
                    info!("Created session {} for {}", self.session_id, self.owner);
                    report.created = true;
                }
                Err(e) => {
                    warn!("Failed to create session {}: {}", self.session_id, e);
                    report.create_error = Some(e.to_string());
                }
            }
        }

        report.enter(WatcherState::ApplyPreferences);
        for preference in &self.preferences {
            match self.backend.apply_preference(&self.owner, preference).await {
                Ok(()) => report.preferences_applied.push(preference.label()),
                Err(e) => {
                    debug!("Preference {} not applied: {}", preference.label(), e);
                    report
                        .preferences_failed
                        .push((preference.label(), e.to_string()));
                }
            }
        }

        report.enter(WatcherState::Done);
        report
    }

    /// Poll until active. Returns false on timeout.
    async fn wait_for_dependency(&self, report: &mut WatcherReport) -> bool {
        let started = Instant::now();
        let mut interval = self.poll_interval;

        loop {
            report.polls += 1;
            match self.backend.server_active().await {
                Ok(true) => {
                    report.waited = started.elapsed();
                    return true;
                }
                Ok(false) => debug!("Service {} not active yet", self.service),
                Err(e) => debug!("Readiness probe failed, treating as not ready: {}", e),
            }

            let waited = started.elapsed();
            report.waited = waited;
            let sleep_for = match self.timeout {
                Some(timeout) if waited >= timeout => return false,
                Some(timeout) => interval.min(timeout - waited),
                None => interval,
            };
            tokio::time::sleep(sleep_for).await;
            interval = interval.saturating_mul(2).min(self.max_poll_interval);
        }
    }
}

pub mod mock {
    //! Scriptable session backend for tests

    use super::SessionBackend;
    use crate::config::Preference;
    use crate::errors::{BootstrapError, Result, WatcherError};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct State {
        active_after: Option<u32>,
        probe_errors: u32,
        probes: u32,
        sessions: HashSet<String>,
        list_fails: bool,
        create_fails: bool,
        create_calls: u32,
        failing_keys: HashSet<String>,
        applied: Vec<String>,
    }

    /// In-memory backend. By default the server is never active.
    #[derive(Debug, Clone, Default)]
    pub struct MockSessionBackend {
        state: Arc<Mutex<State>>,
    }

    fn backend_error(message: &str) -> BootstrapError {
        BootstrapError::Watcher(WatcherError::Backend {
            message: message.to_string(),
        })
    }

    impl MockSessionBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Report active starting with probe number `polls` (1-based)
        pub fn active_after(self, polls: u32) -> Self {
            self.state.lock().unwrap().active_after = Some(polls);
            self
        }

        /// The first `count` probes fail with an error
        pub fn probe_errors(self, count: u32) -> Self {
            self.state.lock().unwrap().probe_errors = count;
            self
        }

        pub fn with_session(self, id: &str) -> Self {
            self.state.lock().unwrap().sessions.insert(id.to_string());
            self
        }

        pub fn list_fails(self) -> Self {
            self.state.lock().unwrap().list_fails = true;
            self
        }

        pub fn create_fails(self) -> Self {
            self.state.lock().unwrap().create_fails = true;
            self
        }

        /// Preferences whose key equals `key` fail
        pub fn failing_preference(self, key: &str) -> Self {
            self.state
                .lock()
                .unwrap()
                .failing_keys
                .insert(key.to_string());
            self
        }

        pub fn probes(&self) -> u32 {
            self.state.lock().unwrap().probes
        }

        pub fn create_calls(&self) -> u32 {
            self.state.lock().unwrap().create_calls
        }

        pub fn has_session(&self, id: &str) -> bool {
            self.state.lock().unwrap().sessions.contains(id)
        }

        /// Labels of applied preferences, in order
        pub fn applied(&self) -> Vec<String> {
            self.state.lock().unwrap().applied.clone()
        }
    }

    #[async_trait]
    impl SessionBackend for MockSessionBackend {
        async fn server_active(&self) -> Result<bool> {
            let mut state = self.state.lock().unwrap();
            state.probes += 1;
            if state.probes <= state.probe_errors {
                return Err(backend_error("probe failed"));
            }
            Ok(state.active_after.is_some_and(|n| state.probes >= n))
        }

        async fn session_exists(&self, session_id: &str) -> Result<bool> {
            let state = self.state.lock().unwrap();
            if state.list_fails {
                return Err(backend_error("list-sessions failed"));
            }
            Ok(state.sessions.contains(session_id))
        }

        async fn create_session(&self, session_id: &str, _owner: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.create_calls += 1;
            if state.create_fails {
                return Err(backend_error("create-session failed"));
            }
            state.sessions.insert(session_id.to_string());
            Ok(())
        }

        async fn apply_preference(&self, _owner: &str, preference: &Preference) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.failing_keys.contains(&preference.key) {
                return Err(backend_error("gsettings failed"));
            }
            state.applied.push(preference.label());
            Ok(())
        }
    }
}
