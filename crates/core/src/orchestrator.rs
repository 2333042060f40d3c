//! Pipeline orchestration and terminal decision
//!
//! The [`Orchestrator`] drives [`execute_step`] over a fixed, ordered list of
//! steps. Steps run strictly one after another; a critical failure is recorded
//! and the pipeline continues so that later independent steps still get the
//! chance to complete.
//!
//! The terminal decision is a pure function of the [`RunSummary`]:
//!
//! - any FAIL result: [`TerminalState::Held`], no restart
//! - otherwise: [`TerminalState::ReadyPendingRestart`], regardless of WARNs
//!
//! [`finalize`] carries the decision out.

use crate::context::RunContext;
use crate::errors::{BootstrapError, ConfigError, Result};
use crate::runner::{run_checked, CommandSpec};
use crate::step::{execute_step, Step, StepPolicy, StepResult, StepStatus};
use crate::store::validate_step_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{info, instrument, warn};

/// Terminal state of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum TerminalState {
    /// At least one critical step failed; the machine is left running as is
    Held,
    /// All critical steps are done; a delayed restart finalizes configuration
    ReadyPendingRestart,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalState::Held => "HELD",
            TerminalState::ReadyPendingRestart => "READY-PENDING-RESTART",
        }
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Ordered step results of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub results: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    /// Number of FAIL results
    pub fn critical_failure_count(&self) -> usize {
        self.count(StepStatus::Fail)
    }

    /// Number of WARN results
    pub fn warning_count(&self) -> usize {
        self.count(StepStatus::Warn)
    }

    /// Number of steps short-circuited by a completion record
    pub fn skipped_count(&self) -> usize {
        self.results.iter().filter(|r| r.skipped).count()
    }

    /// Number of steps whose action actually ran
    pub fn executed_count(&self) -> usize {
        self.results.len() - self.skipped_count()
    }

    fn count(&self, status: StepStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn terminal_state(&self) -> TerminalState {
        if self.critical_failure_count() > 0 {
            TerminalState::Held
        } else {
            TerminalState::ReadyPendingRestart
        }
    }

    /// Result for a step name
    pub fn get(&self, name: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

/// Holds the fixed ordered pipeline
#[derive(Debug)]
pub struct Orchestrator {
    steps: Vec<Step>,
}

impl Orchestrator {
    /// Build an orchestrator, rejecting invalid or duplicate step names
    pub fn new(steps: Vec<Step>) -> Result<Self> {
        let mut seen = HashSet::new();
        for step in &steps {
            validate_step_name(&step.name)?;
            if !seen.insert(step.name.as_str()) {
                return Err(BootstrapError::Config(ConfigError::Validation {
                    message: format!("duplicate step name '{}'", step.name),
                }));
            }
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.iter().any(|s| s.name == name)
    }

    /// Policy of a step, if it is part of the pipeline
    pub fn policy_of(&self, name: &str) -> Option<StepPolicy> {
        self.steps.iter().find(|s| s.name == name).map(|s| s.policy)
    }

    /// Execute every step in order and collect the results
    #[instrument(skip_all, fields(steps = self.steps.len()))]
    pub async fn run(&self, ctx: &RunContext) -> Result<RunSummary> {
        let started_at = Utc::now();
        ctx.reporter.detail(
            None,
            &format!("bootstrap run started ({} steps)", self.steps.len()),
        )?;

        let mut results = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            results.push(execute_step(ctx, step).await?);
        }

        let summary = RunSummary {
            results,
            started_at,
            finished_at: Utc::now(),
        };

        ctx.reporter.detail(
            None,
            &format!(
                "bootstrap run finished: {} executed, {} skipped, {} warnings, {} critical failures",
                summary.executed_count(),
                summary.skipped_count(),
                summary.warning_count(),
                summary.critical_failure_count()
            ),
        )?;
        info!(
            critical_failures = summary.critical_failure_count(),
            warnings = summary.warning_count(),
            "Run finished in state {}",
            summary.terminal_state()
        );
        Ok(summary)
    }
}

/// What [`finalize`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TerminalAction {
    /// A one-time delayed restart was scheduled
    RestartScheduled { delay_minutes: u32 },
    /// Ready, but restarting was disabled by the caller
    RestartSuppressed,
    /// Held; nothing scheduled
    Held,
}

/// Carry out the terminal decision of `summary`
#[instrument(skip_all, fields(state = %summary.terminal_state()))]
pub async fn finalize(
    ctx: &RunContext,
    summary: &RunSummary,
    restart: bool,
) -> Result<TerminalAction> {
    let reporter = &ctx.reporter;
    match summary.terminal_state() {
        TerminalState::Held => {
            let message = format!(
                "HELD: {} critical step(s) failed; not restarting. Inspect {} and re-run.",
                summary.critical_failure_count(),
                reporter.detail_path().display()
            );
            warn!("{}", message);
            reporter.detail(None, &message)?;
            Ok(TerminalAction::Held)
        }
        TerminalState::ReadyPendingRestart if !restart => {
            reporter.detail(None, "READY-PENDING-RESTART: restart suppressed")?;
            info!("Restart suppressed by caller");
            Ok(TerminalAction::RestartSuppressed)
        }
        TerminalState::ReadyPendingRestart => {
            let delay_minutes = ctx.config.restart_delay_minutes;
            let spec = CommandSpec::new("shutdown")
                .arg("-r")
                .arg(format!("+{}", delay_minutes));
            reporter.detail(
                None,
                &format!(
                    "READY-PENDING-RESTART: scheduling restart in {} minute(s)",
                    delay_minutes
                ),
            )?;
            run_checked(ctx.runner.as_ref(), &spec).await?;
            info!("Restart scheduled in {} minute(s)", delay_minutes);
            Ok(TerminalAction::RestartScheduled { delay_minutes })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::FnAction;

    fn result(name: &str, status: StepStatus) -> StepResult {
        StepResult {
            name: name.to_string(),
            status,
            policy: if status == StepStatus::Fail {
                StepPolicy::Critical
            } else {
                StepPolicy::Optional
            },
            detail: None,
            skipped: false,
            duration_ms: 0,
        }
    }

    fn summary(results: Vec<StepResult>) -> RunSummary {
        RunSummary {
            results,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_terminal_state_ignores_warnings() {
        let s = summary(vec![
            result("a", StepStatus::Ok),
            result("b", StepStatus::Warn),
            result("c", StepStatus::Ok),
        ]);
        assert_eq!(s.critical_failure_count(), 0);
        assert_eq!(s.warning_count(), 1);
        assert_eq!(s.terminal_state(), TerminalState::ReadyPendingRestart);
    }

    #[test]
    fn test_terminal_state_held_on_any_failure() {
        let s = summary(vec![
            result("a", StepStatus::Ok),
            result("b", StepStatus::Fail),
            result("c", StepStatus::Ok),
        ]);
        assert_eq!(s.critical_failure_count(), 1);
        assert_eq!(s.terminal_state(), TerminalState::Held);
    }

    #[test]
    fn test_empty_summary_is_ready() {
        assert_eq!(
            summary(Vec::new()).terminal_state(),
            TerminalState::ReadyPendingRestart
        );
    }

    #[test]
    fn test_terminal_state_serialization() {
        assert_eq!(
            serde_json::to_string(&TerminalState::ReadyPendingRestart).unwrap(),
            "\"READY-PENDING-RESTART\""
        );
        assert_eq!(
            serde_json::to_string(&TerminalAction::RestartScheduled { delay_minutes: 1 }).unwrap(),
            r#"{"action":"restart_scheduled","delay_minutes":1}"#
        );
    }

    #[test]
    fn test_new_rejects_duplicates_and_invalid_names() {
        let ok = || FnAction::new(|| Ok(()));

        let err = Orchestrator::new(vec![Step::critical("a", ok()), Step::optional("a", ok())])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate step name 'a'"));

        let err = Orchestrator::new(vec![Step::critical("Bad Name", ok())]).unwrap_err();
        assert!(matches!(err, BootstrapError::Store(_)));

        let orchestrator =
            Orchestrator::new(vec![Step::critical("a", ok()), Step::optional("b", ok())]).unwrap();
        assert_eq!(orchestrator.step_names(), vec!["a", "b"]);
        assert_eq!(orchestrator.policy_of("b"), Some(StepPolicy::Optional));
        assert!(!orchestrator.contains("c"));
    }
}
