//! Step executor
//!
//! A [`Step`] is a named action with a failure policy. [`execute_step`] runs it
//! at most once across invocations:
//!
//! 1. a step already recorded in the completion store is reported as
//!    `STEP_OK:<name>:skipped-already-done` without running the action
//! 2. otherwise the action runs; success records completion and reports OK
//! 3. failure reports FAIL (critical) or WARN (optional) and records nothing,
//!    so the step runs again on the next invocation
//!
//! Action failures never abort the caller. The only errors [`execute_step`]
//! returns are completion-store and log faults.

use crate::config::BootstrapConfig;
use crate::context::RunContext;
use crate::errors::{BootstrapError, CommandError, Result};
use crate::report::{Reporter, SummaryEntry, SummaryTag};
use crate::retry::{retry_async, RetryDecision};
use crate::runner::{run_checked, CommandOutput, CommandRunner, CommandSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Detail recorded for a step short-circuited by its completion record
pub const SKIPPED_ALREADY_DONE: &str = "skipped-already-done";

/// What a step's failure means for readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPolicy {
    /// Failure blocks the automatic restart
    Critical,
    /// Failure is a warning only
    Optional,
}

impl StepPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPolicy::Critical => "critical",
            StepPolicy::Optional => "optional",
        }
    }
}

impl fmt::Display for StepPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Outcome of one step in one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    Ok,
    Warn,
    Fail,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Ok => "OK",
            StepStatus::Warn => "WARN",
            StepStatus::Fail => "FAIL",
        }
    }

    fn summary_tag(&self) -> SummaryTag {
        match self {
            StepStatus::Ok => SummaryTag::Ok,
            StepStatus::Warn => SummaryTag::Warn,
            StepStatus::Fail => SummaryTag::Fail,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Structured result of [`execute_step`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub policy: StepPolicy,
    /// Skip marker or failure message
    pub detail: Option<String>,
    /// Whether the action was short-circuited by an existing completion record
    pub skipped: bool,
    pub duration_ms: u64,
}

impl StepResult {
    /// The summary-log line for this result
    pub fn summary_entry(&self) -> SummaryEntry {
        SummaryEntry::new(self.status.summary_tag(), &self.name, self.detail.clone())
    }
}

/// Context handed to a running action
pub struct ActionContext<'a> {
    step: &'a str,
    run: &'a RunContext,
}

impl<'a> ActionContext<'a> {
    pub fn new(step: &'a str, run: &'a RunContext) -> Self {
        Self { step, run }
    }

    /// Name of the running step
    pub fn step(&self) -> &str {
        self.step
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.run.config
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.run.runner.as_ref()
    }

    pub fn reporter(&self) -> &Reporter {
        &self.run.reporter
    }

    /// Append a line to the detail log under this step
    pub fn log(&self, message: &str) -> Result<()> {
        self.run.reporter.detail(Some(self.step), message)
    }

    /// Emit an informational summary line for this step
    pub fn info(&self, message: &str) -> Result<()> {
        self.run.reporter.info(self.step, message)
    }

    /// Run a command; a non-zero exit fails with the command in the error.
    /// Output is appended to the detail log either way.
    pub async fn exec(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.log(&format!("$ {}", spec))?;
        let result = run_checked(self.runner(), spec).await;
        match &result {
            Ok(output) => self.log_output(output)?,
            Err(BootstrapError::Command(CommandError::Failed { code, .. })) => {
                self.log(&format!("command exited with {:?}", code))?;
            }
            Err(_) => {}
        }
        result
    }

    /// Run a command subject to transient failure under the configured retry
    /// policy
    pub async fn exec_transient(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let retry = self.config().retry.to_retry_config();
        retry_async(&retry, move || self.exec(spec), transient_classifier).await
    }

    fn log_output(&self, output: &CommandOutput) -> Result<()> {
        for stream in [&output.stdout, &output.stderr] {
            let trimmed = stream.trim_end();
            if !trimmed.is_empty() {
                self.log(trimmed)?;
            }
        }
        Ok(())
    }
}

/// A missing program will not appear by retrying
fn transient_classifier(error: &BootstrapError) -> RetryDecision {
    match error {
        BootstrapError::Command(CommandError::Spawn { .. }) => RetryDecision::Stop,
        BootstrapError::Report(_) => RetryDecision::Stop,
        _ => RetryDecision::Retry,
    }
}

/// The work a step performs
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Perform the action. `Err` is a step failure.
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<()>;
}

/// A named action under a failure policy
pub struct Step {
    pub name: String,
    pub policy: StepPolicy,
    pub action: Box<dyn StepAction>,
}

impl Step {
    pub fn new(name: impl Into<String>, policy: StepPolicy, action: impl StepAction + 'static) -> Self {
        Self {
            name: name.into(),
            policy,
            action: Box::new(action),
        }
    }

    pub fn critical(name: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self::new(name, StepPolicy::Critical, action)
    }

    pub fn optional(name: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self::new(name, StepPolicy::Optional, action)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// One command of a [`ShellAction`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub spec: CommandSpec,
    /// Wrapped in the retry policy
    pub transient: bool,
}

/// Ordered list of commands; the first failing command fails the action
#[derive(Debug, Clone, Default)]
pub struct ShellAction {
    commands: Vec<ShellCommand>,
}

impl ShellAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(mut self, spec: CommandSpec) -> Self {
        self.commands.push(ShellCommand {
            spec,
            transient: false,
        });
        self
    }

    pub fn transient(mut self, spec: CommandSpec) -> Self {
        self.commands.push(ShellCommand {
            spec,
            transient: true,
        });
        self
    }

    /// `bash -c` script
    pub fn script(self, script: impl Into<String>) -> Self {
        self.command(CommandSpec::shell(script))
    }

    /// `bash -c` script wrapped in the retry policy
    pub fn transient_script(self, script: impl Into<String>) -> Self {
        self.transient(CommandSpec::shell(script))
    }

    pub fn commands(&self) -> &[ShellCommand] {
        &self.commands
    }
}

#[async_trait]
impl StepAction for ShellAction {
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<()> {
        for command in &self.commands {
            if command.transient {
                ctx.exec_transient(&command.spec).await?;
            } else {
                ctx.exec(&command.spec).await?;
            }
        }
        Ok(())
    }
}

/// Action backed by a plain closure
pub struct FnAction<F>(F);

impl<F> FnAction<F>
where
    F: Fn() -> Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> StepAction for FnAction<F>
where
    F: Fn() -> Result<()> + Send + Sync,
{
    async fn run(&self, _ctx: &ActionContext<'_>) -> Result<()> {
        (self.0)()
    }
}

/// Execute one step under its policy, consulting and updating the completion
/// store and reporting exactly one detail block and one summary line.
#[instrument(skip_all, fields(step = %step.name, policy = %step.policy))]
pub async fn execute_step(ctx: &RunContext, step: &Step) -> Result<StepResult> {
    let reporter = &ctx.reporter;

    if ctx.store.is_done(&step.name)? {
        debug!("Step {} already done, skipping", step.name);
        reporter.detail(Some(&step.name), "already done, skipping")?;
        let result = StepResult {
            name: step.name.clone(),
            status: StepStatus::Ok,
            policy: step.policy,
            detail: Some(SKIPPED_ALREADY_DONE.to_string()),
            skipped: true,
            duration_ms: 0,
        };
        reporter.summary(&result.summary_entry())?;
        return Ok(result);
    }

    reporter.detail(Some(&step.name), &format!("=== starting ({}) ===", step.policy))?;
    info!("Running step {}", step.name);

    let started = Instant::now();
    let outcome = step.action.run(&ActionContext::new(&step.name, ctx)).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (status, detail) = match outcome {
        Ok(()) => {
            ctx.store.mark_done(&step.name)?;
            reporter.detail(
                Some(&step.name),
                &format!("=== succeeded in {} ms ===", duration_ms),
            )?;
            (StepStatus::Ok, None)
        }
        Err(e) => {
            let message = reporter.redactor().redact(&e.summary());
            let status = match step.policy {
                StepPolicy::Critical => {
                    error!("Critical step {} failed: {}", step.name, message);
                    StepStatus::Fail
                }
                StepPolicy::Optional => {
                    warn!("Optional step {} failed: {}", step.name, message);
                    StepStatus::Warn
                }
            };
            reporter.detail(
                Some(&step.name),
                &format!("=== {} after {} ms: {} ===", status, duration_ms, e),
            )?;
            (status, Some(message))
        }
    };

    let result = StepResult {
        name: step.name.clone(),
        status,
        policy: step.policy,
        detail,
        skipped: false,
        duration_ms,
    };
    reporter.summary(&result.summary_entry())?;
    Ok(result)
}
