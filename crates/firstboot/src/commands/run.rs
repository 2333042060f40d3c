//! Run command implementation
//!
//! Executes the standard pipeline, then schedules the finalizing restart or
//! leaves the machine HELD.

use crate::ui::summary::{render_run, RunOutput};
use anyhow::Result;
use firstboot_core::config::BootstrapConfig;
use firstboot_core::context::RunContext;
use firstboot_core::orchestrator::{finalize, TerminalState};
use firstboot_core::pipeline::standard_pipeline;
use std::io::Write;
use tracing::{debug, instrument};

/// Exit status used for HELD with `--fail-on-held`
pub const HELD_EXIT_CODE: i32 = 2;

/// Error type used to signal an intended exit code for a HELD run
#[derive(Debug)]
pub struct HeldExitCode(pub i32);

impl std::fmt::Display for HeldExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Exit with code {} because critical steps failed (HELD)",
            self.0
        )
    }
}

impl std::error::Error for HeldExitCode {}

/// Run command arguments
#[derive(Debug, Clone)]
pub struct RunArgs {
    /// Schedule the restart when ready
    pub restart: bool,
    /// Turn HELD into a non-zero exit
    pub fail_on_held: bool,
    /// JSON output on stdout
    pub json: bool,
}

/// Execute the run command
#[instrument(skip(config))]
pub async fn execute_run(config: BootstrapConfig, args: RunArgs) -> Result<()> {
    debug!("Starting run command execution");

    let ctx = RunContext::from_config(config);
    run_and_report(&ctx, &args, &mut std::io::stdout()).await
}

/// Run the pipeline, finalize and report to `out`
///
/// The report is written even when finalizing fails, then the failure is
/// returned.
async fn run_and_report(ctx: &RunContext, args: &RunArgs, out: &mut impl Write) -> Result<()> {
    let orchestrator = standard_pipeline(&ctx.config)?;
    let summary = orchestrator.run(ctx).await?;
    let finalized = finalize(ctx, &summary, args.restart).await;

    let output = RunOutput::new(&summary, finalized.as_ref().ok().copied());
    if args.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&output)?)?;
    } else {
        render_run(out, &output, ctx.reporter.summary_path())?;
    }
    finalized?;

    if args.fail_on_held && summary.terminal_state() == TerminalState::Held {
        return Err(HeldExitCode(HELD_EXIT_CODE).into());
    }
    Ok(())
}
