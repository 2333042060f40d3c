//! Run and status rendering
//!
//! Output contracts:
//! - JSON mode: structured results to stdout, logs to stderr
//! - Text mode: human-readable table to stdout, logs to stderr

use chrono::{DateTime, Utc};
use console::style;
use firstboot_core::orchestrator::{RunSummary, TerminalAction, TerminalState};
use firstboot_core::step::{StepPolicy, StepResult, StepStatus};
use serde::Serialize;
use std::io::{self, Write};
use std::path::Path;

/// JSON shape of `firstboot run --json`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    pub state: TerminalState,
    pub critical_failure_count: usize,
    pub warning_count: usize,
    pub skipped_count: usize,
    /// Absent when the terminal action itself failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<TerminalAction>,
    pub results: Vec<StepResult>,
}

impl RunOutput {
    pub fn new(summary: &RunSummary, action: Option<TerminalAction>) -> Self {
        Self {
            state: summary.terminal_state(),
            critical_failure_count: summary.critical_failure_count(),
            warning_count: summary.warning_count(),
            skipped_count: summary.skipped_count(),
            action,
            results: summary.results.clone(),
        }
    }

    /// Human-readable table
    pub fn to_text(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("{}\n", style("Bootstrap Summary").bold()));

        for result in &self.results {
            let (icon, label) = match (result.status, result.skipped) {
                (StepStatus::Ok, true) => (style("[--]").dim(), style("skipped (done)").dim()),
                (StepStatus::Ok, false) => (style("[OK]").green(), style("ok").green()),
                (StepStatus::Warn, _) => (style("[!]").yellow(), style("warning").yellow()),
                (StepStatus::Fail, _) => (style("[X]").red(), style("FAILED").red().bold()),
            };
            let detail = match (&result.detail, result.skipped) {
                (Some(detail), false) => format!(" ({})", style(detail).italic()),
                _ => String::new(),
            };
            output.push_str(&format!(
                "  {} {:<22} {:<9} {}{}\n",
                icon, result.name, result.policy, label, detail
            ));
        }

        let action = match self.action {
            Some(TerminalAction::RestartScheduled { delay_minutes }) => {
                format!("restart scheduled in {} minute(s)", delay_minutes)
            }
            Some(TerminalAction::RestartSuppressed) => "restart suppressed".to_string(),
            Some(TerminalAction::Held) => "no restart".to_string(),
            None => "restart could not be scheduled".to_string(),
        };
        let message = format!(
            "{}: {} critical failure(s), {} warning(s); {}",
            self.state, self.critical_failure_count, self.warning_count, action
        );
        let styled = match self.state {
            TerminalState::Held => style(message).red().bold(),
            TerminalState::ReadyPendingRestart => style(message).green(),
        };
        output.push_str(&format!("\n{}\n", styled));
        output
    }
}

/// Write the run table followed by the summary log location
pub fn render_run(
    out: &mut impl Write,
    output: &RunOutput,
    summary_path: &Path,
) -> io::Result<()> {
    write!(out, "{}", output.to_text())?;
    writeln!(out, "Summary log: {}", summary_path.display())
}

/// One step in `firstboot status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRow {
    pub name: String,
    pub policy: StepPolicy,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last summary-log line for this step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<String>,
}

pub fn status_text(rows: &[StatusRow]) -> String {
    let mut output = String::new();
    for row in rows {
        let state = if row.done {
            style("done").green()
        } else {
            style("pending").dim()
        };
        let when = row
            .completed_at
            .map(|t| t.format(" %Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let last = row
            .last_result
            .as_deref()
            .map(|l| format!("  last: {}", l))
            .unwrap_or_default();
        output.push_str(&format!(
            "{:<22} {:<9} {}{}{}\n",
            row.name, row.policy, state, when, last
        ));
    }
    output
}

pub fn render_status(rows: &[StatusRow]) {
    print!("{}", status_text(rows));
}
