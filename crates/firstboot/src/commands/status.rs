//! Status command implementation

use crate::ui::summary::{render_status, StatusRow};
use anyhow::Result;
use firstboot_core::config::BootstrapConfig;
use firstboot_core::context::RunContext;
use firstboot_core::pipeline::standard_pipeline;
use firstboot_core::report::SummaryTag;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// JSON shape of `firstboot status --json`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state_dir: PathBuf,
    pub summary_file: PathBuf,
    pub steps: Vec<StatusRow>,
}

/// Collect completion state and last summary entry for every pipeline step
pub fn collect_status(ctx: &RunContext) -> Result<StatusReport> {
    let orchestrator = standard_pipeline(&ctx.config)?;

    let records: HashMap<String, _> = ctx
        .store
        .completed()?
        .into_iter()
        .map(|r| (r.name.clone(), r))
        .collect();

    // last outcome per step; informational lines do not count
    let mut last = HashMap::new();
    for entry in ctx.reporter.read_summary()? {
        if entry.tag != SummaryTag::Info {
            last.insert(entry.step.clone(), entry);
        }
    }

    let steps = orchestrator
        .steps()
        .iter()
        .map(|step| {
            let record = records.get(&step.name);
            StatusRow {
                name: step.name.clone(),
                policy: step.policy,
                done: record.is_some(),
                completed_at: record.and_then(|r| r.completed_at),
                last_result: last.get(&step.name).map(ToString::to_string),
            }
        })
        .collect();

    Ok(StatusReport {
        state_dir: ctx.config.state_dir.clone(),
        summary_file: ctx.config.summary_file.clone(),
        steps,
    })
}

/// Execute the status command
pub fn execute_status(config: BootstrapConfig, json: bool) -> Result<()> {
    let ctx = RunContext::from_config(config);
    let report = collect_status(&ctx)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        render_status(&report.steps);
    }
    Ok(())
}
