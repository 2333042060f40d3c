//! Reset command implementation
//!
//! Operator-facing deletion of completion markers. A reset step runs again on
//! the next `firstboot run`; every other done step stays skipped.

use anyhow::{bail, Result};
use firstboot_core::config::BootstrapConfig;
use firstboot_core::context::RunContext;
use firstboot_core::pipeline::standard_pipeline;
use tracing::info;

/// Reset command arguments
#[derive(Debug, Clone)]
pub struct ResetArgs {
    pub steps: Vec<String>,
    pub all: bool,
}

/// Execute the reset command
pub fn execute_reset(config: BootstrapConfig, args: ResetArgs) -> Result<()> {
    let ctx = RunContext::from_config(config);
    let orchestrator = standard_pipeline(&ctx.config)?;

    let targets: Vec<String> = if args.all {
        ctx.store.completed()?.into_iter().map(|r| r.name).collect()
    } else {
        let unknown: Vec<&str> = args
            .steps
            .iter()
            .map(String::as_str)
            .filter(|name| !orchestrator.contains(name))
            .collect();
        if !unknown.is_empty() {
            bail!(
                "Unknown step(s): {}. Known steps: {}",
                unknown.join(", "),
                orchestrator.step_names().join(", ")
            );
        }
        args.steps
    };

    for name in &targets {
        if ctx.store.clear(name)? {
            info!("Cleared completion marker for {}", name);
            ctx.reporter
                .detail(Some(name.as_str()), "completion marker cleared by operator")?;
            println!("reset {}", name);
        } else {
            println!("{} was not done", name);
        }
    }
    Ok(())
}
