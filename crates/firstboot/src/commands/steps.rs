//! Steps command implementation

use anyhow::Result;
use firstboot_core::config::BootstrapConfig;
use firstboot_core::pipeline::standard_pipeline;

/// Print the pipeline in execution order
pub fn execute_steps(config: BootstrapConfig) -> Result<()> {
    let orchestrator = standard_pipeline(&config)?;
    for (index, step) in orchestrator.steps().iter().enumerate() {
        println!("{:>2}. {:<22} {}", index + 1, step.name, step.policy);
    }
    Ok(())
}
