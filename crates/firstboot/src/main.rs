use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod ui;

#[tokio::main]
async fn main() -> Result<()> {
    let parsed = cli::Cli::parse();

    match parsed.dispatch().await {
        Ok(()) => Ok(()),
        Err(err) => {
            // HELD with --fail-on-held
            if let Some(held) = err.downcast_ref::<commands::run::HeldExitCode>() {
                eprintln!("{}", held);
                std::process::exit(held.0);
            }
            Err(err)
        }
    }
}
