use crate::commands;
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use firstboot_core::config::ConfigLoader;
use firstboot_core::logging::LOG_FILTER_ENV;
use std::path::PathBuf;

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// First-boot provisioning subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the provisioning pipeline and carry out the terminal decision
    #[command(long_about = "Run the provisioning pipeline and carry out the terminal decision\n\n\
        Steps already recorded as done are skipped. A failing critical step is recorded and the \
        pipeline continues; any critical failure leaves the machine HELD (no restart). Otherwise \
        a one-time delayed restart is scheduled.")]
    Run {
        /// Do not schedule the finalizing restart even when ready
        #[arg(long)]
        no_restart: bool,
        /// Exit with status 2 when the run ends HELD
        #[arg(long)]
        fail_on_held: bool,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show every pipeline step with its completion state
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete completion markers so the steps run again on the next run
    Reset {
        /// Steps to reset
        #[arg(value_name = "STEP", required_unless_present = "all")]
        steps: Vec<String>,
        /// Reset every step
        #[arg(long, conflicts_with = "steps")]
        all: bool,
    },
    /// Wait for the visualization server and ensure the console session exists
    Watch,
    /// List the pipeline steps in order
    Steps,
}

/// First-boot bootstrap orchestrator
#[derive(Debug, Parser)]
#[command(name = "firstboot", version)]
pub struct Cli {
    /// Log format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Configuration file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None,
        };

        let log_level = self.log_level.as_str();
        if std::env::var_os(LOG_FILTER_ENV).is_none() && std::env::var_os("RUST_LOG").is_none() {
            std::env::set_var(
                "RUST_LOG",
                format!("firstboot={},firstboot_core={}", log_level, log_level),
            );
        }
        firstboot_core::logging::init(log_format)?;
        tracing::debug!("CLI initialized with log level: {}", log_level);

        let config = ConfigLoader::discover(self.config.as_deref())?;

        match self.command {
            Commands::Run {
                no_restart,
                fail_on_held,
                json,
            } => {
                commands::run::execute_run(
                    config,
                    commands::run::RunArgs {
                        restart: !no_restart,
                        fail_on_held,
                        json,
                    },
                )
                .await
            }
            Commands::Status { json } => commands::status::execute_status(config, json),
            Commands::Reset { steps, all } => {
                commands::reset::execute_reset(config, commands::reset::ResetArgs { steps, all })
            }
            Commands::Watch => commands::watch::execute_watch(config).await,
            Commands::Steps => commands::steps::execute_steps(config),
        }
    }
}
