//! CLI commands.

mod plan;
mod validate;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::output::OutputFormat;

/// keel - validate and dry-run plan cluster manifests.
#[derive(Debug, Parser)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check a cluster manifest for invalid workload specs.
    Validate(validate::ValidateCommand),

    /// Show where every workload would be placed.
    Plan(plan::PlanCommand),

    /// Show CLI version.
    Version,
}

/// Shared state for command execution.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext {
    pub format: OutputFormat,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let format = match self.format.as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        };
        let ctx = CommandContext { format };

        match self.command {
            Commands::Validate(cmd) => cmd.run(ctx),
            Commands::Plan(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("keel {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}
