//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Manifest has {errors} invalid workload(s)")]
    InvalidManifest { errors: usize },

    #[error("Node '{0}' is not declared in the manifest")]
    UnknownNode(String),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    for cause in err.chain().skip(1) {
        eprintln!("  {} {}", "caused by:".dimmed(), cause);
    }

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::InvalidManifest { .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: direct-tcp workloads must require the 'public-ip' label.".yellow()
                );
            }
            CliError::UnknownNode(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: --down takes node names from the [nodes] table.".yellow()
                );
            }
        }
    }
}
