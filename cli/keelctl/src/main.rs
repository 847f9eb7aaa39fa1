//! keelctl (keel) - operator CLI for the keel reconciler
//!
//! Validates cluster manifests and shows, without touching the cluster, where
//! the reconciler would place every workload and what it would do if nodes
//! were lost.

use anyhow::Result;
use clap::Parser;

mod commands;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Run the command
    if let Err(e) = cli.run().await {
        // Print error in a user-friendly way
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
