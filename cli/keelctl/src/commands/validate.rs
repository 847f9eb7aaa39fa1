//! Manifest validation.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use keel_controller::ClusterManifest;
use serde::Serialize;

use crate::error::CliError;
use crate::output::{print_problem, print_single, print_success, print_warning, OutputFormat};

use super::CommandContext;

/// Validate a cluster manifest.
#[derive(Debug, Args)]
pub struct ValidateCommand {
    /// Path to the cluster manifest (TOML).
    file: PathBuf,
}

#[derive(Debug, Serialize)]
struct ValidationOutput<'a> {
    file: String,
    valid: bool,
    nodes: usize,
    workloads: usize,
    errors: &'a [String],
    warnings: &'a [String],
}

impl ValidateCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let manifest = ClusterManifest::load(&self.file)?;
        let report = manifest.check();

        match ctx.format {
            OutputFormat::Json => print_single(&ValidationOutput {
                file: self.file.display().to_string(),
                valid: report.is_ok(),
                nodes: manifest.nodes.len(),
                workloads: manifest.workloads.len(),
                errors: &report.errors,
                warnings: &report.warnings,
            }),
            OutputFormat::Table => {
                for error in &report.errors {
                    print_problem(error);
                }
                for warning in &report.warnings {
                    print_warning(warning);
                }
                if report.is_ok() {
                    print_success(&format!(
                        "{} is valid ({} nodes, {} workloads)",
                        self.file.display(),
                        manifest.nodes.len(),
                        manifest.workloads.len()
                    ));
                }
            }
        }

        if !report.is_ok() {
            return Err(CliError::InvalidManifest {
                errors: report.errors.len(),
            }
            .into());
        }
        Ok(())
    }
}
