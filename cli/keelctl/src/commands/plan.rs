//! Dry-run placement planning.
//!
//! Runs the real reconciler in memory against the manifest with every node
//! Ready, then (with `--down`) marks the given nodes lost and runs it again.
//! Orchestrator intents are only recorded, never sent.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use keel_controller::events;
use keel_controller::{
    ClusterManifest, DryRunOrchestrator, FailoverConfig, FailoverController, NodeRegistry,
    ReconcileLoop, WorkloadSpecStore, WorkloadStatus,
};
use keel_events::Liveness;
use keel_id::{NodeName, WorkloadName};
use keel_reconcile::DEFAULT_SWEEP_INTERVAL;
use serde::Serialize;
use tabled::Tabled;
use tokio::time::Instant;

use crate::error::CliError;
use crate::output::{print_info, print_output, print_warning, OutputFormat};

use super::CommandContext;

/// Plan placements for a manifest.
#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Path to the cluster manifest (TOML).
    file: PathBuf,

    /// Treat this node as lost (repeatable).
    #[arg(long = "down", value_name = "NODE")]
    down: Vec<String>,
}

/// One row of the plan.
#[derive(Debug, Clone, Serialize, Tabled)]
struct PlanRow {
    #[tabled(rename = "Workload")]
    workload: String,

    #[tabled(rename = "Status")]
    status: String,

    #[tabled(rename = "Phase")]
    phase: String,

    #[tabled(rename = "Nodes")]
    nodes: String,

    #[tabled(rename = "Volume")]
    volume: String,

    #[tabled(rename = "Moved From")]
    moved_from: String,
}

/// Rows of a plan plus the manifest problems met while seeding it.
struct Plan {
    rows: Vec<PlanRow>,
    problems: Vec<String>,
}

impl PlanCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let manifest = ClusterManifest::load(&self.file)?;

        let down = self
            .down
            .iter()
            .map(|raw| {
                let name: NodeName = raw.parse().map_err(anyhow::Error::from)?;
                if !manifest.nodes.contains_key(&name) {
                    return Err(CliError::UnknownNode(raw.clone()).into());
                }
                Ok(name)
            })
            .collect::<Result<Vec<_>>>()?;

        let plan = plan(&manifest, &down).await?;

        if ctx.format == OutputFormat::Table {
            for problem in &plan.problems {
                print_warning(problem);
            }
            if !down.is_empty() {
                print_info(&format!(
                    "Planning with {} node(s) down: {}",
                    down.len(),
                    self.down.join(", ")
                ));
            }
        }

        print_output(&plan.rows, ctx.format);
        Ok(())
    }
}

async fn plan(manifest: &ClusterManifest, down: &[NodeName]) -> Result<Plan> {
    // Zero grace: a node marked down is lost as soon as the grace timer is checked.
    let (publisher, stream) = events::channel();
    let registry = Arc::new(NodeRegistry::new(publisher.clone(), Duration::ZERO));
    let store = Arc::new(WorkloadSpecStore::new(publisher));

    let problems = manifest
        .seed(&registry, &store)
        .await
        .iter()
        .map(ToString::to_string)
        .collect();
    for node in manifest.nodes() {
        registry.update_liveness(&node.name, Liveness::Ready).await?;
    }

    let controller =
        FailoverController::new(Arc::new(DryRunOrchestrator), FailoverConfig::default());
    let mut reconcile = ReconcileLoop::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        controller,
        stream,
        DEFAULT_SWEEP_INTERVAL,
    );

    reconcile.drain_pending().await;
    reconcile.controller_mut().wait_for_rebinds().await;
    let baseline = placements(&reconcile.controller().statuses().await);

    if !down.is_empty() {
        for node in down {
            registry.update_liveness(node, Liveness::NotReady).await?;
        }
        registry.expire_grace(Instant::now()).await;
        reconcile.drain_pending().await;
        reconcile.controller_mut().wait_for_rebinds().await;
    }

    let rows = reconcile
        .controller()
        .statuses()
        .await
        .iter()
        .map(|status| row(status, &baseline))
        .collect();

    Ok(Plan { rows, problems })
}

fn placements(statuses: &[WorkloadStatus]) -> BTreeMap<WorkloadName, Vec<NodeName>> {
    statuses
        .iter()
        .map(|s| {
            let nodes = s.decision.as_ref().map(|d| d.nodes.clone()).unwrap_or_default();
            (s.workload.clone(), nodes)
        })
        .collect()
}

fn join(nodes: &[NodeName]) -> String {
    if nodes.is_empty() {
        return "-".to_string();
    }
    nodes
        .iter()
        .map(|n| n.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn row(status: &WorkloadStatus, baseline: &BTreeMap<WorkloadName, Vec<NodeName>>) -> PlanRow {
    let nodes = status
        .decision
        .as_ref()
        .map(|d| d.nodes.clone())
        .unwrap_or_default();
    let before = baseline.get(&status.workload).cloned().unwrap_or_default();

    let volume = match &status.binding {
        Some(binding) => match &binding.attached_node {
            Some(node) => format!("{} @ {}", binding.volume, node),
            None => format!("{} (detached)", binding.volume),
        },
        None => "-".to_string(),
    };

    PlanRow {
        workload: status.workload.to_string(),
        status: status
            .decision
            .as_ref()
            .map(|d| d.status.to_string())
            .unwrap_or_else(|| "pending".to_string()),
        phase: status.phase.to_string(),
        nodes: join(&nodes),
        volume,
        moved_from: if before == nodes {
            "-".to_string()
        } else {
            join(&before)
        },
    }
}
