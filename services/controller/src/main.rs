//! keel controller
//!
//! Runs the placement and failover reconciler for one cluster. Nodes and
//! workload specs come from the cluster manifest; node liveness arrives as
//! JSON lines on stdin.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use keel_controller::config::Config;
use keel_controller::feed::run_liveness_feed;
use keel_controller::{
    events, ClusterManifest, DryRunOrchestrator, FailoverController, NodeRegistry, ReconcileLoop,
    WorkloadSpecStore,
};
use keel_events::Liveness;
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        cluster_file = %config.cluster_file.display(),
        grace_period_secs = config.grace_period.as_secs(),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        attach_timeout_secs = config.attach_timeout.as_secs(),
        "Starting keel controller"
    );

    let manifest = ClusterManifest::load(&config.cluster_file)?;

    let (publisher, stream) = events::channel();
    let registry = Arc::new(NodeRegistry::new(publisher.clone(), config.grace_period));
    let store = Arc::new(WorkloadSpecStore::new(publisher));

    for problem in manifest.seed(&registry, &store).await {
        warn!(error = %problem, "Manifest entry rejected");
    }

    if config.assume_ready {
        for node in manifest.nodes() {
            registry.update_liveness(&node.name, Liveness::Ready).await?;
        }
    }

    // Intents are logged only; the cluster applies them through its own manifests.
    let orchestrator = Arc::new(DryRunOrchestrator);
    let controller = FailoverController::new(orchestrator, config.failover());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconcile_loop = ReconcileLoop::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        controller,
        stream,
        config.sweep_interval,
    );
    let mut loop_handle = tokio::spawn(reconcile_loop.run(shutdown_rx.clone()));

    let feed_handle = config.liveness_from_stdin.then(|| {
        let registry = Arc::clone(&registry);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(tokio::io::stdin());
            match run_liveness_feed(reader, &registry, shutdown_rx).await {
                Ok(stats) => info!(
                    lines = stats.lines,
                    transitions = stats.transitions,
                    rejected = stats.rejected,
                    "Liveness feed finished"
                ),
                Err(e) => error!(error = %e, "Liveness feed failed"),
            }
        })
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut loop_handle => {
            if let Err(e) = result {
                error!(error = %e, "Reconciliation loop panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if !loop_handle.is_finished()
        && tokio::time::timeout(Duration::from_secs(5), &mut loop_handle)
            .await
            .is_err()
    {
        warn!("Reconciliation loop did not stop in time");
    }
    if let Some(handle) = feed_handle {
        handle.abort();
    }

    info!("keel controller shutdown complete");
    Ok(())
}
