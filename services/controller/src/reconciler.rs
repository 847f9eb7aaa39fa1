//! Reconciliation loop.
//!
//! The single coordinating driver. It:
//! - consumes node and spec events in order, skipping redelivered ones
//! - dispatches each event to the failover controller for the affected workloads
//! - wakes at the earliest grace deadline to declare silent nodes lost
//! - runs a full sweep on a fixed interval to catch anything missed

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use keel_events::{ClusterEvent, EventEnvelope};
use keel_id::{NodeName, WorkloadName};
use keel_reconcile::Checkpoint;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::events::EventStream;
use crate::failover::{Action, FailoverController, Phase, StatusView};
use crate::model::{DecisionStatus, Trigger};
use crate::registry::NodeRegistry;
use crate::store::WorkloadSpecStore;

/// Statistics from one event or sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub workloads_evaluated: u32,
    pub bound: u32,
    pub rebinds_started: u32,
    pub degraded: u32,
    pub deferred: u32,
    pub removed: u32,
    pub events_skipped: u32,
}

impl ReconcileStats {
    fn record(&mut self, action: Action) {
        self.workloads_evaluated += 1;
        match action {
            Action::Unchanged => {}
            Action::Bound => self.bound += 1,
            Action::RebindStarted => self.rebinds_started += 1,
            Action::Degraded => self.degraded += 1,
            Action::Deferred => self.deferred += 1,
        }
    }

    fn merge(&mut self, other: &ReconcileStats) {
        self.workloads_evaluated += other.workloads_evaluated;
        self.bound += other.bound;
        self.rebinds_started += other.rebinds_started;
        self.degraded += other.degraded;
        self.deferred += other.deferred;
        self.removed += other.removed;
        self.events_skipped += other.events_skipped;
    }

    /// Returns true if anything was sent to the orchestrator or changed state.
    pub fn changed(&self) -> bool {
        self.bound + self.rebinds_started + self.degraded + self.removed > 0
    }
}

/// The reconciliation loop.
pub struct ReconcileLoop {
    registry: Arc<NodeRegistry>,
    store: Arc<WorkloadSpecStore>,
    controller: FailoverController,
    events: EventStream,
    checkpoint: Checkpoint,
    sweep_interval: Duration,
}

impl ReconcileLoop {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<WorkloadSpecStore>,
        controller: FailoverController,
        events: EventStream,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            controller,
            events,
            checkpoint: Checkpoint::default(),
            sweep_interval,
        }
    }

    pub fn status_view(&self) -> StatusView {
        self.controller.status_view()
    }

    pub fn controller(&self) -> &FailoverController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut FailoverController {
        &mut self.controller
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Run until shutdown is signaled. The first sweep runs immediately.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let grace_period_secs = self.registry.snapshot().await.grace_period().as_secs();
        info!(
            sweep_interval_secs = self.sweep_interval.as_secs(),
            grace_period_secs,
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let grace_deadline = self.registry.next_grace_deadline().await;

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciliation loop shutting down");
                        break;
                    }
                }
                maybe = self.events.recv() => {
                    let Some(envelope) = maybe else {
                        warn!("Event stream closed, stopping reconciliation loop");
                        break;
                    };
                    self.handle_event(envelope).await;
                }
                _ = interval.tick() => {
                    let stats = self.sweep().await;
                    if stats.changed() {
                        info!(
                            workloads_evaluated = stats.workloads_evaluated,
                            bound = stats.bound,
                            rebinds_started = stats.rebinds_started,
                            degraded = stats.degraded,
                            removed = stats.removed,
                            "Sweep complete"
                        );
                    }
                }
                _ = sleep_until(grace_deadline) => {
                    // Lost nodes come back through the event stream.
                    self.registry.expire_grace(Instant::now()).await;
                }
            }
        }

        self.controller.shutdown().await;
    }

    /// Apply one event, unless it was already applied.
    pub async fn handle_event(&mut self, envelope: EventEnvelope) -> ReconcileStats {
        let event_id = envelope.event_id.value();
        if self.checkpoint.is_processed(event_id) {
            debug!(
                event_id,
                event_type = envelope.event_type(),
                "Skipping already processed event"
            );
            return ReconcileStats {
                events_skipped: 1,
                ..Default::default()
            };
        }

        debug!(
            event_id,
            event_type = envelope.event_type(),
            aggregate_id = %envelope.aggregate_id,
            "Handling event"
        );

        let stats = match &envelope.event {
            ClusterEvent::NodeRegistered(_) => {
                let affected = self.workloads_needing_placement().await;
                self.reconcile_workloads(affected, Trigger::NodeJoined).await
            }
            ClusterEvent::NodeLivenessChanged(p) => {
                let mut affected: BTreeSet<WorkloadName> =
                    self.controller.workloads_on(&p.node).await.into_iter().collect();
                if p.new_liveness.is_ready() {
                    affected.extend(self.workloads_needing_placement().await);
                }
                self.reconcile_workloads(affected, Trigger::LivenessChanged)
                    .await
            }
            ClusterEvent::NodeLost(p) => self.node_gone(&p.node).await,
            ClusterEvent::NodeDecommissioned(p) => self.node_gone(&p.node).await,
            ClusterEvent::WorkloadSpecPut(p) => {
                self.reconcile_workloads([p.workload.clone()], Trigger::SpecChanged)
                    .await
            }
            ClusterEvent::WorkloadSpecDeleted(p) => self.forget(&p.workload).await,
        };

        self.checkpoint.advance(event_id);
        stats
    }

    /// Re-evaluate every stored workload and drop state for deleted ones.
    pub async fn sweep(&mut self) -> ReconcileStats {
        self.registry.expire_grace(Instant::now()).await;

        let snapshot = self.registry.snapshot().await;
        let specs = self.store.list().await;
        let mut stats = ReconcileStats::default();

        let known: BTreeSet<WorkloadName> = specs.iter().map(|s| s.name.clone()).collect();
        for status in self.controller.statuses().await {
            if !known.contains(&status.workload) {
                stats.merge(&self.forget(&status.workload).await);
            }
        }

        for spec in specs {
            let action = self.controller.reconcile(&spec, &snapshot, Trigger::Sweep).await;
            stats.record(action);
        }

        debug!(workloads = stats.workloads_evaluated, "Sweep finished");
        stats
    }

    /// Process every event already queued, without waiting for more.
    pub async fn drain_pending(&mut self) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        while let Ok(envelope) = self.events.try_recv() {
            stats.merge(&self.handle_event(envelope).await);
        }
        stats
    }

    async fn node_gone(&mut self, node: &NodeName) -> ReconcileStats {
        let affected = self.controller.workloads_on(node).await;
        if !affected.is_empty() {
            info!(node = %node, workloads = ?affected, "Node gone, failing over workloads");
        }
        self.reconcile_workloads(affected, Trigger::NodeLost).await
    }

    async fn forget(&mut self, workload: &WorkloadName) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        // A put may have raced ahead of the delete event.
        if self.store.get(workload).await.is_some() {
            return stats;
        }
        if self.controller.remove(workload).await.is_some() {
            stats.removed += 1;
        }
        stats
    }

    /// Workloads with no placement yet, or one that could improve.
    async fn workloads_needing_placement(&self) -> Vec<WorkloadName> {
        let statuses = self.controller.status_view();
        let mut out = Vec::new();
        for spec in self.store.list().await {
            let needs = match statuses.get(&spec.name).await {
                None => true,
                Some(status) => {
                    matches!(status.phase, Phase::Degraded | Phase::Evaluating)
                        || status
                            .decision
                            .is_some_and(|d| d.status == DecisionStatus::Partial)
                }
            };
            if needs {
                out.push(spec.name.clone());
            }
        }
        out
    }

    async fn reconcile_workloads(
        &mut self,
        workloads: impl IntoIterator<Item = WorkloadName>,
        trigger: Trigger,
    ) -> ReconcileStats {
        let snapshot = self.registry.snapshot().await;
        let mut stats = ReconcileStats::default();

        for workload in workloads {
            let Some(spec) = self.store.get(&workload).await else {
                continue;
            };
            let action = self.controller.reconcile(&spec, &snapshot, trigger).await;
            stats.record(action);
        }

        stats
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
