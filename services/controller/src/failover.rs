//! Failover controller.
//!
//! Drives one state machine per workload:
//!
//! ```text
//! Stable -> Evaluating -> Rebinding -> Stable
//!               |
//!               +-> Degraded (no eligible node)
//! ```
//!
//! Evaluation is synchronous. Rebinding runs in its own task so a slow or
//! failing volume attach on one workload never holds up the others. A rebind
//! task only writes back to the shared status map while holding its write lock
//! and after checking its cancel flag; cancellation sets the flag under the
//! same lock, so a cancelled task can never overwrite newer state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_id::{IntentId, NodeName, VolumeName, WorkloadName};
use keel_reconcile::{BackoffPolicy, SpecHash, DEFAULT_ATTACH_TIMEOUT};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::{
    AccessMode, DecisionStatus, Exposure, PlacementDecision, StorageRequirement, Trigger,
    VolumeBinding, WorkloadSpec,
};
use crate::orchestrator::{bounded, BindIntent, Orchestrator, OrchestratorError, VolumeIntent};
use crate::placement::{evaluate, NodeLoad, PlacementInput};
use crate::registry::ClusterSnapshot;

/// Per-workload failover phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stable,
    Evaluating,
    Rebinding,
    Degraded,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Stable => "stable",
            Phase::Evaluating => "evaluating",
            Phase::Rebinding => "rebinding",
            Phase::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Observable state of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub workload: WorkloadName,
    pub phase: Phase,
    pub decision: Option<PlacementDecision>,
    pub binding: Option<VolumeBinding>,
    /// Spec the orchestrator last accepted a bind for.
    pub bound_spec: Option<SpecHash>,
    /// Node a rebind in flight is attaching to.
    pub rebind_target: Option<NodeName>,
    /// Failed attach attempts of the current rebind.
    pub rebind_attempts: u32,
    pub last_error: Option<String>,
}

impl WorkloadStatus {
    fn new(workload: WorkloadName) -> Self {
        Self {
            workload,
            phase: Phase::Evaluating,
            decision: None,
            binding: None,
            bound_spec: None,
            rebind_target: None,
            rebind_attempts: 0,
            last_error: None,
        }
    }
}

/// What a reconcile call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Already converged, or a rebind toward the same node is in flight.
    Unchanged,
    /// New placement sent to the orchestrator.
    Bound,
    /// A volume rebind task was started.
    RebindStarted,
    /// No eligible node; the workload is left unscheduled.
    Degraded,
    /// The orchestrator refused or timed out; retried on the next pass.
    Deferred,
}

/// Failover timing.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Bound on a single release, attach or bind call.
    pub attach_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
            backoff: BackoffPolicy::default(),
        }
    }
}

type StatusMap = Arc<RwLock<BTreeMap<WorkloadName, WorkloadStatus>>>;

/// Cloneable read handle on workload statuses.
#[derive(Debug, Clone)]
pub struct StatusView(StatusMap);

impl StatusView {
    pub async fn get(&self, workload: &WorkloadName) -> Option<WorkloadStatus> {
        self.0.read().await.get(workload).cloned()
    }

    /// All statuses ordered by workload name.
    pub async fn all(&self) -> Vec<WorkloadStatus> {
        self.0.read().await.values().cloned().collect()
    }
}

struct RebindTask {
    target: NodeName,
    nodes: Vec<NodeName>,
    spec_hash: Option<SpecHash>,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The failover controller.
pub struct FailoverController {
    orchestrator: Arc<dyn Orchestrator>,
    config: FailoverConfig,
    rebinds: BTreeMap<WorkloadName, RebindTask>,
    statuses: StatusMap,
}

impl FailoverController {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, config: FailoverConfig) -> Self {
        Self {
            orchestrator,
            config,
            rebinds: BTreeMap::new(),
            statuses: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn status_view(&self) -> StatusView {
        StatusView(self.statuses.clone())
    }

    pub async fn status(&self, workload: &WorkloadName) -> Option<WorkloadStatus> {
        self.status_view().get(workload).await
    }

    pub async fn statuses(&self) -> Vec<WorkloadStatus> {
        self.status_view().all().await
    }

    /// Workloads with a replica, a volume attachment or a rebind on `node`.
    pub async fn workloads_on(&self, node: &NodeName) -> Vec<WorkloadName> {
        self.statuses
            .read()
            .await
            .values()
            .filter(|s| {
                s.decision.as_ref().is_some_and(|d| d.contains(node))
                    || s.rebind_target.as_ref() == Some(node)
                    || s
                        .binding
                        .as_ref()
                        .is_some_and(|b| b.attached_node.as_ref() == Some(node))
            })
            .map(|s| s.workload.clone())
            .collect()
    }

    /// Returns true if a rebind task for the workload is still running.
    pub fn is_rebinding(&self, workload: &WorkloadName) -> bool {
        self.rebinds
            .get(workload)
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Evaluate one workload against a snapshot and act on the result.
    pub async fn reconcile(
        &mut self,
        spec: &WorkloadSpec,
        snapshot: &ClusterSnapshot,
        reason: Trigger,
    ) -> Action {
        let workload = spec.name.clone();
        let spec_hash = spec.spec_hash().ok();
        if self
            .rebinds
            .get(&workload)
            .is_some_and(|t| t.handle.is_finished())
        {
            self.rebinds.remove(&workload);
        }

        let load = self.load_excluding(&workload).await;
        let current = self
            .statuses
            .write()
            .await
            .entry(workload.clone())
            .or_insert_with(|| WorkloadStatus::new(workload.clone()))
            .clone();

        // A binding for another volume (claim renamed, storage dropped) is stale.
        let volume = spec.volume();
        let binding = match current.binding.clone() {
            Some(b) if Some(&b.volume) == volume.as_ref() => Some(b),
            Some(stale) => {
                if let Some(node) = &stale.attached_node {
                    self.release_best_effort(&stale, node).await;
                }
                None
            }
            None => None,
        };

        let decision = evaluate(&PlacementInput {
            spec,
            snapshot,
            binding: binding.as_ref().and_then(|b| b.attached_node.as_ref()),
            prior: current.decision.as_ref(),
            load: &load,
            reason,
            decided_at: Utc::now(),
        });

        if let Some(task) = self.rebinds.get(&workload) {
            if decision.status != DecisionStatus::Unschedulable
                && task.nodes == decision.nodes
                && task.spec_hash == spec_hash
            {
                debug!(workload = %workload, target = %task.target, "Rebind already in flight");
                return Action::Unchanged;
            }
        }
        let cancelled = self.cancel_rebind(&workload).await;

        if decision.status == DecisionStatus::Unschedulable {
            return self.degrade(current, decision, binding, cancelled).await;
        }

        let volume_ready = match (&spec.storage, &binding) {
            (None, _) => true,
            (Some(_), Some(b)) => b.attached_node.as_ref() == decision.primary(),
            (Some(_), None) => false,
        };
        let unchanged = current
            .decision
            .as_ref()
            .is_some_and(|d| d.same_placement(&decision))
            && spec_hash.is_some()
            && current.bound_spec == spec_hash;

        if unchanged && volume_ready && cancelled.is_none() {
            let mut statuses = self.statuses.write().await;
            if let Some(status) = statuses.get_mut(&workload) {
                status.phase = Phase::Stable;
                status.binding = binding;
            }
            return Action::Unchanged;
        }

        self.set_phase(&workload, Phase::Evaluating).await;
        info!(
            workload = %workload,
            reason = %reason,
            nodes = ?decision.nodes,
            status = %decision.status,
            "Placement changed"
        );

        match &spec.storage {
            Some(storage) if !volume_ready => {
                self.start_rebind(spec, storage, spec_hash, decision, binding, cancelled)
                    .await
            }
            _ => {
                if let (Some(node), Some(b)) = (&cancelled, &binding) {
                    if decision.primary() != Some(node) {
                        self.release_best_effort(b, node).await;
                    }
                }
                self.bind(spec, spec_hash, decision, binding).await
            }
        }
    }

    /// Forget a deleted workload: stop any rebind immediately and release
    /// its volume attachment.
    pub async fn remove(&mut self, workload: &WorkloadName) -> Option<WorkloadStatus> {
        let cancelled = self.cancel_rebind(workload).await;
        let status = self.statuses.write().await.remove(workload)?;

        if let Some(binding) = &status.binding {
            let mut nodes: Vec<&NodeName> = binding.attached_node.iter().collect();
            if let Some(target) = cancelled.as_ref().or(status.rebind_target.as_ref()) {
                if !nodes.contains(&target) {
                    nodes.push(target);
                }
            }
            for node in nodes {
                self.release_best_effort(binding, node).await;
            }
        }

        info!(workload = %workload, phase = %status.phase, "Workload removed");
        Some(status)
    }

    /// Wait for every running rebind to finish.
    pub async fn wait_for_rebinds(&mut self) {
        for (workload, task) in std::mem::take(&mut self.rebinds) {
            let RebindTask { cancel, handle, .. } = task;
            if let Err(e) = handle.await {
                warn!(workload = %workload, error = %e, "Rebind task failed");
            }
            drop(cancel);
        }
    }

    /// Cancel every running rebind.
    pub async fn shutdown(&mut self) {
        let workloads: Vec<_> = self.rebinds.keys().cloned().collect();
        for workload in workloads {
            self.cancel_rebind(&workload).await;
        }
    }

    async fn load_excluding(&self, workload: &WorkloadName) -> NodeLoad {
        let statuses = self.statuses.read().await;
        let mut load = NodeLoad::new();
        for status in statuses.values().filter(|s| &s.workload != workload) {
            if let Some(decision) = &status.decision {
                for node in decision.distinct_nodes() {
                    *load.entry(node.clone()).or_insert(0) += 1;
                }
            }
        }
        load
    }

    async fn set_phase(&self, workload: &WorkloadName, phase: Phase) {
        if let Some(status) = self.statuses.write().await.get_mut(workload) {
            status.phase = phase;
        }
    }

    /// Stop a running rebind. Returns its target if it was still running.
    async fn cancel_rebind(&mut self, workload: &WorkloadName) -> Option<NodeName> {
        let task = self.rebinds.remove(workload)?;
        if task.handle.is_finished() {
            return None;
        }

        {
            let _statuses = self.statuses.write().await;
            let _ = task.cancel.send(true);
        }
        task.handle.abort();

        info!(workload = %workload, target = %task.target, "Cancelled in-flight rebind");
        Some(task.target)
    }

    async fn degrade(
        &self,
        current: WorkloadStatus,
        decision: PlacementDecision,
        binding: Option<VolumeBinding>,
        cancelled: Option<NodeName>,
    ) -> Action {
        let workload = decision.workload.clone();

        // An attach may have reached the cancelled target.
        if let (Some(node), Some(b)) = (&cancelled, &binding) {
            if b.attached_node.as_ref() != Some(node) {
                self.release_best_effort(b, node).await;
            }
        }

        let mut statuses = self.statuses.write().await;
        let Some(status) = statuses.get_mut(&workload) else {
            return Action::Unchanged;
        };

        status.phase = Phase::Degraded;
        status.decision = Some(decision);
        status.binding = binding;
        status.rebind_target = None;
        status.rebind_attempts = 0;
        status.last_error = Some("no eligible node".to_string());

        if current.phase == Phase::Degraded {
            return Action::Unchanged;
        }
        warn!(
            workload = %workload,
            previous = %current.phase,
            "No eligible node, workload degraded"
        );
        Action::Degraded
    }

    async fn bind(
        &self,
        spec: &WorkloadSpec,
        spec_hash: Option<SpecHash>,
        decision: PlacementDecision,
        binding: Option<VolumeBinding>,
    ) -> Action {
        let intent = BindIntent {
            id: IntentId::new(),
            workload: spec.name.clone(),
            nodes: decision.nodes.clone(),
            exposure: spec.exposure,
        };
        let result = bounded(
            "bind",
            self.config.attach_timeout,
            self.orchestrator.bind_workload(&intent),
        )
        .await;

        let mut statuses = self.statuses.write().await;
        let Some(status) = statuses.get_mut(&spec.name) else {
            return Action::Unchanged;
        };

        match result {
            Ok(()) => {
                info!(
                    workload = %spec.name,
                    intent_id = %intent.id,
                    nodes = ?intent.nodes,
                    "Workload bound"
                );
                status.phase = Phase::Stable;
                status.decision = Some(decision);
                status.binding = binding;
                status.bound_spec = spec_hash;
                status.rebind_target = None;
                status.last_error = None;
                Action::Bound
            }
            Err(e) => {
                warn!(workload = %spec.name, error = %e, "Bind failed, will retry");
                status.phase = Phase::Evaluating;
                status.last_error = Some(e.to_string());
                Action::Deferred
            }
        }
    }

    async fn start_rebind(
        &mut self,
        spec: &WorkloadSpec,
        storage: &StorageRequirement,
        spec_hash: Option<SpecHash>,
        decision: PlacementDecision,
        binding: Option<VolumeBinding>,
        cancelled: Option<NodeName>,
    ) -> Action {
        let Some(target) = decision.primary().cloned() else {
            return Action::Unchanged;
        };
        let binding = binding.unwrap_or_else(|| VolumeBinding::detached(spec, storage));

        let mut release_from: Vec<NodeName> = Vec::new();
        for node in binding.attached_node.iter().chain(cancelled.iter()) {
            if node != &target && !release_from.contains(node) {
                release_from.push(node.clone());
            }
        }

        {
            let mut statuses = self.statuses.write().await;
            if let Some(status) = statuses.get_mut(&spec.name) {
                status.phase = Phase::Rebinding;
                status.decision = Some(decision.clone());
                status.binding = Some(binding.clone());
                status.rebind_target = Some(target.clone());
                status.rebind_attempts = 0;
                status.last_error = None;
            }
        }

        info!(
            workload = %spec.name,
            volume = %binding.volume,
            from = ?binding.attached_node,
            to = %target,
            access_mode = %binding.access_mode,
            "Starting volume rebind"
        );

        let job = RebindJob {
            orchestrator: self.orchestrator.clone(),
            statuses: self.statuses.clone(),
            attach_timeout: self.config.attach_timeout,
            backoff: self.config.backoff.clone(),
            workload: spec.name.clone(),
            volume: binding.volume,
            access_mode: binding.access_mode,
            target: target.clone(),
            release_from,
            nodes: decision.nodes.clone(),
            exposure: spec.exposure,
            spec_hash: spec_hash.clone(),
        };
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(job.run(cancel_rx));

        self.rebinds.insert(
            spec.name.clone(),
            RebindTask {
                target,
                nodes: decision.nodes,
                spec_hash,
                cancel,
                handle,
            },
        );
        Action::RebindStarted
    }

    async fn release_best_effort(&self, binding: &VolumeBinding, node: &NodeName) {
        let intent = VolumeIntent {
            id: IntentId::new(),
            workload: binding.workload.clone(),
            volume: binding.volume.clone(),
            node: node.clone(),
            access_mode: binding.access_mode,
        };
        let result = bounded(
            "release",
            self.config.attach_timeout,
            self.orchestrator.release_volume(&intent),
        )
        .await;
        if let Err(e) = result {
            warn!(volume = %binding.volume, node = %node, error = %e, "Volume release failed");
        }
    }
}

/// One volume move, run on its own task.
struct RebindJob {
    orchestrator: Arc<dyn Orchestrator>,
    statuses: StatusMap,
    attach_timeout: Duration,
    backoff: BackoffPolicy,
    workload: WorkloadName,
    volume: VolumeName,
    access_mode: AccessMode,
    target: NodeName,
    /// Nodes that may still hold the volume.
    release_from: Vec<NodeName>,
    nodes: Vec<NodeName>,
    exposure: Exposure,
    spec_hash: Option<SpecHash>,
}

impl RebindJob {
    async fn run(self, mut cancel: watch::Receiver<bool>) {
        // Single writer: break before make.
        if self.access_mode == AccessMode::SingleWriter && !self.release_from.is_empty() {
            for node in &self.release_from {
                tokio::select! {
                    _ = self.release(node) => {}
                    _ = cancel.changed() => return,
                }
            }
            let released = self
                .update(&cancel, |s| {
                    if let Some(binding) = &mut s.binding {
                        binding.attached_node = None;
                    }
                })
                .await;
            if !released {
                return;
            }
        }

        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                r = self.attach_and_bind() => r,
                _ = cancel.changed() => return,
            };
            let Err(e) = result else { break };

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            warn!(
                workload = %self.workload,
                volume = %self.volume,
                target = %self.target,
                attempt,
                retry_in_secs = delay.as_secs(),
                error = %e,
                "Volume attach failed, backing off"
            );

            let error = e.to_string();
            let recorded = self
                .update(&cancel, |s| {
                    s.rebind_attempts = attempt;
                    s.last_error = Some(error);
                })
                .await;
            if !recorded {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.changed() => return,
            }
        }

        // Multi writer: make before break.
        if self.access_mode == AccessMode::MultiWriter {
            for node in &self.release_from {
                tokio::select! {
                    _ = self.release(node) => {}
                    _ = cancel.changed() => return,
                }
            }
        }

        let target = self.target.clone();
        let spec_hash = self.spec_hash.clone();
        let finished = self
            .update(&cancel, |s| {
                s.phase = Phase::Stable;
                s.bound_spec = spec_hash;
                if let Some(binding) = &mut s.binding {
                    binding.attached_node = Some(target);
                }
                s.rebind_target = None;
                s.last_error = None;
            })
            .await;
        if finished {
            info!(
                workload = %self.workload,
                volume = %self.volume,
                node = %self.target,
                attempts = attempt + 1,
                "Volume rebind complete"
            );
        }
    }

    fn intent(&self, node: &NodeName) -> VolumeIntent {
        VolumeIntent {
            id: IntentId::new(),
            workload: self.workload.clone(),
            volume: self.volume.clone(),
            node: node.clone(),
            access_mode: self.access_mode,
        }
    }

    /// Bounded release; a timeout is logged and otherwise ignored.
    async fn release(&self, node: &NodeName) {
        let intent = self.intent(node);
        let result = bounded(
            "release",
            self.attach_timeout,
            self.orchestrator.release_volume(&intent),
        )
        .await;

        match result {
            Ok(()) => debug!(volume = %self.volume, node = %node, "Volume released"),
            Err(e) => warn!(
                volume = %self.volume,
                node = %node,
                error = %e,
                "Volume release did not complete, proceeding"
            ),
        }
    }

    async fn attach_and_bind(&self) -> Result<(), OrchestratorError> {
        let intent = self.intent(&self.target);
        bounded(
            "attach",
            self.attach_timeout,
            self.orchestrator.attach_volume(&intent),
        )
        .await?;

        let bind = BindIntent {
            id: IntentId::new(),
            workload: self.workload.clone(),
            nodes: self.nodes.clone(),
            exposure: self.exposure,
        };
        bounded(
            "bind",
            self.attach_timeout,
            self.orchestrator.bind_workload(&bind),
        )
        .await
    }

    /// Apply `f` to this workload's status unless the job was cancelled.
    async fn update(
        &self,
        cancel: &watch::Receiver<bool>,
        f: impl FnOnce(&mut WorkloadStatus),
    ) -> bool {
        let mut statuses = self.statuses.write().await;
        if *cancel.borrow() {
            return false;
        }
        match statuses.get_mut(&self.workload) {
            Some(status) => {
                f(status);
                true
            }
            None => false,
        }
    }
}
