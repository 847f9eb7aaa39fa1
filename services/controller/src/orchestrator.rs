//! Cluster orchestrator interface and implementations.
//!
//! The orchestrator executes what the controller decides:
//! - binding a workload's replicas to nodes
//! - releasing a volume attachment from a node
//! - attaching a volume on a node
//!
//! Every call is an idempotent declarative intent carrying an [`IntentId`].
//! A dry-run implementation logs intents, and a mock records them for tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keel_id::{IntentId, NodeName, VolumeName, WorkloadName};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::model::{AccessMode, Exposure};

/// Intent: run the workload's replicas on these nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindIntent {
    pub id: IntentId,
    pub workload: WorkloadName,
    pub nodes: Vec<NodeName>,
    pub exposure: Exposure,
}

/// Intent: attach or release a volume on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeIntent {
    pub id: IntentId,
    pub workload: WorkloadName,
    pub volume: VolumeName,
    pub node: NodeName,
    pub access_mode: AccessMode,
}

/// Orchestrator errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{operation} did not complete within {}s", elapsed.as_secs())]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("orchestrator rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),
}

impl OrchestratorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Bound an orchestrator call by `limit`.
pub async fn bounded<F, T>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, OrchestratorError>
where
    F: std::future::Future<Output = Result<T, OrchestratorError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(OrchestratorError::Timeout {
            operation,
            elapsed: limit,
        }),
    }
}

/// Cluster orchestrator interface.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Schedule the workload's replicas onto the given nodes.
    async fn bind_workload(&self, intent: &BindIntent) -> Result<(), OrchestratorError>;

    /// Release a volume attachment from a node.
    async fn release_volume(&self, intent: &VolumeIntent) -> Result<(), OrchestratorError>;

    /// Attach a volume on a node.
    async fn attach_volume(&self, intent: &VolumeIntent) -> Result<(), OrchestratorError>;
}

/// Logs every intent and reports success.
#[derive(Debug, Default)]
pub struct DryRunOrchestrator;

#[async_trait]
impl Orchestrator for DryRunOrchestrator {
    async fn bind_workload(&self, intent: &BindIntent) -> Result<(), OrchestratorError> {
        info!(
            intent_id = %intent.id,
            workload = %intent.workload,
            nodes = ?intent.nodes,
            exposure = %intent.exposure,
            "[DRY-RUN] Bind workload"
        );
        Ok(())
    }

    async fn release_volume(&self, intent: &VolumeIntent) -> Result<(), OrchestratorError> {
        info!(
            intent_id = %intent.id,
            volume = %intent.volume,
            node = %intent.node,
            "[DRY-RUN] Release volume"
        );
        Ok(())
    }

    async fn attach_volume(&self, intent: &VolumeIntent) -> Result<(), OrchestratorError> {
        info!(
            intent_id = %intent.id,
            volume = %intent.volume,
            node = %intent.node,
            access_mode = %intent.access_mode,
            "[DRY-RUN] Attach volume"
        );
        Ok(())
    }
}

/// A recorded orchestrator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorCall {
    Bind {
        workload: WorkloadName,
        nodes: Vec<NodeName>,
    },
    Release {
        volume: VolumeName,
        node: NodeName,
    },
    Attach {
        volume: VolumeName,
        node: NodeName,
    },
}

/// Mock orchestrator for testing.
///
/// Records every call. Attach failures and hangs can be injected.
#[derive(Debug, Default)]
pub struct MockOrchestrator {
    calls: Mutex<Vec<OrchestratorCall>>,
    /// Number of upcoming attach calls that fail.
    attach_failures: AtomicU32,
    hang_releases: AtomicBool,
    hang_attaches: AtomicBool,
    reject_binds: AtomicBool,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` attach calls.
    pub fn fail_attaches(&self, n: u32) {
        self.attach_failures.store(n, Ordering::SeqCst);
    }

    /// Make release calls never complete.
    pub fn hang_releases(&self, hang: bool) {
        self.hang_releases.store(hang, Ordering::SeqCst);
    }

    /// Make attach calls never complete.
    pub fn hang_attaches(&self, hang: bool) {
        self.hang_attaches.store(hang, Ordering::SeqCst);
    }

    /// Reject bind calls.
    pub fn reject_binds(&self, reject: bool) {
        self.reject_binds.store(reject, Ordering::SeqCst);
    }

    /// Calls recorded so far.
    pub async fn calls(&self) -> Vec<OrchestratorCall> {
        self.calls.lock().await.clone()
    }

    /// Number of attach calls recorded so far.
    pub async fn attach_count(&self) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| matches!(c, OrchestratorCall::Attach { .. }))
            .count()
    }

    async fn record(&self, call: OrchestratorCall) {
        debug!(?call, "[MOCK] Orchestrator call");
        self.calls.lock().await.push(call);
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn bind_workload(&self, intent: &BindIntent) -> Result<(), OrchestratorError> {
        self.record(OrchestratorCall::Bind {
            workload: intent.workload.clone(),
            nodes: intent.nodes.clone(),
        })
        .await;

        if self.reject_binds.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Rejected {
                operation: "bind",
                reason: "mock configured to reject".to_string(),
            });
        }
        Ok(())
    }

    async fn release_volume(&self, intent: &VolumeIntent) -> Result<(), OrchestratorError> {
        self.record(OrchestratorCall::Release {
            volume: intent.volume.clone(),
            node: intent.node.clone(),
        })
        .await;

        if self.hang_releases.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn attach_volume(&self, intent: &VolumeIntent) -> Result<(), OrchestratorError> {
        self.record(OrchestratorCall::Attach {
            volume: intent.volume.clone(),
            node: intent.node.clone(),
        })
        .await;

        if self.hang_attaches.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let failed = self
            .attach_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(OrchestratorError::Rejected {
                operation: "attach",
                reason: "mock attach failure".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume_intent() -> VolumeIntent {
        VolumeIntent {
            id: IntentId::new(),
            workload: "postgres".parse().unwrap(),
            volume: "data-postgres".parse().unwrap(),
            node: "k3s-worker".parse().unwrap(),
            access_mode: AccessMode::SingleWriter,
        }
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let orchestrator = MockOrchestrator::new();
        let intent = volume_intent();

        orchestrator.release_volume(&intent).await.unwrap();
        orchestrator.attach_volume(&intent).await.unwrap();

        let calls = orchestrator.calls().await;
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], OrchestratorCall::Release { .. }));
        assert_eq!(orchestrator.attach_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_injected_attach_failures() {
        let orchestrator = MockOrchestrator::new();
        orchestrator.fail_attaches(2);
        let intent = volume_intent();

        assert!(orchestrator.attach_volume(&intent).await.is_err());
        assert!(orchestrator.attach_volume(&intent).await.is_err());
        assert!(orchestrator.attach_volume(&intent).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out_hung_call() {
        let orchestrator = MockOrchestrator::new();
        orchestrator.hang_releases(true);
        let intent = volume_intent();

        let err = bounded(
            "release",
            Duration::from_secs(120),
            orchestrator.release_volume(&intent),
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "release did not complete within 120s");
    }

    #[tokio::test]
    async fn test_dry_run_accepts_everything() {
        let orchestrator = DryRunOrchestrator;
        let bind = BindIntent {
            id: IntentId::new(),
            workload: "web".parse().unwrap(),
            nodes: vec!["k3s-worker".parse().unwrap()],
            exposure: Exposure::HttpTunnel,
        };
        assert!(orchestrator.bind_workload(&bind).await.is_ok());
        assert!(orchestrator.attach_volume(&volume_intent()).await.is_ok());
    }
}
