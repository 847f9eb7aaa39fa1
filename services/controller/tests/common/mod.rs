//! Shared fixtures for controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_controller::events::{self, EventPublisher};
use keel_controller::{
    AccessMode, FailoverConfig, FailoverController, MockOrchestrator, Node, NodeRegistry,
    ReconcileLoop, StorageRequirement, WorkloadSpec, WorkloadSpecStore, WorkloadStatus,
};
use keel_events::Liveness;
use keel_id::{Capability, NodeName, WorkloadName};

pub const GRACE: Duration = Duration::from_secs(300);
pub const SWEEP: Duration = Duration::from_secs(60);

pub struct Harness {
    pub registry: Arc<NodeRegistry>,
    pub store: Arc<WorkloadSpecStore>,
    pub orchestrator: Arc<MockOrchestrator>,
    pub publisher: EventPublisher,
    pub reconcile: ReconcileLoop,
}

impl Harness {
    pub fn new() -> Self {
        let (publisher, stream) = events::channel();
        let registry = Arc::new(NodeRegistry::new(publisher.clone(), GRACE));
        let store = Arc::new(WorkloadSpecStore::new(publisher.clone()));
        let orchestrator = Arc::new(MockOrchestrator::new());
        let controller = FailoverController::new(orchestrator.clone(), FailoverConfig::default());
        let reconcile = ReconcileLoop::new(
            registry.clone(),
            store.clone(),
            controller,
            stream,
            SWEEP,
        );

        Self {
            registry,
            store,
            orchestrator,
            publisher,
            reconcile,
        }
    }

    /// Register a node and mark it Ready.
    pub async fn ready_node(&self, node: Node) {
        let name = node.name.clone();
        self.registry.register(node).await.unwrap();
        self.registry
            .update_liveness(&name, Liveness::Ready)
            .await
            .unwrap();
    }

    pub async fn set_liveness(&self, node: &str, liveness: Liveness) {
        self.registry
            .update_liveness(&name(node), liveness)
            .await
            .unwrap();
    }

    pub async fn status(&self, workload: &str) -> Option<WorkloadStatus> {
        self.reconcile
            .status_view()
            .get(&workload.parse().unwrap())
            .await
    }
}

pub fn name(s: &str) -> NodeName {
    s.parse().unwrap()
}

pub fn workload(s: &str) -> WorkloadName {
    s.parse().unwrap()
}

/// A node in the public cloud with the `public-ip` label.
pub fn public_worker(s: &str) -> Node {
    Node::new(name(s), "fsn1").with_label(Capability::public_ip())
}

/// The CGNAT control node.
pub fn control_node(s: &str) -> Node {
    Node::new(name(s), "home")
}

pub fn relay_spec() -> WorkloadSpec {
    let mut spec = WorkloadSpec::new(workload("cardano-relay"));
    spec.exposure = keel_controller::Exposure::DirectTcp;
    spec.required_labels.insert(Capability::public_ip());
    spec
}

pub fn postgres_spec() -> WorkloadSpec {
    let mut spec = WorkloadSpec::new(workload("postgres"));
    spec.required_labels.insert(Capability::public_ip());
    spec.storage = Some(StorageRequirement {
        size: "20Gi".parse().unwrap(),
        access_mode: AccessMode::SingleWriter,
        claim: None,
    });
    spec
}
