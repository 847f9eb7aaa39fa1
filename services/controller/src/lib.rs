//! keel workload placement and failover reconciler.
//!
//! Keeps workloads of a small hybrid k3s cluster placed on nodes that can run
//! them, and moves them (with their persistent volumes) when a node is lost.
//!
//! ## Architecture
//!
//! - **Node Registry** (`registry`): nodes, labels, liveness and grace timers
//! - **Workload Spec Store** (`store`): validated placement constraints
//! - **Placement Evaluator** (`placement`): pure spec + snapshot -> decision
//! - **Failover Controller** (`failover`): per-workload state machine and volume rebinds
//! - **Reconciliation Loop** (`reconciler`): event-driven driver with periodic sweeps
//!
//! Pod scheduling and volume attach/detach are delegated to an
//! [`Orchestrator`] implementation.

pub mod config;
pub mod error;
pub mod events;
pub mod failover;
pub mod feed;
pub mod manifest;
pub mod model;
pub mod orchestrator;
pub mod placement;
pub mod reconciler;
pub mod registry;
pub mod store;

pub use error::ControllerError;
pub use failover::{Action, FailoverConfig, FailoverController, Phase, StatusView, WorkloadStatus};
pub use manifest::ClusterManifest;
pub use model::{
    AccessMode, DecisionStatus, Exposure, Node, PlacementDecision, Quantity, StorageRequirement,
    Trigger, VolumeBinding, WorkloadSpec,
};
pub use orchestrator::{DryRunOrchestrator, MockOrchestrator, Orchestrator};
pub use placement::{evaluate, NodeLoad, PlacementInput};
pub use reconciler::{ReconcileLoop, ReconcileStats};
pub use registry::{ClusterSnapshot, NodeRegistry, RegistryError};
pub use store::{PutOutcome, StoreError, WorkloadSpecStore};
