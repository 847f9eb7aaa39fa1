//! Event type definitions for node and workload events.
//!
//! Each event type has a corresponding payload struct with the event-specific data.

use std::collections::BTreeSet;

use keel_id::{Capability, NodeName, WorkloadName};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Node
    pub const NODE_REGISTERED: &str = "node.registered";
    pub const NODE_LIVENESS_CHANGED: &str = "node.liveness_changed";
    pub const NODE_LOST: &str = "node.lost";
    pub const NODE_DECOMMISSIONED: &str = "node.decommissioned";

    // Workload
    pub const WORKLOAD_SPEC_PUT: &str = "workload.spec_put";
    pub const WORKLOAD_SPEC_DELETED: &str = "workload.spec_deleted";
}

// =============================================================================
// Status Enums
// =============================================================================

/// Node liveness as reported by the external health source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Ready,
    NotReady,
    Unknown,
}

impl Liveness {
    /// Returns true if the node can accept placements.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Liveness::Ready => "ready",
            Liveness::NotReady => "not_ready",
            Liveness::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Liveness {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // kubelet reports "True"/"False"/"Unknown" for the Ready condition.
        match s.to_ascii_lowercase().as_str() {
            "ready" | "true" => Ok(Liveness::Ready),
            "not_ready" | "notready" | "false" => Ok(Liveness::NotReady),
            "unknown" => Ok(Liveness::Unknown),
            other => Err(EventError::UnknownLiveness(other.to_string())),
        }
    }
}

// =============================================================================
// Node Events
// =============================================================================

/// Payload for node.registered event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegisteredPayload {
    pub node: NodeName,
    pub zone: String,
    pub labels: BTreeSet<Capability>,
}

/// Payload for node.liveness_changed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLivenessChangedPayload {
    pub node: NodeName,
    pub old_liveness: Liveness,
    pub new_liveness: Liveness,
}

/// Payload for node.lost event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLostPayload {
    pub node: NodeName,
    pub last_liveness: Liveness,
    pub grace_period_secs: u64,
}

/// Payload for node.decommissioned event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDecommissionedPayload {
    pub node: NodeName,
}

// =============================================================================
// Workload Events
// =============================================================================

/// Payload for workload.spec_put event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpecPutPayload {
    pub workload: WorkloadName,
    pub spec_hash: String,
}

/// Payload for workload.spec_deleted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpecDeletedPayload {
    pub workload: WorkloadName,
}

// =============================================================================
// Cluster Event
// =============================================================================

/// Every event the reconciliation loop consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum ClusterEvent {
    #[serde(rename = "node.registered")]
    NodeRegistered(NodeRegisteredPayload),
    #[serde(rename = "node.liveness_changed")]
    NodeLivenessChanged(NodeLivenessChangedPayload),
    #[serde(rename = "node.lost")]
    NodeLost(NodeLostPayload),
    #[serde(rename = "node.decommissioned")]
    NodeDecommissioned(NodeDecommissionedPayload),
    #[serde(rename = "workload.spec_put")]
    WorkloadSpecPut(WorkloadSpecPutPayload),
    #[serde(rename = "workload.spec_deleted")]
    WorkloadSpecDeleted(WorkloadSpecDeletedPayload),
}

impl ClusterEvent {
    /// The event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            ClusterEvent::NodeRegistered(_) => event_types::NODE_REGISTERED,
            ClusterEvent::NodeLivenessChanged(_) => event_types::NODE_LIVENESS_CHANGED,
            ClusterEvent::NodeLost(_) => event_types::NODE_LOST,
            ClusterEvent::NodeDecommissioned(_) => event_types::NODE_DECOMMISSIONED,
            ClusterEvent::WorkloadSpecPut(_) => event_types::WORKLOAD_SPEC_PUT,
            ClusterEvent::WorkloadSpecDeleted(_) => event_types::WORKLOAD_SPEC_DELETED,
        }
    }

    /// The aggregate the event belongs to.
    pub fn aggregate(&self) -> (crate::AggregateType, &str) {
        use crate::AggregateType;

        match self {
            ClusterEvent::NodeRegistered(p) => (AggregateType::Node, p.node.as_str()),
            ClusterEvent::NodeLivenessChanged(p) => (AggregateType::Node, p.node.as_str()),
            ClusterEvent::NodeLost(p) => (AggregateType::Node, p.node.as_str()),
            ClusterEvent::NodeDecommissioned(p) => (AggregateType::Node, p.node.as_str()),
            ClusterEvent::WorkloadSpecPut(p) => (AggregateType::Workload, p.workload.as_str()),
            ClusterEvent::WorkloadSpecDeleted(p) => {
                (AggregateType::Workload, p.workload.as_str())
            }
        }
    }
}

// =============================================================================
// Liveness Feed
// =============================================================================

/// One liveness observation from the external health source.
///
/// Fed to the reconciler as JSON lines, e.g.
/// `{"node": "k3s-worker", "status": "not_ready"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessReport {
    pub node: NodeName,
    pub status: String,
}

impl LivenessReport {
    /// Parse a report from a single JSON line.
    pub fn from_json_line(line: &str) -> Result<(NodeName, Liveness), EventError> {
        let report: LivenessReport = serde_json::from_str(line.trim())?;
        let liveness = report.status.parse()?;
        Ok((report.node, liveness))
    }
}
