//! Node registry.
//!
//! Owns every known node, its capability labels and its liveness. Writers
//! (registration and the liveness feed) replace the shared snapshot
//! copy-on-write, so evaluations always read a consistent point-in-time
//! [`ClusterSnapshot`] and never block the liveness path.

use std::collections::{btree_map, BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use keel_events::{
    ClusterEvent, Liveness, NodeDecommissionedPayload, NodeLivenessChangedPayload,
    NodeLostPayload, NodeRegisteredPayload,
};
use keel_id::{Capability, NodeName};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::EventPublisher;
use crate::model::Node;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node '{node}' already registered in zone '{existing_zone}', refusing zone '{requested_zone}'")]
    DuplicateNode {
        node: NodeName,
        existing_zone: String,
        requested_zone: String,
    },

    #[error("node '{0}' is not registered")]
    NodeNotFound(NodeName),
}

/// A registered node with its observed liveness.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node: Node,
    pub liveness: Liveness,
    /// When the node last left Ready (or registered).
    pub since: Instant,
    /// Set once the grace period has elapsed without a Ready transition.
    pub lost: bool,
}

impl NodeRecord {
    /// Not Ready, but not yet counted as lost.
    pub fn in_grace(&self) -> bool {
        !self.liveness.is_ready() && !self.lost
    }
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    nodes: BTreeMap<NodeName, NodeRecord>,
    grace_period: Duration,
}

impl ClusterSnapshot {
    /// An empty snapshot.
    pub fn empty(grace_period: Duration) -> Self {
        Self {
            nodes: BTreeMap::new(),
            grace_period,
        }
    }

    /// Build a snapshot directly, e.g. for offline planning.
    pub fn from_nodes(
        grace_period: Duration,
        nodes: impl IntoIterator<Item = (Node, Liveness)>,
    ) -> Self {
        let now = Instant::now();
        let nodes = nodes
            .into_iter()
            .map(|(node, liveness)| {
                let record = NodeRecord {
                    node,
                    liveness,
                    since: now,
                    lost: false,
                };
                (record.node.name.clone(), record)
            })
            .collect();
        Self {
            nodes,
            grace_period,
        }
    }

    pub fn get(&self, name: &NodeName) -> Option<&NodeRecord> {
        self.nodes.get(name)
    }

    /// All records ordered by node name.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Ready nodes carrying every required label, in name order.
    ///
    /// The returned iterator is lazy and `Clone`, so callers can restart it.
    pub fn list_eligible<'a>(&'a self, required: &'a BTreeSet<Capability>) -> Eligible<'a> {
        Eligible {
            inner: self.nodes.values(),
            required,
        }
    }

    /// Returns true if a node that is not Ready may keep its existing
    /// replicas: it is still inside the grace period and still matches.
    pub fn is_retainable(&self, name: &NodeName, required: &BTreeSet<Capability>) -> bool {
        self.nodes
            .get(name)
            .is_some_and(|r| r.in_grace() && r.node.has_labels(required))
    }

    /// Returns true if the node is Ready.
    pub fn is_ready(&self, name: &NodeName) -> bool {
        self.nodes.get(name).is_some_and(|r| r.liveness.is_ready())
    }
}

/// Lazy iterator over eligible nodes.
#[derive(Debug, Clone)]
pub struct Eligible<'a> {
    inner: btree_map::Values<'a, NodeName, NodeRecord>,
    required: &'a BTreeSet<Capability>,
}

impl<'a> Iterator for Eligible<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let required = self.required;
        self.inner
            .by_ref()
            .find(|r| r.liveness.is_ready() && r.node.has_labels(required))
            .map(|r| &r.node)
    }
}

/// Owned handle for iterating eligible nodes of a fixed snapshot.
#[derive(Debug, Clone)]
pub struct EligibleNodes {
    snapshot: Arc<ClusterSnapshot>,
    required: BTreeSet<Capability>,
}

impl EligibleNodes {
    /// Start (or restart) iteration.
    pub fn iter(&self) -> Eligible<'_> {
        self.snapshot.list_eligible(&self.required)
    }
}

/// The node registry.
pub struct NodeRegistry {
    inner: RwLock<Arc<ClusterSnapshot>>,
    publisher: EventPublisher,
    grace_period: Duration,
}

impl NodeRegistry {
    pub fn new(publisher: EventPublisher, grace_period: Duration) -> Self {
        Self {
            inner: RwLock::new(Arc::new(ClusterSnapshot::empty(grace_period))),
            publisher,
            grace_period,
        }
    }

    /// Current consistent view; cheap to take.
    pub async fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.inner.read().await.clone()
    }

    /// Add a node, or update the labels of a known node.
    ///
    /// A new node starts with `Unknown` liveness until the feed reports it.
    /// Re-registering with a different zone is rejected.
    pub async fn register(&self, node: Node) -> Result<(), RegistryError> {
        let mut guard = self.inner.write().await;

        let existing = guard.nodes.get(&node.name).map(|r| r.node.clone());
        let changed = match existing {
            Some(existing) if existing.zone != node.zone => {
                warn!(
                    node = %node.name,
                    existing_zone = %existing.zone,
                    requested_zone = %node.zone,
                    "Rejecting conflicting node registration"
                );
                return Err(RegistryError::DuplicateNode {
                    node: node.name.clone(),
                    existing_zone: existing.zone,
                    requested_zone: node.zone,
                });
            }
            Some(existing) if existing == node => false,
            Some(_) => {
                let snapshot = Arc::make_mut(&mut *guard);
                if let Some(record) = snapshot.nodes.get_mut(&node.name) {
                    record.node = node.clone();
                }
                true
            }
            None => {
                let snapshot = Arc::make_mut(&mut *guard);
                snapshot.nodes.insert(
                    node.name.clone(),
                    NodeRecord {
                        node: node.clone(),
                        liveness: Liveness::Unknown,
                        since: Instant::now(),
                        lost: false,
                    },
                );
                true
            }
        };
        drop(guard);

        if changed {
            info!(
                node = %node.name,
                zone = %node.zone,
                labels = ?node.labels,
                "Node registered"
            );
            self.publisher
                .publish(ClusterEvent::NodeRegistered(NodeRegisteredPayload {
                    node: node.name,
                    zone: node.zone,
                    labels: node.labels,
                }));
        }

        Ok(())
    }

    /// Record a liveness observation.
    ///
    /// Edge-triggered: returns `true` and emits an event only when the status
    /// differs from the last recorded one. Leaving Ready starts the grace
    /// timer; returning to Ready clears it (and any lost mark).
    pub async fn update_liveness(
        &self,
        name: &NodeName,
        status: Liveness,
    ) -> Result<bool, RegistryError> {
        let mut guard = self.inner.write().await;

        let old = match guard.nodes.get(name) {
            Some(record) if record.liveness == status => return Ok(false),
            Some(record) => record.liveness,
            None => return Err(RegistryError::NodeNotFound(name.clone())),
        };

        let snapshot = Arc::make_mut(&mut *guard);
        if let Some(record) = snapshot.nodes.get_mut(name) {
            record.liveness = status;
            if status.is_ready() {
                record.lost = false;
                record.since = Instant::now();
            } else if old.is_ready() {
                record.since = Instant::now();
            }
        }
        drop(guard);

        info!(
            node = %name,
            old_liveness = %old,
            new_liveness = %status,
            "Node liveness changed"
        );
        self.publisher
            .publish(ClusterEvent::NodeLivenessChanged(NodeLivenessChangedPayload {
                node: name.clone(),
                old_liveness: old,
                new_liveness: status,
            }));

        Ok(true)
    }

    /// Remove a node permanently.
    pub async fn decommission(&self, name: &NodeName) -> Result<Node, RegistryError> {
        let mut guard = self.inner.write().await;
        if !guard.nodes.contains_key(name) {
            return Err(RegistryError::NodeNotFound(name.clone()));
        }
        let removed = Arc::make_mut(&mut *guard).nodes.remove(name);
        drop(guard);

        let record = removed.ok_or_else(|| RegistryError::NodeNotFound(name.clone()))?;
        info!(node = %name, "Node decommissioned");
        self.publisher
            .publish(ClusterEvent::NodeDecommissioned(NodeDecommissionedPayload {
                node: name.clone(),
            }));

        Ok(record.node)
    }

    /// Mark every node whose grace period has elapsed by `now` as lost.
    pub async fn expire_grace(&self, now: Instant) -> Vec<NodeName> {
        let mut guard = self.inner.write().await;
        let grace = self.grace_period;

        let expired: Vec<NodeName> = guard
            .nodes
            .values()
            .filter(|r| r.in_grace() && r.since + grace <= now)
            .map(|r| r.node.name.clone())
            .collect();

        if expired.is_empty() {
            return expired;
        }

        let snapshot = Arc::make_mut(&mut *guard);
        let mut lost = Vec::with_capacity(expired.len());
        for name in &expired {
            if let Some(record) = snapshot.nodes.get_mut(name) {
                record.lost = true;
                lost.push((name.clone(), record.liveness));
            }
        }
        drop(guard);

        for (node, last_liveness) in lost {
            warn!(
                node = %node,
                last_liveness = %last_liveness,
                grace_period_secs = grace.as_secs(),
                "Node lost after grace period"
            );
            self.publisher.publish(ClusterEvent::NodeLost(NodeLostPayload {
                node,
                last_liveness,
                grace_period_secs: grace.as_secs(),
            }));
        }

        expired
    }

    /// Earliest instant at which a node in grace will be declared lost.
    pub async fn next_grace_deadline(&self) -> Option<Instant> {
        let guard = self.inner.read().await;
        let deadline = guard
            .nodes
            .values()
            .filter(|r| r.in_grace())
            .map(|r| r.since + self.grace_period)
            .min();
        debug!(?deadline, "Computed next grace deadline");
        deadline
    }

    /// Eligible nodes in the current snapshot.
    pub async fn list_eligible(&self, required: BTreeSet<Capability>) -> EligibleNodes {
        EligibleNodes {
            snapshot: self.snapshot().await,
            required,
        }
    }
}
