//! Domain types shared by the registry, store, evaluator and controller.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use keel_id::{Capability, NodeName, VolumeName, WorkloadName};
use keel_reconcile::SpecHash;
use serde::{Deserialize, Serialize};

// =============================================================================
// Nodes
// =============================================================================

/// A cluster node as seen at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,
    pub labels: BTreeSet<Capability>,
    pub zone: String,
    pub public_reachable: bool,
}

impl Node {
    pub fn new(name: NodeName, zone: impl Into<String>) -> Self {
        Self {
            name,
            labels: BTreeSet::new(),
            zone: zone.into(),
            public_reachable: false,
        }
    }

    /// Adds a capability label.
    #[must_use]
    pub fn with_label(mut self, label: Capability) -> Self {
        if label.as_str() == Capability::PUBLIC_IP {
            self.public_reachable = true;
        }
        self.labels.insert(label);
        self
    }

    /// Returns true if the node carries every required label.
    pub fn has_labels(&self, required: &BTreeSet<Capability>) -> bool {
        required.is_subset(&self.labels)
    }
}

// =============================================================================
// Workload Specs
// =============================================================================

/// How a workload is reached from outside the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Exposure {
    /// HTTP through the Cloudflare tunnel; any node works.
    #[serde(alias = "http-via-tunnel")]
    HttpTunnel,
    /// Raw TCP on the node's own address (NodePort / hostNetwork).
    DirectTcp,
    /// Cluster-internal only.
    Internal,
}

impl std::fmt::Display for Exposure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Exposure::HttpTunnel => "http-tunnel",
            Exposure::DirectTcp => "direct-tcp",
            Exposure::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Volume access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    #[serde(alias = "ReadWriteOnce")]
    SingleWriter,
    #[serde(alias = "ReadWriteMany")]
    MultiWriter,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::SingleWriter => f.write_str("single-writer"),
            AccessMode::MultiWriter => f.write_str("multi-writer"),
        }
    }
}

/// A storage size in bytes, parsed from Kubernetes quantity notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(u64);

impl Quantity {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

/// Error parsing a [`Quantity`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid storage quantity '{0}' (expected e.g. 512Mi, 20Gi, 1T)")]
pub struct QuantityError(pub String);

impl std::str::FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, suffix) = trimmed.split_at(split);

        let value: u64 = digits.parse().map_err(|_| QuantityError(s.to_string()))?;
        let multiplier: u64 = match suffix {
            "" => 1,
            "k" => 1_000,
            "M" => 1_000_000,
            "G" => 1_000_000_000,
            "T" => 1_000_000_000_000,
            "Ki" => 1 << 10,
            "Mi" => 1 << 20,
            "Gi" => 1 << 30,
            "Ti" => 1 << 40,
            _ => return Err(QuantityError(s.to_string())),
        };

        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| QuantityError(s.to_string()))
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const UNITS: [(&str, u64); 4] = [
            ("Ti", 1 << 40),
            ("Gi", 1 << 30),
            ("Mi", 1 << 20),
            ("Ki", 1 << 10),
        ];
        for (suffix, size) in UNITS {
            if self.0 >= size && self.0 % size == 0 {
                return write!(f, "{}{}", self.0 / size, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

/// Persistent storage a workload needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRequirement {
    pub size: Quantity,
    pub access_mode: AccessMode,
    /// Explicit claim name; defaults to `data-<workload>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<VolumeName>,
}

impl StorageRequirement {
    /// The volume backing this requirement for the given workload.
    pub fn volume_for(&self, workload: &WorkloadName) -> VolumeName {
        self.claim
            .clone()
            .unwrap_or_else(|| VolumeName::claim_for(workload))
    }
}

/// Declarative placement constraints for one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: WorkloadName,
    pub exposure: Exposure,
    pub required_labels: BTreeSet<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageRequirement>,
    pub replicas: u32,
    pub anti_affinity: bool,
}

impl WorkloadSpec {
    /// A single-replica internal workload with no constraints.
    pub fn new(name: WorkloadName) -> Self {
        Self {
            name,
            exposure: Exposure::Internal,
            required_labels: BTreeSet::new(),
            storage: None,
            replicas: 1,
            anti_affinity: false,
        }
    }

    /// Single-writer storage pins every replica to the node holding the volume.
    pub fn pins_to_volume_node(&self) -> bool {
        matches!(
            self.storage,
            Some(StorageRequirement {
                access_mode: AccessMode::SingleWriter,
                ..
            })
        )
    }

    /// The volume this workload binds, if it has storage.
    pub fn volume(&self) -> Option<VolumeName> {
        self.storage.as_ref().map(|s| s.volume_for(&self.name))
    }

    /// Canonical hash of the spec, used to detect real changes.
    pub fn spec_hash(&self) -> Result<SpecHash, serde_json::Error> {
        SpecHash::of(self)
    }
}

// =============================================================================
// Placement
// =============================================================================

/// Why a placement was (re)computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    SpecChanged,
    LivenessChanged,
    NodeLost,
    NodeJoined,
    Sweep,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trigger::SpecChanged => "spec_changed",
            Trigger::LivenessChanged => "liveness_changed",
            Trigger::NodeLost => "node_lost",
            Trigger::NodeJoined => "node_joined",
            Trigger::Sweep => "sweep",
        };
        f.write_str(s)
    }
}

/// Whether a decision covers every requested replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    /// Every replica has a node.
    Complete,
    /// Fewer eligible nodes than replicas; degraded but valid.
    Partial,
    /// No eligible node at all.
    Unschedulable,
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionStatus::Complete => "complete",
            DecisionStatus::Partial => "partial",
            DecisionStatus::Unschedulable => "unschedulable",
        };
        f.write_str(s)
    }
}

/// The latest placement computed for a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementDecision {
    pub workload: WorkloadName,
    /// One entry per placed replica, in assignment order.
    pub nodes: Vec<NodeName>,
    pub decided_at: DateTime<Utc>,
    pub reason: Trigger,
    pub status: DecisionStatus,
}

impl PlacementDecision {
    /// The node holding the first replica (and the volume, if any).
    pub fn primary(&self) -> Option<&NodeName> {
        self.nodes.first()
    }

    /// Returns true if the node hosts at least one replica.
    pub fn contains(&self, node: &NodeName) -> bool {
        self.nodes.contains(node)
    }

    /// Distinct nodes hosting replicas.
    pub fn distinct_nodes(&self) -> BTreeSet<&NodeName> {
        self.nodes.iter().collect()
    }

    /// Compares the assignment (as a multiset of nodes) and status,
    /// ignoring timestamp, reason and replica order.
    pub fn same_placement(&self, other: &PlacementDecision) -> bool {
        let mut a: Vec<_> = self.nodes.iter().collect();
        let mut b: Vec<_> = other.nodes.iter().collect();
        a.sort();
        b.sort();
        self.status == other.status && a == b
    }
}

/// Where a workload's persistent volume is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub workload: WorkloadName,
    pub volume: VolumeName,
    pub access_mode: AccessMode,
    pub attached_node: Option<NodeName>,
}

impl VolumeBinding {
    /// A binding for a volume not yet attached anywhere.
    pub fn detached(spec: &WorkloadSpec, storage: &StorageRequirement) -> Self {
        Self {
            workload: spec.name.clone(),
            volume: storage.volume_for(&spec.name),
            access_mode: storage.access_mode,
            attached_node: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("512Mi", 512 * 1024 * 1024)]
    #[case("20Gi", 20 * 1024 * 1024 * 1024)]
    #[case("1T", 1_000_000_000_000)]
    #[case("100", 100)]
    #[case(" 2Ki ", 2048)]
    fn test_quantity_parse(#[case] input: &str, #[case] bytes: u64) {
        let q: Quantity = input.parse().unwrap();
        assert_eq!(q.bytes(), bytes);
    }

    #[rstest]
    #[case("")]
    #[case("Gi")]
    #[case("10GB")]
    #[case("-5Gi")]
    #[case("99999999999999999999Ti")]
    fn test_quantity_rejects(#[case] input: &str) {
        assert!(input.parse::<Quantity>().is_err());
    }

    #[test]
    fn test_quantity_display() {
        assert_eq!(Quantity::from_bytes(20 << 30).to_string(), "20Gi");
        assert_eq!(Quantity::from_bytes(1536).to_string(), "1536");
        assert_eq!(Quantity::from_bytes(3 << 20).to_string(), "3Mi");
    }

    #[test]
    fn test_with_public_ip_label_marks_reachable() {
        let node =
            Node::new("k3s-worker".parse().unwrap(), "fsn1").with_label(Capability::public_ip());
        assert!(node.public_reachable);
    }

    #[test]
    fn test_has_labels_is_subset() {
        let node = Node::new("k3s-worker".parse().unwrap(), "fsn1")
            .with_label(Capability::public_ip())
            .with_label("cardano-eligible".parse().unwrap());

        let mut required = BTreeSet::new();
        assert!(node.has_labels(&required));
        required.insert(Capability::public_ip());
        assert!(node.has_labels(&required));
        required.insert("gpu".parse().unwrap());
        assert!(!node.has_labels(&required));
    }

    #[test]
    fn test_exposure_serde_names() {
        let e: Exposure = serde_json::from_str("\"http-via-tunnel\"").unwrap();
        assert_eq!(e, Exposure::HttpTunnel);
        assert_eq!(serde_json::to_string(&Exposure::DirectTcp).unwrap(), "\"direct-tcp\"");
        let m: AccessMode = serde_json::from_str("\"ReadWriteOnce\"").unwrap();
        assert_eq!(m, AccessMode::SingleWriter);
    }

    #[test]
    fn test_default_volume_name() {
        let mut spec = WorkloadSpec::new("postgres".parse().unwrap());
        assert!(spec.volume().is_none());
        spec.storage = Some(StorageRequirement {
            size: "10Gi".parse().unwrap(),
            access_mode: AccessMode::SingleWriter,
            claim: None,
        });
        assert_eq!(spec.volume().unwrap().as_str(), "data-postgres");
        assert!(spec.pins_to_volume_node());
    }

    #[test]
    fn test_same_placement_ignores_order_and_time() {
        let a = PlacementDecision {
            workload: "web".parse().unwrap(),
            nodes: vec!["n1".parse().unwrap(), "n2".parse().unwrap()],
            decided_at: Utc::now(),
            reason: Trigger::Sweep,
            status: DecisionStatus::Complete,
        };
        let mut b = a.clone();
        b.nodes.reverse();
        b.reason = Trigger::SpecChanged;
        assert!(a.same_placement(&b));

        b.status = DecisionStatus::Partial;
        assert!(!a.same_placement(&b));
    }

    #[test]
    fn test_spec_hash_changes_with_replicas() {
        let mut spec = WorkloadSpec::new("web".parse().unwrap());
        let before = spec.spec_hash().unwrap();
        assert_eq!(before, spec.clone().spec_hash().unwrap());
        spec.replicas = 3;
        assert_ne!(before, spec.spec_hash().unwrap());
    }
}
