//! Static cluster manifest.
//!
//! Nodes and workload specs are declared in one TOML file:
//!
//! ```toml
//! [nodes.k3s-worker]
//! zone = "fsn1"
//! labels = ["public-ip", "cardano-eligible"]
//!
//! [workloads.cardano-relay]
//! exposure = "direct-tcp"
//! required_labels = ["public-ip", "cardano-eligible"]
//! replicas = 1
//!
//! [workloads.cardano-relay.storage]
//! size = "50Gi"
//! access_mode = "single-writer"
//! ```
//!
//! The flat camelCase keys of the older format (`exposureType`,
//! `storageSize`, `accessMode`, `replicaCount`, `antiAffinity`) are accepted too.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use keel_id::{Capability, NodeName, VolumeName, WorkloadName};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ControllerError;
use crate::model::{
    AccessMode, Exposure, Node, Quantity, QuantityError, StorageRequirement, WorkloadSpec,
};
use crate::registry::NodeRegistry;
use crate::store::{self, WorkloadSpecStore};

/// Errors turning a manifest into nodes and specs.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("workload '{workload}': {source}")]
    InvalidQuantity {
        workload: WorkloadName,
        #[source]
        source: QuantityError,
    },

    #[error("workload '{0}': access mode given without a storage size")]
    AccessModeWithoutStorage(WorkloadName),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeEntry {
    pub zone: String,
    #[serde(default)]
    pub labels: BTreeSet<Capability>,
    /// Defaults to whether the node carries the `public-ip` label.
    #[serde(default)]
    pub public_reachable: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageEntry {
    pub size: String,
    #[serde(default = "default_access_mode")]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub claim: Option<VolumeName>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadEntry {
    #[serde(alias = "exposureType", alias = "exposure_type")]
    pub exposure: Exposure,
    #[serde(default, alias = "requiredLabels")]
    pub required_labels: BTreeSet<Capability>,
    #[serde(default = "default_replicas", alias = "replicaCount", alias = "replica_count")]
    pub replicas: u32,
    #[serde(default, alias = "antiAffinity")]
    pub anti_affinity: bool,
    #[serde(default)]
    pub storage: Option<StorageEntry>,
    #[serde(default, alias = "storageSize")]
    pub storage_size: Option<String>,
    #[serde(default, alias = "accessMode")]
    pub access_mode: Option<AccessMode>,
}

fn default_replicas() -> u32 {
    1
}

fn default_access_mode() -> AccessMode {
    AccessMode::SingleWriter
}

/// The parsed manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterManifest {
    #[serde(default)]
    pub nodes: BTreeMap<NodeName, NodeEntry>,
    #[serde(default)]
    pub workloads: BTreeMap<WorkloadName, WorkloadEntry>,
}

/// Problems found by [`ClusterManifest::check`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManifestReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ManifestReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl ClusterManifest {
    pub fn from_toml_str(s: &str) -> Result<Self, ManifestError> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a manifest file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("failed to load manifest {}", path.display()))
    }

    /// Declared nodes, ordered by name.
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .map(|(name, entry)| Node {
                name: name.clone(),
                public_reachable: entry.public_reachable.unwrap_or_else(|| {
                    entry.labels.iter().any(|l| l.as_str() == Capability::PUBLIC_IP)
                }),
                labels: entry.labels.clone(),
                zone: entry.zone.clone(),
            })
            .collect()
    }

    /// Convert one workload entry into a spec (not yet validated).
    pub fn workload_spec(
        name: &WorkloadName,
        entry: &WorkloadEntry,
    ) -> Result<WorkloadSpec, ManifestError> {
        let parse_size = |size: &str| {
            size.parse::<Quantity>()
                .map_err(|source| ManifestError::InvalidQuantity {
                    workload: name.clone(),
                    source,
                })
        };

        let storage = match (&entry.storage, &entry.storage_size) {
            (Some(table), _) => Some(StorageRequirement {
                size: parse_size(&table.size)?,
                access_mode: table.access_mode,
                claim: table.claim.clone(),
            }),
            (None, Some(size)) => Some(StorageRequirement {
                size: parse_size(size)?,
                access_mode: entry.access_mode.unwrap_or(AccessMode::SingleWriter),
                claim: None,
            }),
            (None, None) if entry.access_mode.is_some() => {
                return Err(ManifestError::AccessModeWithoutStorage(name.clone()));
            }
            (None, None) => None,
        };

        Ok(WorkloadSpec {
            name: name.clone(),
            exposure: entry.exposure,
            required_labels: entry.required_labels.clone(),
            storage,
            replicas: entry.replicas,
            anti_affinity: entry.anti_affinity,
        })
    }

    /// Declared workload specs, ordered by name.
    pub fn workload_specs(&self) -> Result<Vec<WorkloadSpec>, ManifestError> {
        self.workloads
            .iter()
            .map(|(name, entry)| Self::workload_spec(name, entry))
            .collect()
    }

    /// Statically check the manifest without touching any store.
    pub fn check(&self) -> ManifestReport {
        let mut report = ManifestReport::default();
        let nodes = self.nodes();

        for (name, entry) in &self.workloads {
            let spec = match Self::workload_spec(name, entry) {
                Ok(spec) => spec,
                Err(e) => {
                    report.errors.push(e.to_string());
                    continue;
                }
            };
            if let Err(e) = store::validate(&spec) {
                report.errors.push(e.to_string());
                continue;
            }

            let eligible = nodes
                .iter()
                .filter(|n| n.has_labels(&spec.required_labels))
                .count();
            if eligible == 0 {
                report.warnings.push(format!(
                    "workload '{name}': no declared node carries labels {:?}",
                    spec.required_labels
                        .iter()
                        .map(|l| l.as_str())
                        .collect::<Vec<_>>()
                ));
            } else if (eligible as u32) < spec.replicas {
                report.warnings.push(format!(
                    "workload '{name}': {} replicas but only {eligible} eligible node(s); \
                     placement will be partial",
                    spec.replicas
                ));
            }
        }

        report
    }

    /// Register every node and put every spec, collecting failures instead
    /// of stopping at the first one.
    pub async fn seed(
        &self,
        registry: &NodeRegistry,
        store: &WorkloadSpecStore,
    ) -> Vec<ControllerError> {
        let mut problems = Vec::new();

        for node in self.nodes() {
            if let Err(e) = registry.register(node).await {
                problems.push(e.into());
            }
        }

        for (name, entry) in &self.workloads {
            let result = match Self::workload_spec(name, entry) {
                Ok(spec) => store.put(spec).await.map_err(ControllerError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!(workload = %name, error = %e, "Skipping workload");
                problems.push(e);
            }
        }

        info!(
            nodes = self.nodes.len(),
            workloads = self.workloads.len(),
            problems = problems.len(),
            "Manifest applied"
        );
        problems
    }
}
