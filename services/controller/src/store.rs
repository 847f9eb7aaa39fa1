//! Workload spec store.
//!
//! Holds the accepted spec per workload. Specs are validated at `put` time so
//! nothing invalid ever reaches the reconciliation loop, and a spec change is
//! published only when its canonical hash actually changed.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_events::{ClusterEvent, WorkloadSpecDeletedPayload, WorkloadSpecPutPayload};
use keel_id::{Capability, WorkloadName};
use keel_reconcile::SpecHash;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::events::EventPublisher;
use crate::model::{Exposure, WorkloadSpec};

/// Errors from spec store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid spec for workload '{workload}': {reason}")]
    InvalidSpec {
        workload: WorkloadName,
        reason: String,
    },

    #[error("failed to hash spec: {0}")]
    Hash(#[from] serde_json::Error),
}

/// Result of a successful `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Updated,
    /// Identical to the stored spec; no event published.
    Unchanged,
}

#[derive(Debug, Clone)]
struct StoredSpec {
    spec: Arc<WorkloadSpec>,
    hash: SpecHash,
}

/// Check the static invariants of a spec.
pub fn validate(spec: &WorkloadSpec) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidSpec {
        workload: spec.name.clone(),
        reason: reason.to_string(),
    };

    if spec.exposure == Exposure::DirectTcp
        && !spec
            .required_labels
            .iter()
            .any(|l| l.as_str() == Capability::PUBLIC_IP)
    {
        return Err(invalid(
            "direct-tcp exposure requires the 'public-ip' capability label",
        ));
    }

    if spec.replicas == 0 {
        return Err(invalid("replica count must be at least 1"));
    }

    if let Some(storage) = &spec.storage {
        if storage.size.is_zero() {
            return Err(invalid("storage size must be non-zero"));
        }
        // Pinning every replica to the writer's node contradicts spreading.
        if spec.pins_to_volume_node() && spec.anti_affinity && spec.replicas > 1 {
            return Err(invalid(
                "single-writer storage cannot be combined with anti-affinity across replicas",
            ));
        }
    }

    Ok(())
}

/// The workload spec store.
pub struct WorkloadSpecStore {
    specs: RwLock<BTreeMap<WorkloadName, StoredSpec>>,
    publisher: EventPublisher,
}

impl WorkloadSpecStore {
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            specs: RwLock::new(BTreeMap::new()),
            publisher,
        }
    }

    /// Validate and store a spec.
    pub async fn put(&self, spec: WorkloadSpec) -> Result<PutOutcome, StoreError> {
        if let Err(e) = validate(&spec) {
            warn!(workload = %spec.name, error = %e, "Rejecting workload spec");
            return Err(e);
        }
        let hash = spec.spec_hash()?;

        let mut specs = self.specs.write().await;
        let outcome = match specs.get(&spec.name) {
            Some(stored) if stored.hash == hash => {
                debug!(workload = %spec.name, spec_hash = %hash, "Spec unchanged");
                return Ok(PutOutcome::Unchanged);
            }
            Some(_) => PutOutcome::Updated,
            None => PutOutcome::Created,
        };

        let workload = spec.name.clone();
        specs.insert(
            workload.clone(),
            StoredSpec {
                spec: Arc::new(spec),
                hash: hash.clone(),
            },
        );
        drop(specs);

        info!(workload = %workload, spec_hash = %hash, ?outcome, "Workload spec stored");
        self.publisher
            .publish(ClusterEvent::WorkloadSpecPut(WorkloadSpecPutPayload {
                workload,
                spec_hash: hash.to_string(),
            }));

        Ok(outcome)
    }

    pub async fn get(&self, workload: &WorkloadName) -> Option<Arc<WorkloadSpec>> {
        self.specs.read().await.get(workload).map(|s| s.spec.clone())
    }

    /// All specs ordered by workload name.
    pub async fn list(&self) -> Vec<Arc<WorkloadSpec>> {
        self.specs
            .read()
            .await
            .values()
            .map(|s| s.spec.clone())
            .collect()
    }

    /// Remove a spec. Returns the removed spec, if it existed.
    pub async fn delete(&self, workload: &WorkloadName) -> Option<Arc<WorkloadSpec>> {
        let removed = self.specs.write().await.remove(workload)?;

        info!(workload = %workload, "Workload spec deleted");
        self.publisher
            .publish(ClusterEvent::WorkloadSpecDeleted(WorkloadSpecDeletedPayload {
                workload: workload.clone(),
            }));

        Some(removed.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::model::{AccessMode, StorageRequirement};
    use proptest::prelude::*;
    use rstest::rstest;

    fn spec(name: &str) -> WorkloadSpec {
        WorkloadSpec::new(name.parse().unwrap())
    }

    fn direct_tcp(labels: &[&str]) -> WorkloadSpec {
        let mut s = spec("cardano-relay");
        s.exposure = Exposure::DirectTcp;
        s.required_labels = labels.iter().map(|l| l.parse().unwrap()).collect();
        s
    }

    fn single_writer(size: &str) -> StorageRequirement {
        StorageRequirement {
            size: size.parse().unwrap(),
            access_mode: AccessMode::SingleWriter,
            claim: None,
        }
    }

    #[rstest]
    #[case(&["public-ip"], true)]
    #[case(&["PUBLIC-IP", "cardano-eligible"], true)]
    #[case(&["cardano-eligible"], false)]
    #[case(&[], false)]
    fn test_direct_tcp_requires_public_ip(#[case] labels: &[&str], #[case] ok: bool) {
        assert_eq!(validate(&direct_tcp(labels)).is_ok(), ok);
    }

    #[test]
    fn test_rejects_zero_replicas() {
        let mut s = spec("web");
        s.replicas = 0;
        assert!(matches!(validate(&s), Err(StoreError::InvalidSpec { .. })));
    }

    #[test]
    fn test_rejects_zero_storage() {
        let mut s = spec("postgres");
        s.storage = Some(single_writer("0"));
        assert!(validate(&s).is_err());
    }

    #[test]
    fn test_rejects_single_writer_anti_affinity() {
        let mut s = spec("postgres");
        s.storage = Some(single_writer("10Gi"));
        s.replicas = 2;
        s.anti_affinity = true;
        assert!(validate(&s).is_err());

        s.replicas = 1;
        assert!(validate(&s).is_ok());
    }

    #[tokio::test]
    async fn test_put_publishes_only_on_change() {
        let (publisher, mut stream) = events::channel();
        let store = WorkloadSpecStore::new(publisher);

        assert_eq!(store.put(spec("web")).await.unwrap(), PutOutcome::Created);
        assert_eq!(store.put(spec("web")).await.unwrap(), PutOutcome::Unchanged);

        let mut changed = spec("web");
        changed.replicas = 2;
        assert_eq!(store.put(changed).await.unwrap(), PutOutcome::Updated);

        let mut count = 0;
        while stream.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(store.get(&"web".parse().unwrap()).await.unwrap().replicas, 2);
    }

    #[tokio::test]
    async fn test_invalid_put_leaves_store_untouched() {
        let (publisher, mut stream) = events::channel();
        let store = WorkloadSpecStore::new(publisher);

        let err = store.put(direct_tcp(&[])).await.unwrap_err();
        assert!(err.to_string().contains("public-ip"));
        assert!(store.list().await.is_empty());
        assert!(stream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (publisher, _stream) = events::channel();
        let store = WorkloadSpecStore::new(publisher);
        store.put(spec("web")).await.unwrap();
        store.put(spec("api")).await.unwrap();

        let names: Vec<_> = store
            .list()
            .await
            .iter()
            .map(|s| s.name.to_string())
            .collect();
        assert_eq!(names, vec!["api", "web"]);

        assert!(store.delete(&"web".parse().unwrap()).await.is_some());
        assert!(store.delete(&"web".parse().unwrap()).await.is_none());
        assert_eq!(store.list().await.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_direct_tcp_without_public_ip_is_rejected(
            labels in proptest::collection::btree_set("[a-z]{1,8}", 0..4),
            include_public in any::<bool>(),
        ) {
            let mut s = spec("relay");
            s.exposure = Exposure::DirectTcp;
            s.required_labels = labels.iter().map(|l| l.parse().unwrap()).collect();
            if include_public {
                s.required_labels.insert(Capability::public_ip());
            }
            let has_public = s.required_labels.iter().any(|l| l.as_str() == Capability::PUBLIC_IP);
            prop_assert_eq!(validate(&s).is_ok(), has_public);
        }
    }
}
