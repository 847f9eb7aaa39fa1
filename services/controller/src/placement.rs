//! Placement evaluator.
//!
//! A pure function from (spec, registry snapshot, current binding, prior
//! decision, cluster load) to a [`PlacementDecision`]. Identical inputs always
//! produce an identical decision; nothing here reads the clock or shared state.
//!
//! Candidates are the eligible nodes (Ready and carrying every required label)
//! plus incumbents: nodes that already hold this workload but are inside
//! their liveness grace period. Incumbents keep their replicas so a transient
//! blip does not cause churn, but never receive new ones.
//!
//! Candidates are ranked by:
//! 1. the node holding the workload's volume binding,
//! 2. nodes in the prior decision,
//! 3. fewest assigned workloads (cluster load plus replicas placed so far),
//! 4. node name.
//!
//! Each preference is a slot that is consumed when used, so a node listed
//! twice in the prior decision keeps two replicas and no more.
//!
//! With fewer candidates than replicas the decision is `Partial` and places
//! one replica per candidate (all on one node for a single-writer volume).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use keel_id::NodeName;

use crate::model::{DecisionStatus, PlacementDecision, Trigger, WorkloadSpec};
use crate::registry::ClusterSnapshot;

/// Number of other workloads currently placed on each node.
pub type NodeLoad = BTreeMap<NodeName, u32>;

/// Everything an evaluation depends on.
#[derive(Debug, Clone, Copy)]
pub struct PlacementInput<'a> {
    pub spec: &'a WorkloadSpec,
    pub snapshot: &'a ClusterSnapshot,
    /// Node currently holding the workload's volume attachment.
    pub binding: Option<&'a NodeName>,
    pub prior: Option<&'a PlacementDecision>,
    pub load: &'a NodeLoad,
    pub reason: Trigger,
    pub decided_at: DateTime<Utc>,
}

/// Ranking state for one evaluation.
struct Ranker<'a> {
    binding_slot: Option<&'a NodeName>,
    prior_slots: BTreeMap<&'a NodeName, u32>,
    load: &'a NodeLoad,
    assigned: BTreeMap<&'a NodeName, u32>,
}

impl<'a> Ranker<'a> {
    fn new(input: &PlacementInput<'a>, candidates: &BTreeSet<&'a NodeName>) -> Self {
        let binding_slot = input.binding.filter(|n| candidates.contains(n));

        let mut prior_slots = BTreeMap::new();
        for node in input.prior.map(|p| p.nodes.as_slice()).unwrap_or_default() {
            if candidates.contains(node) {
                *prior_slots.entry(node).or_insert(0) += 1;
            }
        }

        Self {
            binding_slot,
            prior_slots,
            load: input.load,
            assigned: BTreeMap::new(),
        }
    }

    fn key(&self, node: &'a NodeName) -> (u8, u8, u32, &'a NodeName) {
        let bound = u8::from(self.binding_slot != Some(node));
        let prior = u8::from(self.prior_slots.get(node).copied().unwrap_or(0) == 0);
        let load = self.load.get(node).copied().unwrap_or(0)
            + self.assigned.get(node).copied().unwrap_or(0);
        (bound, prior, load, node)
    }

    /// Pick the best node from `pool` and consume its preference slots.
    fn take<I>(&mut self, pool: I) -> Option<&'a NodeName>
    where
        I: IntoIterator<Item = &'a NodeName>,
    {
        let best = pool.into_iter().min_by_key(|n| self.key(*n))?;

        if self.binding_slot == Some(best) {
            self.binding_slot = None;
        }
        if let Some(slots) = self.prior_slots.get_mut(best) {
            *slots = slots.saturating_sub(1);
        }
        *self.assigned.entry(best).or_insert(0) += 1;

        Some(best)
    }
}

/// Compute the placement for one workload.
pub fn evaluate(input: &PlacementInput<'_>) -> PlacementDecision {
    let spec = input.spec;
    let candidates = candidates(input);
    let replicas = spec.replicas as usize;

    let decision = |nodes: Vec<NodeName>, status| PlacementDecision {
        workload: spec.name.clone(),
        nodes,
        decided_at: input.decided_at,
        reason: input.reason,
        status,
    };

    if candidates.is_empty() || replicas == 0 {
        return decision(Vec::new(), DecisionStatus::Unschedulable);
    }

    let mut ranker = Ranker::new(input, &candidates);

    // Short of candidates, only as many replicas as there are nodes are placed.
    let (placed, status) = if candidates.len() < replicas {
        (candidates.len(), DecisionStatus::Partial)
    } else {
        (replicas, DecisionStatus::Complete)
    };

    if spec.pins_to_volume_node() {
        // Every replica shares the single writer's node.
        let Some(node) = ranker.take(candidates.iter().copied()) else {
            return decision(Vec::new(), DecisionStatus::Unschedulable);
        };
        return decision(vec![node.clone(); placed], status);
    }

    let mut nodes = Vec::with_capacity(placed);
    if spec.anti_affinity || status == DecisionStatus::Partial {
        let mut unused = candidates.clone();
        while nodes.len() < placed {
            let Some(node) = ranker.take(unused.iter().copied()) else {
                break;
            };
            unused.remove(node);
            nodes.push(node.clone());
        }
    } else {
        for _ in 0..placed {
            if let Some(node) = ranker.take(candidates.iter().copied()) {
                nodes.push(node.clone());
            }
        }
    }

    decision(nodes, status)
}

/// Eligible nodes plus retainable incumbents, ordered by name.
fn candidates<'a>(input: &PlacementInput<'a>) -> BTreeSet<&'a NodeName> {
    let required = &input.spec.required_labels;
    let mut out: BTreeSet<&'a NodeName> = input
        .snapshot
        .list_eligible(required)
        .map(|n| &n.name)
        .collect();

    let incumbents = input
        .prior
        .into_iter()
        .flat_map(|p| p.nodes.iter())
        .chain(input.binding);
    for node in incumbents {
        if input.snapshot.is_retainable(node, required) {
            out.insert(node);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{AccessMode, Node, StorageRequirement};
    use keel_events::Liveness;
    use keel_id::Capability;
    use proptest::prelude::*;

    fn name(s: &str) -> NodeName {
        s.parse().unwrap()
    }

    fn public(s: &str) -> Node {
        Node::new(name(s), "fsn1").with_label(Capability::public_ip())
    }

    fn snapshot(nodes: Vec<(Node, Liveness)>) -> ClusterSnapshot {
        ClusterSnapshot::from_nodes(Duration::from_secs(300), nodes)
    }

    fn relay(replicas: u32, anti_affinity: bool) -> WorkloadSpec {
        let mut spec = WorkloadSpec::new("cardano-relay".parse().unwrap());
        spec.required_labels.insert(Capability::public_ip());
        spec.replicas = replicas;
        spec.anti_affinity = anti_affinity;
        spec
    }

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn input<'a>(
        spec: &'a WorkloadSpec,
        snapshot: &'a ClusterSnapshot,
        load: &'a NodeLoad,
    ) -> PlacementInput<'a> {
        PlacementInput {
            spec,
            snapshot,
            binding: None,
            prior: None,
            load,
            reason: Trigger::SpecChanged,
            decided_at: at(),
        }
    }

    fn names(decision: &PlacementDecision) -> Vec<&str> {
        decision.nodes.iter().map(|n| n.as_str()).collect()
    }

    #[test]
    fn test_single_public_worker() {
        let snap = snapshot(vec![
            (public("k3s-worker"), Liveness::Ready),
            (Node::new(name("k3s-control"), "home"), Liveness::Ready),
        ]);
        let spec = relay(1, false);
        let load = NodeLoad::new();

        let decision = evaluate(&input(&spec, &snap, &load));
        assert_eq!(names(&decision), vec!["k3s-worker"]);
        assert_eq!(decision.status, DecisionStatus::Complete);
        assert_eq!(decision.decided_at, at());
    }

    #[test]
    fn test_anti_affinity_spreads_across_nodes() {
        let snap = snapshot(vec![
            (public("worker-a"), Liveness::Ready),
            (public("worker-b"), Liveness::Ready),
        ]);
        let spec = relay(2, true);
        let load = NodeLoad::new();

        let decision = evaluate(&input(&spec, &snap, &load));
        assert_eq!(decision.status, DecisionStatus::Complete);
        assert_eq!(decision.distinct_nodes().len(), 2);
    }

    #[test]
    fn test_anti_affinity_short_of_nodes_is_partial() {
        let snap = snapshot(vec![(public("worker-a"), Liveness::Ready)]);
        let spec = relay(3, true);
        let load = NodeLoad::new();

        let decision = evaluate(&input(&spec, &snap, &load));
        assert_eq!(names(&decision), vec!["worker-a"]);
        assert_eq!(decision.status, DecisionStatus::Partial);
    }

    #[test]
    fn test_no_anti_affinity_short_of_nodes_is_partial() {
        let snap = snapshot(vec![(public("worker-a"), Liveness::Ready)]);
        let spec = relay(3, false);
        let load = NodeLoad::new();

        let decision = evaluate(&input(&spec, &snap, &load));
        assert_eq!(names(&decision), vec!["worker-a"]);
        assert_eq!(decision.status, DecisionStatus::Partial);
    }

    #[test]
    fn test_no_anti_affinity_spreads_when_nodes_suffice() {
        let snap = snapshot(vec![
            (public("worker-a"), Liveness::Ready),
            (public("worker-b"), Liveness::Ready),
        ]);
        let spec = relay(2, false);
        let load = NodeLoad::new();

        let decision = evaluate(&input(&spec, &snap, &load));
        assert_eq!(names(&decision), vec!["worker-a", "worker-b"]);
        assert_eq!(decision.status, DecisionStatus::Complete);
    }

    #[test]
    fn test_no_eligible_nodes_is_unschedulable() {
        let snap = snapshot(vec![
            (public("worker-a"), Liveness::NotReady),
            (Node::new(name("k3s-control"), "home"), Liveness::Ready),
        ]);
        let spec = relay(1, false);
        let load = NodeLoad::new();

        let decision = evaluate(&input(&spec, &snap, &load));
        assert!(decision.nodes.is_empty());
        assert_eq!(decision.status, DecisionStatus::Unschedulable);
    }

    #[test]
    fn test_prefers_least_loaded_then_name() {
        let snap = snapshot(vec![
            (public("worker-a"), Liveness::Ready),
            (public("worker-b"), Liveness::Ready),
            (public("worker-c"), Liveness::Ready),
        ]);
        let spec = relay(1, false);
        let load: NodeLoad = [(name("worker-a"), 2), (name("worker-b"), 1)].into();

        let decision = evaluate(&input(&spec, &snap, &load));
        assert_eq!(names(&decision), vec!["worker-c"]);

        let even = NodeLoad::new();
        let decision = evaluate(&input(&spec, &snap, &even));
        assert_eq!(names(&decision), vec!["worker-a"]);
    }

    #[test]
    fn test_prefers_volume_binding_over_load() {
        let snap = snapshot(vec![
            (public("worker-a"), Liveness::Ready),
            (public("worker-b"), Liveness::Ready),
        ]);
        let mut spec = relay(1, false);
        spec.storage = Some(StorageRequirement {
            size: "20Gi".parse().unwrap(),
            access_mode: AccessMode::SingleWriter,
            claim: None,
        });
        let load: NodeLoad = [(name("worker-b"), 5)].into();
        let bound = name("worker-b");

        let mut inp = input(&spec, &snap, &load);
        inp.binding = Some(&bound);
        assert_eq!(names(&evaluate(&inp)), vec!["worker-b"]);
    }

    #[test]
    fn test_single_writer_pins_all_replicas() {
        let snap = snapshot(vec![
            (public("worker-a"), Liveness::Ready),
            (public("worker-b"), Liveness::Ready),
        ]);
        let mut spec = relay(2, false);
        spec.storage = Some(StorageRequirement {
            size: "1Gi".parse().unwrap(),
            access_mode: AccessMode::SingleWriter,
            claim: None,
        });
        let load = NodeLoad::new();

        let decision = evaluate(&input(&spec, &snap, &load));
        assert_eq!(names(&decision), vec!["worker-a", "worker-a"]);
        assert_eq!(decision.status, DecisionStatus::Complete);

        // Three replicas on two candidates: still one node, but partial.
        spec.replicas = 3;
        let decision = evaluate(&input(&spec, &snap, &load));
        assert_eq!(names(&decision), vec!["worker-a", "worker-a"]);
        assert_eq!(decision.status, DecisionStatus::Partial);
    }

    #[test]
    fn test_incumbent_in_grace_keeps_replica() {
        let snap = snapshot(vec![
            (public("worker-a"), Liveness::NotReady),
            (public("worker-b"), Liveness::Ready),
        ]);
        let spec = relay(1, false);
        let load = NodeLoad::new();
        let prior = PlacementDecision {
            workload: spec.name.clone(),
            nodes: vec![name("worker-a")],
            decided_at: at(),
            reason: Trigger::SpecChanged,
            status: DecisionStatus::Complete,
        };

        let mut inp = input(&spec, &snap, &load);
        inp.prior = Some(&prior);
        assert_eq!(names(&evaluate(&inp)), vec!["worker-a"]);

        // Without a prior placement the node in grace is not a candidate.
        inp.prior = None;
        assert_eq!(names(&evaluate(&inp)), vec!["worker-b"]);
    }

    #[test]
    fn test_prior_decision_is_sticky() {
        let snap = snapshot(vec![
            (public("worker-a"), Liveness::Ready),
            (public("worker-b"), Liveness::Ready),
        ]);
        let spec = relay(1, false);
        let load: NodeLoad = [(name("worker-b"), 3)].into();
        let prior = PlacementDecision {
            workload: spec.name.clone(),
            nodes: vec![name("worker-b")],
            decided_at: at(),
            reason: Trigger::SpecChanged,
            status: DecisionStatus::Complete,
        };

        let mut inp = input(&spec, &snap, &load);
        inp.prior = Some(&prior);
        assert_eq!(names(&evaluate(&inp)), vec!["worker-b"]);
    }

    fn arb_liveness() -> impl Strategy<Value = Liveness> {
        prop_oneof![
            Just(Liveness::Ready),
            Just(Liveness::NotReady),
            Just(Liveness::Unknown),
        ]
    }

    fn arb_nodes() -> impl Strategy<Value = Vec<(Node, Liveness)>> {
        proptest::collection::vec((0u8..8, any::<bool>(), arb_liveness()), 0..8).prop_map(
            |raw| {
                raw.into_iter()
                    .map(|(i, public_ip, liveness)| {
                        let node = Node::new(name(&format!("node-{i}")), "z");
                        let node = if public_ip {
                            node.with_label(Capability::public_ip())
                        } else {
                            node
                        };
                        (node, liveness)
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_evaluate_is_deterministic(
            nodes in arb_nodes(),
            replicas in 1u32..5,
            anti_affinity in any::<bool>(),
            loads in proptest::collection::vec(0u32..5, 8),
        ) {
            let snap = snapshot(nodes);
            let spec = relay(replicas, anti_affinity);
            let load: NodeLoad = loads
                .iter()
                .enumerate()
                .map(|(i, l)| (name(&format!("node-{i}")), *l))
                .collect();

            let first = evaluate(&input(&spec, &snap, &load));
            let second = evaluate(&input(&spec, &snap, &load));
            prop_assert_eq!(&first, &second);

            // Feeding the decision back in as prior is a fixed point.
            let mut again = input(&spec, &snap, &load);
            again.prior = Some(&first);
            prop_assert!(evaluate(&again).same_placement(&first));
        }

        #[test]
        fn prop_assignments_are_eligible(
            nodes in arb_nodes(),
            replicas in 1u32..5,
            anti_affinity in any::<bool>(),
        ) {
            let snap = snapshot(nodes);
            let spec = relay(replicas, anti_affinity);
            let load = NodeLoad::new();
            let decision = evaluate(&input(&spec, &snap, &load));

            let eligible = snap.list_eligible(&spec.required_labels).count();
            prop_assert_eq!(decision.nodes.len(), eligible.min(replicas as usize));
            prop_assert_eq!(
                decision.status == DecisionStatus::Partial,
                eligible > 0 && eligible < replicas as usize
            );
            for node in &decision.nodes {
                prop_assert!(snap.is_ready(node));
                prop_assert!(snap.get(node).unwrap().node.has_labels(&spec.required_labels));
            }
            if anti_affinity {
                prop_assert_eq!(decision.distinct_nodes().len(), decision.nodes.len());
            }
            if decision.nodes.is_empty() {
                prop_assert_eq!(decision.status, DecisionStatus::Unschedulable);
            }
        }
    }
}
