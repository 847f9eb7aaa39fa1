//! Reconciliation loop behavior: event handling, sweeps and shutdown.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use keel_controller::orchestrator::OrchestratorCall;
use keel_controller::{Exposure, Phase};
use keel_events::{ClusterEvent, EventEnvelope, EventId, Liveness, WorkloadSpecPutPayload};
use tokio::sync::watch;

#[tokio::test]
async fn sweep_twice_issues_no_new_actions() {
    let mut h = Harness::new();
    h.ready_node(public_worker("worker-a")).await;
    h.ready_node(public_worker("worker-b")).await;
    h.store.put(relay_spec()).await.unwrap();
    h.store.put(postgres_spec()).await.unwrap();
    h.reconcile.drain_pending().await;
    h.reconcile.controller_mut().wait_for_rebinds().await;

    let calls = h.orchestrator.calls().await.len();
    let first = h.reconcile.sweep().await;
    let second = h.reconcile.sweep().await;

    assert!(!first.changed());
    assert!(!second.changed());
    assert_eq!(second.workloads_evaluated, 2);
    assert_eq!(h.orchestrator.calls().await.len(), calls);
}

#[tokio::test]
async fn workloads_spread_by_load() {
    let mut h = Harness::new();
    h.ready_node(public_worker("worker-a")).await;
    h.ready_node(public_worker("worker-b")).await;
    h.store.put(relay_spec()).await.unwrap();
    h.reconcile.drain_pending().await;

    let mut other = relay_spec();
    other.name = workload("mithril-signer");
    h.store.put(other).await.unwrap();
    h.reconcile.drain_pending().await;

    let relay = h.status("cardano-relay").await.unwrap().decision.unwrap();
    let signer = h.status("mithril-signer").await.unwrap().decision.unwrap();
    assert_ne!(relay.nodes, signer.nodes);
}

#[tokio::test]
async fn redelivered_event_is_skipped() {
    let mut h = Harness::new();
    h.ready_node(public_worker("worker-a")).await;
    h.store.put(relay_spec()).await.unwrap();
    h.reconcile.drain_pending().await;

    let last = h.reconcile.checkpoint().last_event_id;
    let calls = h.orchestrator.calls().await.len();

    h.publisher.redeliver(EventEnvelope::new(
        EventId::new(last),
        Utc::now(),
        ClusterEvent::WorkloadSpecPut(WorkloadSpecPutPayload {
            workload: workload("cardano-relay"),
            spec_hash: "sha256:stale".to_string(),
        }),
    ));
    let stats = h.reconcile.drain_pending().await;

    assert_eq!(stats.events_skipped, 1);
    assert_eq!(stats.workloads_evaluated, 0);
    assert_eq!(h.reconcile.checkpoint().last_event_id, last);
    assert_eq!(h.orchestrator.calls().await.len(), calls);
}

#[tokio::test]
async fn repeated_ready_reports_emit_one_event() {
    let mut h = Harness::new();
    h.registry.register(public_worker("worker-a")).await.unwrap();
    h.reconcile.drain_pending().await;
    let before = h.reconcile.checkpoint().last_event_id;

    h.set_liveness("worker-a", Liveness::Ready).await;
    h.set_liveness("worker-a", Liveness::Ready).await;
    h.reconcile.drain_pending().await;

    assert_eq!(h.reconcile.checkpoint().last_event_id, before + 1);
}

#[tokio::test]
async fn spec_update_replaces_placement() {
    let mut h = Harness::new();
    h.ready_node(public_worker("worker-a")).await;
    h.ready_node(public_worker("worker-b")).await;
    h.store.put(relay_spec()).await.unwrap();
    h.reconcile.drain_pending().await;

    let mut scaled = relay_spec();
    scaled.replicas = 2;
    scaled.anti_affinity = true;
    h.store.put(scaled).await.unwrap();
    let stats = h.reconcile.drain_pending().await;
    assert_eq!(stats.bound, 1);

    let decision = h.status("cardano-relay").await.unwrap().decision.unwrap();
    assert_eq!(decision.nodes, vec![name("worker-a"), name("worker-b")]);

    let calls = h.orchestrator.calls().await;
    assert_eq!(
        calls.last(),
        Some(&OrchestratorCall::Bind {
            workload: workload("cardano-relay"),
            nodes: vec![name("worker-a"), name("worker-b")],
        })
    );
}

#[tokio::test]
async fn exposure_change_rebinds_on_same_node() {
    let mut h = Harness::new();
    h.ready_node(public_worker("worker-a")).await;
    h.store.put(relay_spec()).await.unwrap();
    h.reconcile.drain_pending().await;
    let before = h.orchestrator.calls().await.len();

    let mut tunnelled = relay_spec();
    tunnelled.exposure = Exposure::HttpTunnel;
    h.store.put(tunnelled.clone()).await.unwrap();
    let stats = h.reconcile.drain_pending().await;
    assert_eq!(stats.bound, 1);

    let status = h.status("cardano-relay").await.unwrap();
    assert_eq!(status.decision.unwrap().nodes, vec![name("worker-a")]);
    assert_eq!(status.bound_spec, tunnelled.spec_hash().ok());

    let calls = h.orchestrator.calls().await;
    assert_eq!(
        &calls[before..],
        &[OrchestratorCall::Bind {
            workload: workload("cardano-relay"),
            nodes: vec![name("worker-a")],
        }]
    );

    // The sweep sees the new spec as already bound.
    let stats = h.reconcile.sweep().await;
    assert_eq!(stats.bound, 0);
    assert_eq!(h.orchestrator.calls().await.len(), calls.len());
}

#[tokio::test]
async fn invalid_spec_never_reaches_the_loop() {
    let mut h = Harness::new();
    h.ready_node(public_worker("worker-a")).await;

    let mut spec = relay_spec();
    spec.required_labels.clear();
    assert!(h.store.put(spec).await.is_err());

    h.reconcile.drain_pending().await;
    assert!(h.status("cardano-relay").await.is_none());
}

#[tokio::test]
async fn sweep_forgets_workloads_deleted_while_events_were_missed() {
    let mut h = Harness::new();
    h.ready_node(public_worker("worker-a")).await;
    h.store.put(relay_spec()).await.unwrap();
    h.reconcile.drain_pending().await;

    h.store.delete(&workload("cardano-relay")).await.unwrap();
    let stats = h.reconcile.sweep().await;

    assert_eq!(stats.removed, 1);
    assert!(h.status("cardano-relay").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn run_places_workloads_and_stops_on_shutdown() {
    let h = Harness::new();
    h.ready_node(public_worker("worker-a")).await;
    h.store.put(relay_spec()).await.unwrap();

    let status = h.reconcile.status_view();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(h.reconcile.run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let relay = status.get(&workload("cardano-relay")).await.unwrap();
    assert_eq!(relay.phase, Phase::Stable);

    // A node lost with nobody else eligible is picked up by the grace timer.
    h.registry
        .update_liveness(&name("worker-a"), Liveness::NotReady)
        .await
        .unwrap();
    tokio::time::sleep(GRACE + Duration::from_secs(1)).await;
    let relay = status.get(&workload("cardano-relay")).await.unwrap();
    assert_eq!(relay.phase, Phase::Degraded);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
