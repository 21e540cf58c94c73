mod common;

use serde_json::json;

use regen_core::model::run::{RunPhase, RunStatus};
use regen_core::{EngineConfig, NodeKind, NodePayload, RegenError};
use regen_graph::{dirty, run, BundleOp, GraphStore};

use common::{node, seeded};

fn order(description: &str) -> NodePayload {
    serde_json::from_value(json!({
        "label": "Aggregate",
        "id": "AGG_ORDER",
        "name": "Order",
        "context_id": "BC_SALES",
        "description": description
    }))
    .unwrap()
}

#[tokio::test]
async fn test_second_writer_on_same_node_conflicts() {
    let (store, pipeline) = seeded(EngineConfig::default()).await;
    let coordinator = pipeline.coordinator();

    let first = run::start(store.as_ref(), RunPhase::Structural, "worker-a").await.unwrap();
    let second = run::start(store.as_ref(), RunPhase::Structural, "worker-b").await.unwrap();
    let a = coordinator
        .prepare(&first.id, vec![BundleOp::generated(order("from a"))])
        .await
        .unwrap();
    let b = coordinator
        .prepare(&second.id, vec![BundleOp::generated(order("from b"))])
        .await
        .unwrap();

    coordinator.commit(a).await.unwrap();
    let err = coordinator.commit(b).await.unwrap_err();
    assert!(matches!(err, RegenError::ConcurrentModificationConflict { .. }));

    let stored = store
        .get_node(&node(NodeKind::Aggregate, "AGG_ORDER"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.get("description").and_then(|v| v.as_str()), Some("from a"));

    let loser = run::get(store.as_ref(), &second.id).await.unwrap().unwrap();
    assert_eq!(loser.status, RunStatus::Failed);
    assert_eq!(loser.failure_kind.as_deref(), Some("ConcurrentModificationConflict"));
    assert_eq!(loser.unapplied, ["upsert Aggregate:AGG_ORDER"]);
}

#[tokio::test]
async fn test_disjoint_writers_both_complete() {
    let (store, pipeline) = seeded(EngineConfig::default()).await;
    let coordinator = pipeline.coordinator();
    let command: NodePayload = serde_json::from_value(json!({
        "label": "Command", "id": "CMD_PLACE_ORDER", "name": "PlaceOrder", "description": "b"
    }))
    .unwrap();

    let first = run::start(store.as_ref(), RunPhase::Structural, "worker-a").await.unwrap();
    let second = run::start(store.as_ref(), RunPhase::Behavioral, "worker-b").await.unwrap();
    let a = coordinator
        .prepare(&first.id, vec![BundleOp::generated(order("a"))])
        .await
        .unwrap();
    let b = coordinator
        .prepare(&second.id, vec![BundleOp::generated(command)])
        .await
        .unwrap();

    let (a, b) = tokio::join!(coordinator.commit(a), coordinator.commit(b));
    assert_eq!(a.unwrap().changes.len(), 1);
    assert_eq!(b.unwrap().changes.len(), 1);
}

#[tokio::test]
async fn test_identifier_reused_across_kinds_fails_the_run() {
    let (store, pipeline) = seeded(EngineConfig::default()).await;
    let clash: NodePayload = serde_json::from_value(json!({
        "label": "Command", "id": "AGG_ORDER", "name": "Order"
    }))
    .unwrap();

    let err = pipeline
        .coordinator()
        .execute(RunPhase::Admin, "tester", vec![BundleOp::upsert(clash, "typo")])
        .await
        .unwrap_err();
    assert!(matches!(err, RegenError::DuplicateIdentifierConflict { .. }));

    let failed = run::list(store.as_ref(), Some(RunStatus::Failed)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failure_kind.as_deref(), Some("DuplicateIdentifierConflict"));
    assert!(store
        .get_node(&node(NodeKind::Command, "AGG_ORDER"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_rejected_bundle_leaves_no_partial_dirty_state() {
    let (store, pipeline) = seeded(EngineConfig::default()).await;
    let ops = vec![
        BundleOp::MarkDirty {
            nodes: vec![
                node(NodeKind::Aggregate, "AGG_ORDER"),
                node(NodeKind::Command, "CMD_PLACE_ORDER"),
            ],
            reason: "manual".into(),
        },
        BundleOp::MarkDirty {
            nodes: vec![node(NodeKind::Event, "EVT_MISSING")],
            reason: "manual".into(),
        },
    ];
    let err = pipeline
        .coordinator()
        .execute(RunPhase::Admin, "tester", ops)
        .await
        .unwrap_err();
    assert!(matches!(err, RegenError::DanglingReference(_)));
    assert!(dirty::list(store.as_ref(), None).await.unwrap().is_empty());
    assert!(dirty::audit(store.as_ref()).await.unwrap().is_empty());
}
