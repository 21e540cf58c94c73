mod common;

use std::time::Duration;

use serde_json::json;

use regen_core::{EngineConfig, IdPolicy, NodeKind, RegenError};
use regen_graph::change::{detect, history};
use regen_graph::{
    find_impact, load_seed, resolve_roots, upsert, BatchCoordinator, GraphStore, ImpactOptions,
    MemoryStore, SeedDocument, UpsertOptions,
};

use common::{edited_story, ids, node, seeded};

#[tokio::test]
async fn test_story_change_reaches_the_event_chain() {
    let (store, _) = seeded(EngineConfig::default()).await;
    let story = node(NodeKind::UserStory, "US_001");
    let before = store.get_node(&story).await.unwrap().unwrap();

    let (evaluation, record) = detect(
        store.as_ref(),
        &edited_story("As a customer I want to place an order with a voucher"),
        "story edited",
    )
    .await
    .unwrap();
    let record = record.unwrap();
    assert!(evaluation.changed);
    assert_eq!(record.before_hash.as_deref(), before.fingerprint());
    assert_ne!(Some(record.after_hash.as_str()), before.fingerprint());
    assert_eq!(history(store.as_ref(), &story, None).await.unwrap().len(), 2);

    let report = find_impact(store.as_ref(), &[story], ImpactOptions::default())
        .await
        .unwrap();
    assert_eq!(report.ids(NodeKind::Aggregate), ids(&["AGG_ORDER"]));
    assert_eq!(report.ids(NodeKind::Field), ids(&["F_ORDER_AMOUNT"]));
    assert_eq!(
        report.ids(NodeKind::Command),
        ids(&["CMD_PLACE_ORDER", "CMD_RESERVE_STOCK"])
    );
    assert_eq!(report.ids(NodeKind::Event), ids(&["EVT_ORDER_PLACED"]));
    assert_eq!(report.ids(NodeKind::Policy), ids(&["POL_RESERVE_STOCK"]));
    assert_eq!(report.impacted.len(), 5);
    assert_eq!(report.affected_aggregates, ids(&["AGG_STOCK"]));
    assert_eq!(report.contributors["Command:CMD_RESERVE_STOCK"], ids(&["US_001"]));
    assert_eq!(report.dirty_targets().len(), 7);
}

#[tokio::test]
async fn test_hop_budget_trims_the_chain_but_not_affected_aggregates() {
    let (store, _) = seeded(EngineConfig::default()).await;
    let report = find_impact(
        store.as_ref(),
        &[node(NodeKind::UserStory, "US_001")],
        ImpactOptions::default().with_max_hops(1),
    )
    .await
    .unwrap();

    assert_eq!(report.ids(NodeKind::Command), ids(&["CMD_PLACE_ORDER"]));
    assert_eq!(report.ids(NodeKind::Policy), ids(&["POL_RESERVE_STOCK"]));
    assert_eq!(report.affected_aggregates, ids(&["AGG_STOCK"]));
    assert_eq!(report.max_hops, 1);
}

#[tokio::test]
async fn test_criterion_root_skips_its_story() {
    let (store, _) = seeded(EngineConfig::default()).await;
    let report = find_impact(
        store.as_ref(),
        &[node(NodeKind::AcceptanceCriterion, "AC_001")],
        ImpactOptions::default(),
    )
    .await
    .unwrap();

    assert!(report.ids(NodeKind::UserStory).is_empty());
    assert!(report.ids(NodeKind::Aggregate).is_empty());
    assert_eq!(report.ids(NodeKind::Field), ids(&["F_ORDER_AMOUNT"]));
    assert_eq!(report.ids(NodeKind::Event), ids(&["EVT_ORDER_PLACED"]));
}

#[tokio::test]
async fn test_isolated_root_has_empty_report() {
    let (store, _) = seeded(EngineConfig::default()).await;
    let payload = serde_json::from_value(json!({
        "label": "Aggregate", "id": "AGG_LONELY", "name": "Lonely"
    }))
    .unwrap();
    upsert(store.as_ref(), &payload, &UpsertOptions::reason("test"))
        .await
        .unwrap();

    let report = find_impact(
        store.as_ref(),
        &[node(NodeKind::Aggregate, "AGG_LONELY")],
        ImpactOptions::default(),
    )
    .await
    .unwrap();
    assert!(report.is_empty());
    assert!(report.contributors.is_empty());
}

#[tokio::test]
async fn test_missing_root_is_dangling() {
    let (store, _) = seeded(EngineConfig::default()).await;
    let err = find_impact(
        store.as_ref(),
        &[node(NodeKind::UserStory, "US_404")],
        ImpactOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RegenError::DanglingReference(_)));
}

/// `CMD_i -> EVT_i <- POL_i -> CMD_{i+1}`, closing back on `CMD_0`.
fn ring(n: usize) -> SeedDocument {
    let mut nodes = Vec::new();
    let mut links = Vec::new();
    for i in 0..n {
        nodes.push(json!({"label": "Command", "id": format!("CMD_{i}"), "name": format!("Do{i}")}));
        nodes.push(json!({"label": "Event", "id": format!("EVT_{i}"), "name": format!("Done{i}")}));
        nodes.push(json!({"label": "Policy", "id": format!("POL_{i}"), "name": format!("Then{i}")}));
        links.push(json!({"from": {"kind": "Command", "id": format!("CMD_{i}")}, "rel": "EMITS_EVENT",
                          "to": {"kind": "Event", "id": format!("EVT_{i}")}}));
        links.push(json!({"from": {"kind": "Policy", "id": format!("POL_{i}")}, "rel": "LISTENS_EVENT",
                          "to": {"kind": "Event", "id": format!("EVT_{i}")}}));
        links.push(json!({"from": {"kind": "Policy", "id": format!("POL_{i}")}, "rel": "TRIGGERS_COMMAND",
                          "to": {"kind": "Command", "id": format!("CMD_{}", (i + 1) % n)}}));
    }
    serde_json::from_value(json!({"nodes": nodes, "links": links})).unwrap()
}

#[tokio::test]
async fn test_event_cycles_terminate_under_any_budget() {
    let store = std::sync::Arc::new(MemoryStore::default());
    let coordinator = BatchCoordinator::new(store.clone(), EngineConfig::default());
    load_seed(&coordinator, ring(5)).await.unwrap();
    let root = [node(NodeKind::Command, "CMD_0")];

    let short = find_impact(store.as_ref(), &root, ImpactOptions::default().with_max_hops(2))
        .await
        .unwrap();
    assert_eq!(short.ids(NodeKind::Command), ids(&["CMD_1", "CMD_2"]));
    assert_eq!(short.ids(NodeKind::Event), ids(&["EVT_0", "EVT_1", "EVT_2"]));

    let long = find_impact(store.as_ref(), &root, ImpactOptions::default().with_max_hops(10))
        .await
        .unwrap();
    assert_eq!(long.ids(NodeKind::Command).len(), 4);
    assert_eq!(long.ids(NodeKind::Event).len(), 5);
    assert_eq!(long.ids(NodeKind::Policy).len(), 5);
    assert!(!long.ids(NodeKind::Command).contains(&"CMD_0".to_string()));
}

#[tokio::test]
async fn test_slow_store_hits_traversal_timeout() {
    let (store, _) = seeded(EngineConfig::default()).await;
    store.set_read_latency(Duration::from_millis(25));
    let options = ImpactOptions {
        max_hops: 3,
        timeout: Duration::from_millis(30),
    };
    let err = find_impact(store.as_ref(), &[node(NodeKind::UserStory, "US_001")], options)
        .await
        .unwrap_err();
    assert!(matches!(err, RegenError::ImpactTraversalTimeout { budget_ms: 30 }));
}

#[tokio::test]
async fn test_bare_ids_must_be_unambiguous_under_label_scope() {
    let store = std::sync::Arc::new(MemoryStore::new(IdPolicy::LabelScoped));
    let mut config = EngineConfig::default();
    config.id_policy = IdPolicy::LabelScoped;
    let coordinator = BatchCoordinator::new(store.clone(), config);
    let document = serde_json::from_value(json!({"nodes": [
        {"label": "Aggregate", "id": "ORDER", "name": "Order"},
        {"label": "Command", "id": "ORDER", "name": "Order"},
        {"label": "Event", "id": "ORDER_PLACED", "name": "OrderPlaced"}
    ]}))
    .unwrap();
    load_seed(&coordinator, document).await.unwrap();

    let err = resolve_roots(store.as_ref(), &ids(&["ORDER"])).await.unwrap_err();
    assert!(matches!(err, RegenError::InvalidPayload(_)));

    let roots = resolve_roots(store.as_ref(), &ids(&["Command:ORDER", "ORDER_PLACED"]))
        .await
        .unwrap();
    assert_eq!(
        roots,
        vec![node(NodeKind::Command, "ORDER"), node(NodeKind::Event, "ORDER_PLACED")]
    );
}
