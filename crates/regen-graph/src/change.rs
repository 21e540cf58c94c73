//! Change detection.
//!
//! A node's baseline is the `after_hash` of its most recent Change record,
//! falling back to the fingerprint attribute on the node itself. A Change
//! record is only ever staged in the same unit that moves the node's
//! fingerprint to the record's `after_hash`.

use chrono::{DateTime, Utc};
use tracing::debug;

use regen_core::model::change::ChangeRecord;
use regen_core::model::{NodeKind, NodeRef, Props, RelType, FINGERPRINT, UPDATED_AT};
use regen_core::{NodePayload, RegenError, RegenResult};

use crate::store::{read_through, GraphStore, NodeQuery, UnitOfWork, WriteOp};

/// Result of comparing a payload against the recorded baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvaluation {
    pub node: NodeRef,
    pub before_hash: Option<String>,
    pub after_hash: String,
    pub changed: bool,
}

/// Most recent Change record for `node`, if any.
pub async fn latest_change(
    store: &dyn GraphStore,
    node: &NodeRef,
) -> RegenResult<Option<ChangeRecord>> {
    Ok(history(store, node, Some(1)).await?.into_iter().next())
}

/// Change records for `node`, newest first.
pub async fn history(
    store: &dyn GraphStore,
    node: &NodeRef,
    limit: Option<usize>,
) -> RegenResult<Vec<ChangeRecord>> {
    let query = NodeQuery::kind(NodeKind::Change)
        .eq("label", node.kind.label())
        .eq("node_id", node.id.as_str());
    let mut records: Vec<ChangeRecord> = store
        .find_nodes(&query)
        .await?
        .iter()
        .filter_map(|n| ChangeRecord::from_props(&n.id, &n.props))
        .collect();
    records.sort_by(|a, b| b.at.cmp(&a.at).then_with(|| b.id.cmp(&a.id)));
    if let Some(limit) = limit {
        records.truncate(limit);
    }
    Ok(records)
}

/// Change records at or after `since`, oldest first, optionally for one kind.
pub async fn changed_since(
    store: &dyn GraphStore,
    kind: Option<NodeKind>,
    since: Option<DateTime<Utc>>,
) -> RegenResult<Vec<ChangeRecord>> {
    let mut query = NodeQuery::kind(NodeKind::Change);
    if let Some(kind) = kind {
        query = query.eq("label", kind.label());
    }
    let mut records: Vec<ChangeRecord> = store
        .find_nodes(&query)
        .await?
        .iter()
        .filter_map(|n| ChangeRecord::from_props(&n.id, &n.props))
        .filter(|r| since.map_or(true, |s| r.at >= s))
        .collect();
    records.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.id.cmp(&b.id)));
    Ok(records)
}

/// Compare `after_hash` against the baseline of `node`. Read-only.
///
/// Fingerprints already staged in `unit` take precedence over the store.
pub async fn evaluate(
    store: &dyn GraphStore,
    unit: &UnitOfWork,
    node: &NodeRef,
    after_hash: &str,
) -> RegenResult<ChangeEvaluation> {
    let current = read_through(store, unit, node).await?;
    let staged_fp = unit
        .overlay(node, None)
        .and_then(|p| p.get(FINGERPRINT).and_then(|v| v.as_str().map(str::to_string)));

    let before_hash = match staged_fp {
        Some(fp) => Some(fp),
        None => match latest_change(store, node).await? {
            Some(record) => Some(record.after_hash),
            None => current
                .as_ref()
                .and_then(|n| n.fingerprint().map(str::to_string)),
        },
    };
    let changed = before_hash.as_deref() != Some(after_hash);

    Ok(ChangeEvaluation {
        node: node.clone(),
        before_hash,
        after_hash: after_hash.to_string(),
        changed,
    })
}

/// Stage an immutable Change record and its `CHANGED` edge.
///
/// Callers must stage the node's new fingerprint in the same unit.
pub fn stage_change(
    unit: &mut UnitOfWork,
    evaluation: &ChangeEvaluation,
    reason: &str,
) -> ChangeRecord {
    let record = ChangeRecord::new(
        &evaluation.node,
        evaluation.before_hash.clone(),
        evaluation.after_hash.clone(),
        reason,
    );
    let change_ref = NodeRef::new(NodeKind::Change, record.id.clone());
    unit.push(WriteOp::CreateNode {
        node: change_ref.clone(),
        props: record.to_props(),
    });
    unit.push(WriteOp::MergeEdge {
        from: change_ref,
        rel: RelType::Changed,
        to: evaluation.node.clone(),
        on_create: Props::new(),
        set: Props::new(),
    });
    debug!(
        node = %evaluation.node,
        before = ?evaluation.before_hash,
        after = %evaluation.after_hash,
        "Staged change record"
    );
    record
}

/// Record a fingerprint transition for an existing node without rewriting its attributes.
///
/// Returns `None` and writes nothing when the fingerprint is unchanged.
pub async fn detect(
    store: &dyn GraphStore,
    payload: &NodePayload,
    reason: &str,
) -> RegenResult<(ChangeEvaluation, Option<ChangeRecord>)> {
    payload.validate()?;
    let node = payload.node_ref();
    let Some(current) = store.get_node(&node).await? else {
        return Err(RegenError::dangling(format!(
            "cannot record a change for missing node {node}"
        )));
    };

    let mut unit = UnitOfWork::new();
    let evaluation = evaluate(store, &unit, &node, &payload.fingerprint()).await?;
    if !evaluation.changed {
        return Ok((evaluation, None));
    }

    unit.require(crate::store::Precondition::Version {
        node: node.clone(),
        expected: Some(current.version),
    });
    let mut props = Props::new();
    props.insert(FINGERPRINT.to_string(), evaluation.after_hash.clone().into());
    props.insert(UPDATED_AT.to_string(), Utc::now().into());
    unit.push(WriteOp::SetProps {
        node: node.clone(),
        props,
    });
    let record = stage_change(&mut unit, &evaluation, reason);
    store.commit(unit).await?;
    Ok((evaluation, Some(record)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use regen_core::model::payload::{AggregatePayload, Status};

    fn aggregate(description: &str) -> NodePayload {
        NodePayload::Aggregate(AggregatePayload {
            id: "AGG_ORDER".into(),
            name: "Order".into(),
            description: description.into(),
            kind: "root".into(),
            version: 1,
            status: Status::Draft,
            context_id: None,
        })
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::default();
        let payload = aggregate("v1");
        let mut props = payload.props();
        props.insert(FINGERPRINT.into(), payload.fingerprint().into());
        let mut unit = UnitOfWork::new();
        unit.push(WriteOp::MergeNode {
            node: payload.node_ref(),
            on_create: Props::new(),
            set: props,
        });
        store.commit(unit).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_baseline_falls_back_to_node_fingerprint() {
        let store = seeded().await;
        let payload = aggregate("v1");
        let eval = evaluate(&store, &UnitOfWork::new(), &payload.node_ref(), &payload.fingerprint())
            .await
            .unwrap();
        assert!(!eval.changed);
        assert_eq!(eval.before_hash.as_deref(), Some(payload.fingerprint().as_str()));
    }

    #[tokio::test]
    async fn test_detect_records_transition_once() {
        let store = seeded().await;
        let before = aggregate("v1").fingerprint();
        let (eval, record) = detect(&store, &aggregate("v2"), "description edited")
            .await
            .unwrap();
        assert!(eval.changed);
        let record = record.unwrap();
        assert_eq!(record.before_hash.as_deref(), Some(before.as_str()));

        let node = store.get_node(&eval.node).await.unwrap().unwrap();
        assert_eq!(node.fingerprint(), Some(record.after_hash.as_str()));

        let (again, none) = detect(&store, &aggregate("v2"), "replay").await.unwrap();
        assert!(!again.changed);
        assert!(none.is_none());
        assert_eq!(history(&store, &eval.node, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_detect_on_missing_node_is_dangling() {
        let store = MemoryStore::default();
        assert!(matches!(
            detect(&store, &aggregate("v1"), "x").await,
            Err(RegenError::DanglingReference(_))
        ));
    }

    #[tokio::test]
    async fn test_changed_since_filters_by_kind_and_time() {
        let store = seeded().await;
        let cutoff = Utc::now();
        detect(&store, &aggregate("v2"), "edit").await.unwrap();
        assert_eq!(changed_since(&store, None, Some(cutoff)).await.unwrap().len(), 1);
        assert!(changed_since(&store, Some(NodeKind::Command), None)
            .await
            .unwrap()
            .is_empty());
    }
}
