//! Traceability manager: scored links from requirements to design elements.

use chrono::Utc;
use tracing::debug;

use regen_core::model::trace::{TraceLink, CONFIDENCE, EVIDENCE_REF, RATIONALE};
use regen_core::model::{Direction, NodeRef, PropValue, Props, RelClass, RelType, CREATED_AT};
use regen_core::{RegenError, RegenResult};

use crate::store::{read_through, GraphStore, UnitOfWork, WriteOp};

/// Stage `link` into `unit`, returning the relationship type used.
///
/// Re-linking the same pair overwrites confidence, rationale and evidence
/// but keeps the original `created_at`.
pub async fn stage_trace(
    store: &dyn GraphStore,
    unit: &mut UnitOfWork,
    link: &TraceLink,
) -> RegenResult<RelType> {
    let rel = link.rel_type()?;
    for end in [&link.from, &link.to] {
        if read_through(store, unit, end).await?.is_none() {
            return Err(RegenError::dangling(format!(
                "trace endpoint {end} does not exist"
            )));
        }
    }

    let mut on_create = Props::new();
    on_create.insert(CREATED_AT.to_string(), Utc::now().into());
    unit.push(WriteOp::MergeEdge {
        from: link.from.clone(),
        rel,
        to: link.to.clone(),
        on_create,
        set: link.props(),
    });
    debug!(from = %link.from, to = %link.to, rel = %rel, confidence = link.confidence, "Staged trace link");
    Ok(rel)
}

/// Create or update a single trace link.
pub async fn link_trace(store: &dyn GraphStore, link: &TraceLink) -> RegenResult<RelType> {
    let mut unit = UnitOfWork::new();
    let rel = stage_trace(store, &mut unit, link).await?;
    store.commit(unit).await?;
    Ok(rel)
}

/// Trace links leaving a requirement node.
pub async fn traces_from(store: &dyn GraphStore, node: &NodeRef) -> RegenResult<Vec<TraceLink>> {
    collect(store, node, Direction::Outgoing).await
}

/// Trace links arriving at a design node.
pub async fn traces_to(store: &dyn GraphStore, node: &NodeRef) -> RegenResult<Vec<TraceLink>> {
    collect(store, node, Direction::Incoming).await
}

async fn collect(
    store: &dyn GraphStore,
    node: &NodeRef,
    direction: Direction,
) -> RegenResult<Vec<TraceLink>> {
    let mut links = Vec::new();
    for rel in RelType::ALL
        .into_iter()
        .filter(|r| r.class() == RelClass::Trace)
    {
        for edge in store.neighbors(node, rel, direction).await? {
            let (from, to) = match direction {
                Direction::Outgoing => (node.clone(), edge.other),
                Direction::Incoming => (edge.other, node.clone()),
            };
            links.push(TraceLink {
                from,
                to,
                confidence: edge
                    .props
                    .get(CONFIDENCE)
                    .and_then(PropValue::as_float)
                    .unwrap_or(0.0),
                rationale: edge
                    .props
                    .get(RATIONALE)
                    .and_then(PropValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
                evidence_ref: edge
                    .props
                    .get(EVIDENCE_REF)
                    .and_then(PropValue::as_str)
                    .map(str::to_string),
            });
        }
    }
    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upsert::{upsert, UpsertOptions};
    use crate::store::MemoryStore;
    use regen_core::model::payload::{AggregatePayload, Priority, Status, UserStoryPayload};
    use regen_core::model::NodeKind;
    use regen_core::NodePayload;

    async fn store_with_story_and_aggregate() -> MemoryStore {
        let store = MemoryStore::default();
        let story = NodePayload::UserStory(UserStoryPayload {
            id: "US_001".into(),
            title: "Place an order".into(),
            story_text: String::new(),
            priority: Priority::High,
            status: Status::Draft,
            as_is: None,
            to_be: None,
            keywords: vec![],
            epic_id: None,
        });
        let aggregate = NodePayload::Aggregate(AggregatePayload {
            id: "AGG_ORDER".into(),
            name: "Order".into(),
            description: String::new(),
            kind: "root".into(),
            version: 1,
            status: Status::Draft,
            context_id: None,
        });
        for payload in [story, aggregate] {
            upsert(&store, &payload, &UpsertOptions::default()).await.unwrap();
        }
        store
    }

    fn story_ref() -> NodeRef {
        NodeRef::new(NodeKind::UserStory, "US_001")
    }

    fn agg_ref() -> NodeRef {
        NodeRef::new(NodeKind::Aggregate, "AGG_ORDER")
    }

    #[tokio::test]
    async fn test_relink_overwrites_score_and_keeps_created_at() {
        let store = store_with_story_and_aggregate().await;
        let link = TraceLink::new(story_ref(), agg_ref(), 0.6).with_rationale("first pass");
        assert_eq!(link_trace(&store, &link).await.unwrap(), RelType::ImpactsAggregate);
        let created_at = store
            .neighbors(&story_ref(), RelType::ImpactsAggregate, Direction::Outgoing)
            .await
            .unwrap()[0]
            .props[CREATED_AT]
            .clone();

        let relinked = TraceLink::new(story_ref(), agg_ref(), 0.9)
            .with_rationale("confirmed")
            .with_evidence("doc#4");
        link_trace(&store, &relinked).await.unwrap();

        let edges = store
            .neighbors(&story_ref(), RelType::ImpactsAggregate, Direction::Outgoing)
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].props[CREATED_AT], created_at);

        let links = traces_from(&store, &story_ref()).await.unwrap();
        assert_eq!(links, vec![relinked.clone()]);
        assert_eq!(traces_to(&store, &agg_ref()).await.unwrap(), vec![relinked]);
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_writes_nothing() {
        let store = store_with_story_and_aggregate().await;
        let before = store.commit_count();
        let link = TraceLink::new(story_ref(), agg_ref(), 1.5);
        assert!(matches!(
            link_trace(&store, &link).await,
            Err(RegenError::InvalidPayload(_))
        ));
        assert_eq!(store.commit_count(), before);
    }

    #[tokio::test]
    async fn test_missing_target_is_dangling() {
        let store = store_with_story_and_aggregate().await;
        let link = TraceLink::new(story_ref(), NodeRef::new(NodeKind::Field, "F_NOPE"), 0.5);
        assert!(matches!(
            link_trace(&store, &link).await,
            Err(RegenError::DanglingReference(_))
        ));
    }
}
