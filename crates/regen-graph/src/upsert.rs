//! Idempotent node upserts and explicit event-chain links.

use chrono::Utc;
use tracing::debug;

use regen_core::model::change::ChangeRecord;
use regen_core::model::dirty::{REGENERATED_AT, REGENERATED_BY};
use regen_core::model::{
    Direction, NodeRef, Props, RelClass, RelType, CREATED_AT, FINGERPRINT, UPDATED_AT,
};
use regen_core::{NodePayload, RegenError, RegenResult};

use crate::change::{evaluate, stage_change};
use crate::store::{read_through, GraphStore, Precondition, UnitOfWork, WriteOp};

/// Extra behavior for one upsert.
#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    /// Recorded on the Change record when the fingerprint moves.
    pub reason: String,
    /// Run whose generation output this payload is; stamps `regenerated_at`/`regenerated_by`.
    pub regenerated_by: Option<String>,
}

impl UpsertOptions {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            regenerated_by: None,
        }
    }

    pub fn generated(run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            reason: format!("regenerated by {run_id}"),
            regenerated_by: Some(run_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub node: NodeRef,
    pub created: bool,
    pub changed: bool,
    pub fingerprint: String,
    pub change: Option<ChangeRecord>,
}

/// Stage a create-or-update of `payload` into `unit`.
///
/// Nothing is staged for an unchanged payload unless it carries a
/// regeneration stamp.
pub async fn stage_upsert(
    store: &dyn GraphStore,
    unit: &mut UnitOfWork,
    payload: &NodePayload,
    options: &UpsertOptions,
) -> RegenResult<UpsertOutcome> {
    payload.validate()?;
    let node = payload.node_ref();
    let stored = store.get_node(&node).await?;
    let current = read_through(store, unit, &node).await?;

    let parent = payload.parent();
    if let Some((parent_ref, _)) = &parent {
        if read_through(store, unit, parent_ref).await?.is_none() {
            return Err(RegenError::dangling(format!(
                "{node} declares parent {parent_ref}, which does not exist"
            )));
        }
    }

    if !unit.creates(&node) {
        unit.require(Precondition::Version {
            node: node.clone(),
            expected: stored.as_ref().map(|n| n.version),
        });
    }

    let fingerprint = payload.fingerprint();
    let evaluation = evaluate(store, unit, &node, &fingerprint).await?;
    let created = current.is_none();
    let now = Utc::now();

    let mut stamp = Props::new();
    if let Some(run_id) = &options.regenerated_by {
        stamp.insert(REGENERATED_AT.to_string(), now.into());
        stamp.insert(REGENERATED_BY.to_string(), run_id.clone().into());
    }

    if !evaluation.changed && !created {
        if !stamp.is_empty() {
            unit.push(WriteOp::SetProps {
                node: node.clone(),
                props: stamp,
            });
        }
        debug!(node = %node, "Upsert unchanged");
        return Ok(UpsertOutcome {
            node,
            created: false,
            changed: false,
            fingerprint,
            change: None,
        });
    }

    let mut set = payload.props();
    let stale: Vec<String> = current
        .as_ref()
        .map(|existing| {
            NodePayload::attribute_keys(node.kind)
                .iter()
                .copied()
                .filter(|key| !set.contains_key(*key) && existing.get(key).is_some())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    set.insert(FINGERPRINT.to_string(), fingerprint.clone().into());
    set.insert(UPDATED_AT.to_string(), now.into());
    set.extend(stamp);
    let mut on_create = Props::new();
    on_create.insert(CREATED_AT.to_string(), now.into());
    unit.push(WriteOp::MergeNode {
        node: node.clone(),
        on_create,
        set,
    });
    if !stale.is_empty() {
        debug!(node = %node, keys = ?stale, "Removing attributes dropped from payload");
        unit.push(WriteOp::RemoveProps {
            node: node.clone(),
            keys: stale,
        });
    }

    if stored.is_some() {
        detach_other_owners(store, unit, &node, parent.as_ref().map(|(p, _)| p)).await?;
    }
    if let Some((parent_ref, rel)) = parent {
        unit.push(WriteOp::MergeEdge {
            from: parent_ref,
            rel,
            to: node.clone(),
            on_create: Props::new(),
            set: Props::new(),
        });
    }

    let reason = if options.reason.is_empty() {
        if created { "created" } else { "updated" }
    } else {
        options.reason.as_str()
    };
    let change = stage_change(unit, &evaluation, reason);
    debug!(node = %node, created, "Staged upsert");

    Ok(UpsertOutcome {
        node,
        created,
        changed: true,
        fingerprint,
        change: Some(change),
    })
}

/// Remove containment edges into `node` from anything other than `keep`.
async fn detach_other_owners(
    store: &dyn GraphStore,
    unit: &mut UnitOfWork,
    node: &NodeRef,
    keep: Option<&NodeRef>,
) -> RegenResult<()> {
    for rel in RelType::ALL.into_iter().filter(RelType::is_containment) {
        for edge in store.neighbors(node, rel, Direction::Incoming).await? {
            let kept = keep.is_some_and(|k| edge.other == *k && rel.allows(k.kind, node.kind));
            if !kept {
                debug!(node = %node, old_parent = %edge.other, "Detaching previous owner");
                unit.push(WriteOp::DeleteEdge {
                    from: edge.other,
                    rel,
                    to: node.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Upsert a single payload in its own unit.
pub async fn upsert(
    store: &dyn GraphStore,
    payload: &NodePayload,
    options: &UpsertOptions,
) -> RegenResult<UpsertOutcome> {
    let mut unit = UnitOfWork::new();
    let outcome = stage_upsert(store, &mut unit, payload, options).await?;
    store.commit(unit).await?;
    Ok(outcome)
}

/// Stage an event-chain relationship between two existing nodes.
///
/// Containment comes from payload parents and trace links from the
/// traceability manager, so both are rejected here.
pub async fn stage_link(
    store: &dyn GraphStore,
    unit: &mut UnitOfWork,
    from: &NodeRef,
    rel: RelType,
    to: &NodeRef,
) -> RegenResult<()> {
    if rel.class() != RelClass::EventChain {
        return Err(RegenError::invalid(format!(
            "{rel} is not an event-chain relationship"
        )));
    }
    if !rel.allows(from.kind, to.kind) {
        return Err(RegenError::invalid(format!(
            "{rel} cannot connect {from} to {to}"
        )));
    }
    for end in [from, to] {
        if read_through(store, unit, end).await?.is_none() {
            return Err(RegenError::dangling(format!("{rel} endpoint {end} does not exist")));
        }
    }
    unit.push(WriteOp::MergeEdge {
        from: from.clone(),
        rel,
        to: to.clone(),
        on_create: Props::new(),
        set: Props::new(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::history;
    use crate::store::MemoryStore;
    use regen_core::model::payload::{
        AggregatePayload, BoundedContextPayload, CommandPayload, ContextKind, Priority, Status,
        SyncMode, UserStoryPayload,
    };
    use regen_core::model::NodeKind;

    fn context(id: &str) -> NodePayload {
        NodePayload::BoundedContext(BoundedContextPayload {
            id: id.into(),
            name: id.to_lowercase(),
            description: String::new(),
            domain: "commerce".into(),
            kind: ContextKind::Core,
            status: Status::Confirmed,
            version: 1,
        })
    }

    fn aggregate(context_id: Option<&str>, description: &str) -> NodePayload {
        NodePayload::Aggregate(AggregatePayload {
            id: "AGG_ORDER".into(),
            name: "Order".into(),
            description: description.into(),
            kind: "root".into(),
            version: 1,
            status: Status::Draft,
            context_id: context_id.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn test_unchanged_payload_writes_nothing() {
        let store = MemoryStore::default();
        let payload = aggregate(None, "orders");
        let first = upsert(&store, &payload, &UpsertOptions::default()).await.unwrap();
        assert!(first.created && first.changed);
        let commits = store.commit_count();

        let second = upsert(&store, &payload, &UpsertOptions::default()).await.unwrap();
        assert!(!second.changed);
        assert!(second.change.is_none());
        assert_eq!(store.commit_count(), commits);
        assert_eq!(history(&store, &payload.node_ref(), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_parent_is_dangling() {
        let store = MemoryStore::default();
        let err = upsert(&store, &aggregate(Some("BC_MISSING"), "x"), &UpsertOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegenError::DanglingReference(_)));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_parent_and_child_in_one_unit() {
        let store = MemoryStore::default();
        let mut unit = UnitOfWork::new();
        let options = UpsertOptions::default();
        stage_upsert(&store, &mut unit, &context("BC_SALES"), &options).await.unwrap();
        stage_upsert(&store, &mut unit, &aggregate(Some("BC_SALES"), "x"), &options)
            .await
            .unwrap();
        store.commit(unit).await.unwrap();

        let owners = store
            .neighbors(
                &NodeRef::new(NodeKind::Aggregate, "AGG_ORDER"),
                RelType::HasAggregate,
                Direction::Incoming,
            )
            .await
            .unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].other.id, "BC_SALES");
    }

    #[tokio::test]
    async fn test_reparenting_keeps_a_single_owner() {
        let store = MemoryStore::default();
        let options = UpsertOptions::default();
        upsert(&store, &context("BC_SALES"), &options).await.unwrap();
        upsert(&store, &context("BC_FULFILMENT"), &options).await.unwrap();
        upsert(&store, &aggregate(Some("BC_SALES"), "x"), &options).await.unwrap();
        upsert(&store, &aggregate(Some("BC_FULFILMENT"), "x"), &options)
            .await
            .unwrap();

        let owners = store
            .neighbors(
                &NodeRef::new(NodeKind::Aggregate, "AGG_ORDER"),
                RelType::HasAggregate,
                Direction::Incoming,
            )
            .await
            .unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].other.id, "BC_FULFILMENT");
    }

    #[tokio::test]
    async fn test_dropped_optional_attribute_is_removed() {
        let store = MemoryStore::default();
        let story = |as_is: Option<&str>| {
            NodePayload::UserStory(UserStoryPayload {
                id: "US_X".into(),
                title: "Checkout".into(),
                story_text: "As a customer I want to pay".into(),
                priority: Priority::Medium,
                status: Status::Draft,
                as_is: as_is.map(str::to_string),
                to_be: Some("one-click payment".into()),
                keywords: Vec::new(),
                epic_id: None,
            })
        };
        let options = UpsertOptions::default();
        upsert(&store, &story(Some("legacy flow")), &options).await.unwrap();

        let outcome = upsert(&store, &story(None), &options).await.unwrap();
        assert!(outcome.changed);
        let node = store.get_node(&outcome.node).await.unwrap().unwrap();
        assert!(node.get("as_is").is_none());
        assert_eq!(node.get("to_be").and_then(|v| v.as_str()), Some("one-click payment"));
    }

    #[tokio::test]
    async fn test_dropped_parent_detaches_owner() {
        let store = MemoryStore::default();
        let options = UpsertOptions::default();
        upsert(&store, &context("BC_SALES"), &options).await.unwrap();
        upsert(&store, &aggregate(Some("BC_SALES"), "x"), &options).await.unwrap();
        upsert(&store, &aggregate(None, "x"), &options).await.unwrap();

        let owners = store
            .neighbors(
                &NodeRef::new(NodeKind::Aggregate, "AGG_ORDER"),
                RelType::HasAggregate,
                Direction::Incoming,
            )
            .await
            .unwrap();
        assert!(owners.is_empty());
    }

    #[tokio::test]
    async fn test_generated_upsert_of_same_content_only_stamps() {
        let store = MemoryStore::default();
        let payload = aggregate(None, "orders");
        upsert(&store, &payload, &UpsertOptions::default()).await.unwrap();

        let outcome = upsert(&store, &payload, &UpsertOptions::generated("RUN_1"))
            .await
            .unwrap();
        assert!(!outcome.changed);
        let node = store.get_node(&payload.node_ref()).await.unwrap().unwrap();
        assert_eq!(node.get(REGENERATED_BY).and_then(|v| v.as_str()), Some("RUN_1"));
        assert_eq!(history(&store, &payload.node_ref(), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_link_requires_event_chain_and_endpoints() {
        let store = MemoryStore::default();
        upsert(&store, &aggregate(None, "x"), &UpsertOptions::default()).await.unwrap();
        let command = NodePayload::Command(CommandPayload {
            id: "CMD_PLACE_ORDER".into(),
            name: "PlaceOrder".into(),
            description: String::new(),
            sync_mode: SyncMode::Sync,
            source: "API".into(),
        });
        let agg = NodeRef::new(NodeKind::Aggregate, "AGG_ORDER");
        let cmd = command.node_ref();

        let mut unit = UnitOfWork::new();
        assert!(matches!(
            stage_link(&store, &mut unit, &agg, RelType::HandlesCommand, &cmd).await,
            Err(RegenError::DanglingReference(_))
        ));
        assert!(stage_link(&store, &mut unit, &agg, RelType::HasField, &cmd)
            .await
            .is_err());

        upsert(&store, &command, &UpsertOptions::default()).await.unwrap();
        let mut unit = UnitOfWork::new();
        stage_link(&store, &mut unit, &agg, RelType::HandlesCommand, &cmd)
            .await
            .unwrap();
        store.commit(unit).await.unwrap();
        assert_eq!(
            store
                .neighbors(&agg, RelType::HandlesCommand, Direction::Outgoing)
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
