//! Dirty marker.
//!
//! `dirty`, `dirty_reason` and `dirty_at` are always written and removed
//! together, in one op per node.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use regen_core::config::ClearPolicy;
use regen_core::model::dirty::{DIRTY, DIRTY_AT, DIRTY_FIELDS, DIRTY_REASON, REGENERATED_AT};
use regen_core::model::{prop_str, prop_time, NodeKind, NodeRef, Props};
use regen_core::{DirtyEntry, DirtySet, RegenError, RegenResult};

use crate::store::{read_through, GraphStore, NodeQuery, Precondition, UnitOfWork, WriteOp};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarkOutcome {
    pub marked: Vec<NodeRef>,
    pub missing: Vec<NodeRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClearOutcome {
    pub cleared: Vec<NodeRef>,
    /// Dirty nodes whose regeneration output has not been upserted since they were marked.
    pub refused: Vec<NodeRef>,
    pub not_dirty: Vec<NodeRef>,
    pub missing: Vec<NodeRef>,
}

/// A node holding some but not all of the dirty attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialDirty {
    pub node: NodeRef,
    pub present: Vec<String>,
}

fn require_design(node: &NodeRef) -> RegenResult<()> {
    if node.kind.is_design() {
        Ok(())
    } else {
        Err(RegenError::invalid(format!(
            "{node} is not a design node and cannot be dirty"
        )))
    }
}

fn guard_version(unit: &mut UnitOfWork, node: &NodeRef, version: u64) {
    if !unit.creates(node) {
        unit.require(Precondition::Version {
            node: node.clone(),
            expected: Some(version),
        });
    }
}

/// Stage dirty flags for `nodes`. Re-marking overwrites reason and timestamp.
pub async fn stage_mark(
    store: &dyn GraphStore,
    unit: &mut UnitOfWork,
    nodes: &[NodeRef],
    reason: &str,
) -> RegenResult<MarkOutcome> {
    let now = Utc::now();
    let mut outcome = MarkOutcome::default();
    for node in nodes {
        require_design(node)?;
        let Some(current) = read_through(store, unit, node).await? else {
            warn!(node = %node, "Cannot mark missing node dirty");
            outcome.missing.push(node.clone());
            continue;
        };
        guard_version(unit, node, current.version);

        let mut props = Props::new();
        props.insert(DIRTY.to_string(), true.into());
        props.insert(DIRTY_REASON.to_string(), reason.into());
        props.insert(DIRTY_AT.to_string(), now.into());
        unit.push(WriteOp::SetProps {
            node: node.clone(),
            props,
        });
        debug!(node = %node, reason, "Staged dirty mark");
        outcome.marked.push(node.clone());
    }
    Ok(outcome)
}

/// Stage removal of the dirty attributes from `nodes`.
///
/// Under [`ClearPolicy::ManualApproval`] a node is only cleared once its
/// `regenerated_at` stamp, as this unit would leave it, is no older than
/// its `dirty_at`.
pub async fn stage_clear(
    store: &dyn GraphStore,
    unit: &mut UnitOfWork,
    nodes: &[NodeRef],
    policy: ClearPolicy,
) -> RegenResult<ClearOutcome> {
    let mut outcome = ClearOutcome::default();
    for node in nodes {
        require_design(node)?;
        let Some(current) = read_through(store, unit, node).await? else {
            outcome.missing.push(node.clone());
            continue;
        };
        if !DIRTY_FIELDS.iter().any(|f| current.props.contains_key(*f)) {
            outcome.not_dirty.push(node.clone());
            continue;
        }
        if policy == ClearPolicy::ManualApproval && !regenerated_since_marked(&current.props) {
            warn!(node = %node, "Refusing to clear dirty node without newer regeneration output");
            outcome.refused.push(node.clone());
            continue;
        }

        guard_version(unit, node, current.version);
        unit.push(WriteOp::RemoveProps {
            node: node.clone(),
            keys: DIRTY_FIELDS.iter().map(|f| f.to_string()).collect(),
        });
        debug!(node = %node, "Staged dirty clear");
        outcome.cleared.push(node.clone());
    }
    Ok(outcome)
}

fn regenerated_since_marked(props: &Props) -> bool {
    match (prop_time(props, REGENERATED_AT), prop_time(props, DIRTY_AT)) {
        (Some(regenerated), Some(marked)) => regenerated >= marked,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn refs(kind: NodeKind, ids: &[String]) -> Vec<NodeRef> {
    ids.iter().map(|id| NodeRef::new(kind, id.clone())).collect()
}

/// Mark `ids` of `kind` dirty in one unit.
pub async fn mark(
    store: &dyn GraphStore,
    kind: NodeKind,
    ids: &[String],
    reason: &str,
) -> RegenResult<MarkOutcome> {
    let mut unit = UnitOfWork::new();
    let outcome = stage_mark(store, &mut unit, &refs(kind, ids), reason).await?;
    store.commit(unit).await?;
    info!(kind = %kind, marked = outcome.marked.len(), "Marked nodes dirty");
    Ok(outcome)
}

/// Clear `ids` of `kind` in one unit.
pub async fn clear(
    store: &dyn GraphStore,
    kind: NodeKind,
    ids: &[String],
    policy: ClearPolicy,
) -> RegenResult<ClearOutcome> {
    let mut unit = UnitOfWork::new();
    let outcome = stage_clear(store, &mut unit, &refs(kind, ids), policy).await?;
    store.commit(unit).await?;
    info!(
        kind = %kind,
        cleared = outcome.cleared.len(),
        refused = outcome.refused.len(),
        "Cleared dirty nodes"
    );
    Ok(outcome)
}

/// Current dirty registry, optionally for one kind.
pub async fn list(store: &dyn GraphStore, kind: Option<NodeKind>) -> RegenResult<DirtySet> {
    let query = NodeQuery::default().with_kind(kind).eq(DIRTY, true);
    let mut entries: Vec<DirtyEntry> = store
        .find_nodes(&query)
        .await?
        .into_iter()
        .filter(|n| n.kind.is_design())
        .map(|n| DirtyEntry {
            reason: prop_str(&n.props, DIRTY_REASON).unwrap_or_default(),
            at: prop_time(&n.props, DIRTY_AT).unwrap_or(DateTime::<Utc>::MIN_UTC),
            node: n.node_ref(),
        })
        .collect();
    entries.sort_by(|a, b| a.node.cmp(&b.node));
    Ok(DirtySet::new(entries))
}

/// Nodes carrying a partial dirty triple, or a triple with `dirty` not set to true.
pub async fn audit(store: &dyn GraphStore) -> RegenResult<Vec<PartialDirty>> {
    let query = NodeQuery::default().any_of(&DIRTY_FIELDS);
    let mut partial = Vec::new();
    for node in store.find_nodes(&query).await? {
        let present: Vec<String> = DIRTY_FIELDS
            .iter()
            .filter(|f| node.props.contains_key(**f))
            .map(|f| f.to_string())
            .collect();
        if present.len() < DIRTY_FIELDS.len() || !node.is_dirty() {
            partial.push(PartialDirty {
                node: node.node_ref(),
                present,
            });
        }
    }
    if !partial.is_empty() {
        warn!(nodes = partial.len(), "Found nodes with partial dirty state");
    }
    Ok(partial)
}
