//! Generation collaborator contract and context building.
//!
//! The engine sends one [`GenerationContext`] per phase and upserts the
//! returned entities and trace hints. Requirement text is resolved from the
//! store here, never carried on job messages.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use regen_core::model::trace::TraceLink;
use regen_core::model::{Direction, NodeKind, NodeRef, Props, RelType};
use regen_core::{DirtySet, NodePayload, Phase, RegenError, RegenResult};

use crate::store::{GraphStore, StoredNode};

/// A node as handed to the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub kind: NodeKind,
    pub id: String,
    pub props: Props,
    /// Current containment owner. Output that omits it detaches the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeRef>,
}

impl From<StoredNode> for NodeSnapshot {
    fn from(node: StoredNode) -> Self {
        Self {
            kind: node.kind,
            id: node.id,
            props: node.props,
            parent: None,
        }
    }
}

async fn owner(store: &dyn GraphStore, node: &NodeRef) -> RegenResult<Option<NodeRef>> {
    for rel in RelType::ALL.into_iter().filter(RelType::is_containment) {
        if let Some(parent) = first_neighbor(store, node, rel, Direction::Incoming).await? {
            return Ok(Some(parent));
        }
    }
    Ok(None)
}

async fn snapshot(store: &dyn GraphStore, node: &NodeRef) -> RegenResult<Option<NodeSnapshot>> {
    let Some(stored) = store.get_node(node).await? else {
        return Ok(None);
    };
    let mut snapshot = NodeSnapshot::from(stored);
    snapshot.parent = owner(store, node).await?;
    Ok(Some(snapshot))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    pub story: Option<NodeSnapshot>,
    pub criteria: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignContext {
    pub bounded_context_hint: Option<String>,
    pub existing_snapshot: Vec<NodeSnapshot>,
}

/// Payload sent to the collaborator for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationContext {
    pub root_id: String,
    pub phase: Phase,
    pub dirty_node_ids: BTreeMap<NodeKind, Vec<String>>,
    pub requirements: Requirements,
    pub context: DesignContext,
}

/// A trace suggestion by identifier. Kinds are looked up when omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceHint {
    pub from: String,
    pub to: String,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub from_kind: Option<NodeKind>,
    #[serde(default)]
    pub to_kind: Option<NodeKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceOutput {
    #[serde(default)]
    pub source_to_target: Vec<TraceHint>,
}

/// What the collaborator returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub entities: Vec<NodePayload>,
    #[serde(default)]
    pub trace: TraceOutput,
}

/// The external generation collaborator.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, context: &GenerationContext) -> RegenResult<GenerationOutput>;
}

async fn first_neighbor(
    store: &dyn GraphStore,
    node: &NodeRef,
    rel: RelType,
    direction: Direction,
) -> RegenResult<Option<NodeRef>> {
    Ok(store
        .neighbors(node, rel, direction)
        .await?
        .into_iter()
        .map(|edge| edge.other)
        .min())
}

async fn owning_story(store: &dyn GraphStore, root: &NodeRef) -> RegenResult<Option<NodeRef>> {
    match root.kind {
        NodeKind::UserStory => Ok(Some(root.clone())),
        NodeKind::AcceptanceCriterion => {
            first_neighbor(store, root, RelType::HasCriterion, Direction::Incoming).await
        }
        _ => Ok(None),
    }
}

/// Bounded context owning the first dirty aggregate, or the aggregate handling the first dirty command.
async fn bounded_context_hint(
    store: &dyn GraphStore,
    dirty: &DirtySet,
) -> RegenResult<Option<String>> {
    let by_kind = dirty.by_kind();
    let aggregate = match by_kind.get(&NodeKind::Aggregate).and_then(|ids| ids.first()) {
        Some(id) => Some(NodeRef::new(NodeKind::Aggregate, id.clone())),
        None => match by_kind.get(&NodeKind::Command).and_then(|ids| ids.first()) {
            Some(id) => {
                let command = NodeRef::new(NodeKind::Command, id.clone());
                first_neighbor(store, &command, RelType::HandlesCommand, Direction::Incoming)
                    .await?
            }
            None => None,
        },
    };
    let Some(aggregate) = aggregate else {
        return Ok(None);
    };
    Ok(
        first_neighbor(store, &aggregate, RelType::HasAggregate, Direction::Incoming)
            .await?
            .map(|context| context.id),
    )
}

/// Resolve everything the collaborator needs for `phase` from the store.
pub async fn build_context(
    store: &dyn GraphStore,
    root: &NodeRef,
    phase: Phase,
    dirty: &DirtySet,
) -> RegenResult<GenerationContext> {
    let mut requirements = Requirements::default();
    if let Some(story) = owning_story(store, root).await? {
        requirements.story = store.get_node(&story).await?.map(NodeSnapshot::from);
        let mut criteria: Vec<NodeRef> = store
            .neighbors(&story, RelType::HasCriterion, Direction::Outgoing)
            .await?
            .into_iter()
            .map(|edge| edge.other)
            .collect();
        criteria.sort();
        requirements.criteria = try_join_all(criteria.iter().map(|c| store.get_node(c)))
            .await?
            .into_iter()
            .flatten()
            .map(NodeSnapshot::from)
            .collect();
    }

    let phase_dirty = dirty.for_phase(phase);
    let mut refs = phase_dirty.refs();
    refs.sort();
    let existing_snapshot = try_join_all(refs.iter().map(|node| snapshot(store, node)))
        .await?
        .into_iter()
        .flatten()
        .collect();

    let context = GenerationContext {
        root_id: root.id.clone(),
        phase,
        dirty_node_ids: phase_dirty.by_kind(),
        requirements,
        context: DesignContext {
            bounded_context_hint: bounded_context_hint(store, &phase_dirty).await?,
            existing_snapshot,
        },
    };
    debug!(
        root = %root,
        phase = %phase,
        dirty = phase_dirty.len(),
        criteria = context.requirements.criteria.len(),
        "Built generation context"
    );
    Ok(context)
}

async fn resolve_end(
    store: &dyn GraphStore,
    id: &str,
    kind: Option<NodeKind>,
    entities: &[NodePayload],
    want_requirement: bool,
) -> RegenResult<NodeRef> {
    if let Some(kind) = kind {
        return Ok(NodeRef::new(kind, id));
    }
    if let Some(entity) = entities.iter().find(|e| e.id() == id) {
        return Ok(entity.node_ref());
    }
    let mut found: Vec<NodeRef> = store
        .find_by_id(id)
        .await?
        .into_iter()
        .filter(|n| n.kind.is_requirement() == want_requirement)
        .map(|n| n.node_ref())
        .collect();
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(RegenError::dangling(format!("trace hint names unknown node '{id}'"))),
        _ => Err(RegenError::invalid(format!(
            "trace hint node '{id}' is ambiguous; give its kind"
        ))),
    }
}

impl TraceHint {
    /// Turn the hint into a trace link, looking endpoints up among `entities` first.
    pub async fn resolve(
        &self,
        store: &dyn GraphStore,
        entities: &[NodePayload],
    ) -> RegenResult<TraceLink> {
        let from = resolve_end(store, &self.from, self.from_kind, &[], true).await?;
        let to = resolve_end(store, &self.to, self.to_kind, entities, false).await?;
        let mut link = TraceLink::new(from, to, self.confidence);
        if let Some(rationale) = &self.rationale {
            link = link.with_rationale(rationale.clone());
        }
        Ok(link)
    }
}
