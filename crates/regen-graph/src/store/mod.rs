//! Graph store contract.
//!
//! The engine talks to storage only through [`GraphStore`]. Reads are
//! individual calls; writes are collected in a [`UnitOfWork`] and applied
//! atomically by [`GraphStore::commit`]. Every node carries a
//! store-maintained version that is bumped on each write and checked by
//! [`Precondition::Version`].

pub mod memory;
pub mod neo4j;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use regen_core::config::IdPolicy;
use regen_core::model::dirty::DIRTY;
use regen_core::model::{NodeKind, NodeRef, PropValue, Props, RelType, FINGERPRINT};
use regen_core::{Direction, RegenResult};

pub use memory::MemoryStore;
pub use neo4j::Neo4jStore;

/// A node as read from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredNode {
    pub kind: NodeKind,
    pub id: String,
    pub props: Props,
    pub version: u64,
}

impl StoredNode {
    pub fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.kind, self.id.clone())
    }

    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.props.get(key)
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.props.get(FINGERPRINT).and_then(PropValue::as_str)
    }

    pub fn is_dirty(&self) -> bool {
        self.props
            .get(DIRTY)
            .and_then(PropValue::as_bool)
            .unwrap_or(false)
    }

    /// Display name (title for requirements).
    pub fn name(&self) -> String {
        self.props
            .get("name")
            .or_else(|| self.props.get("title"))
            .and_then(PropValue::as_str)
            .unwrap_or(&self.id)
            .to_string()
    }
}

/// One relationship seen from a given node.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub rel: RelType,
    /// The node at the other end.
    pub other: NodeRef,
    pub props: Props,
}

/// Filter for node scans.
#[derive(Debug, Clone, Default)]
pub struct NodeQuery {
    pub kind: Option<NodeKind>,
    /// Every pair must match exactly.
    pub equals: Vec<(String, PropValue)>,
    /// At least one of these attributes must be present (ignored when empty).
    pub any_present: Vec<String>,
    pub limit: Option<usize>,
}

impl NodeQuery {
    pub fn kind(kind: NodeKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: Option<NodeKind>) -> Self {
        self.kind = kind;
        self
    }

    pub fn eq(mut self, key: &str, value: impl Into<PropValue>) -> Self {
        self.equals.push((key.to_string(), value.into()));
        self
    }

    pub fn any_of(mut self, keys: &[&str]) -> Self {
        self.any_present = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `props` satisfies the attribute filters.
    pub fn matches(&self, props: &Props) -> bool {
        let equals = self
            .equals
            .iter()
            .all(|(k, v)| props.get(k).is_some_and(|p| p == v));
        let present = self.any_present.is_empty()
            || self.any_present.iter().any(|k| props.contains_key(k));
        equals && present
    }
}

/// Kinds of schema constraint a store may report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConstraintType {
    Uniqueness,
    NodeKey,
    Existence,
    Other(String),
}

/// A constraint as listed by the store's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstraintInfo {
    pub name: String,
    pub label: String,
    pub properties: Vec<String>,
    pub constraint_type: ConstraintType,
}

impl ConstraintInfo {
    /// Whether this constraint enforces uniqueness of exactly `label.property`.
    pub fn enforces_unique(&self, label: &str, property: &str) -> bool {
        matches!(
            self.constraint_type,
            ConstraintType::Uniqueness | ConstraintType::NodeKey
        ) && self.label == label
            && self.properties.len() == 1
            && self.properties[0] == property
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub label: String,
    pub properties: Vec<String>,
}

/// A schema element to install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SchemaItem {
    Unique { kind: NodeKind, property: String },
    Index { kind: NodeKind, property: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreCapabilities {
    pub unique_constraints: bool,
    pub indexes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphCounts {
    pub nodes: usize,
    pub relationships: usize,
    pub by_kind: BTreeMap<NodeKind, usize>,
}

/// A single write inside a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create the node if absent (applying `on_create`), then apply `set`.
    MergeNode {
        node: NodeRef,
        on_create: Props,
        set: Props,
    },
    /// Create a node that must not already exist.
    CreateNode { node: NodeRef, props: Props },
    /// Overwrite attributes on an existing node.
    SetProps { node: NodeRef, props: Props },
    /// Remove attributes from an existing node.
    RemoveProps { node: NodeRef, keys: Vec<String> },
    /// Create the relationship if absent (applying `on_create`), then apply `set`.
    MergeEdge {
        from: NodeRef,
        rel: RelType,
        to: NodeRef,
        on_create: Props,
        set: Props,
    },
    DeleteEdge {
        from: NodeRef,
        rel: RelType,
        to: NodeRef,
    },
}

impl WriteOp {
    /// The node whose version this op bumps, if any.
    pub fn written_node(&self) -> Option<&NodeRef> {
        match self {
            WriteOp::MergeNode { node, .. }
            | WriteOp::CreateNode { node, .. }
            | WriteOp::SetProps { node, .. }
            | WriteOp::RemoveProps { node, .. } => Some(node),
            _ => None,
        }
    }
}

/// Optimistic check evaluated inside the commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    /// `expected: None` requires the node to be absent.
    Version { node: NodeRef, expected: Option<u64> },
}

/// Pending changes to one node inside a unit.
#[derive(Debug, Clone, Default)]
struct Staged {
    merged: bool,
    on_create: Props,
    set: Props,
    removed: BTreeSet<String>,
}

/// Writes applied together or not at all.
///
/// Earlier ops in the unit are visible to later staging through
/// [`UnitOfWork::overlay`], so a bundle can create a parent and its children
/// together.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    ops: Vec<WriteOp>,
    preconditions: Vec<Precondition>,
    staged: HashMap<NodeRef, Staged>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        match &op {
            WriteOp::MergeNode {
                node,
                on_create,
                set,
            } => {
                let entry = self.staged.entry(node.clone()).or_default();
                if !entry.merged {
                    entry.merged = true;
                    entry.on_create = on_create.clone();
                }
                entry.stage_set(set);
            }
            WriteOp::CreateNode { node, props } => {
                let entry = self.staged.entry(node.clone()).or_default();
                entry.merged = true;
                entry.stage_set(props);
            }
            WriteOp::SetProps { node, props } => {
                self.staged.entry(node.clone()).or_default().stage_set(props);
            }
            WriteOp::RemoveProps { node, keys } => {
                let entry = self.staged.entry(node.clone()).or_default();
                for key in keys {
                    entry.set.remove(key);
                    entry.removed.insert(key.clone());
                }
            }
            _ => {}
        }
        self.ops.push(op);
    }

    /// Add a version check; the first check declared for a node wins.
    pub fn require(&mut self, precondition: Precondition) {
        let Precondition::Version { node, .. } = &precondition;
        let already = self
            .preconditions
            .iter()
            .any(|Precondition::Version { node: n, .. }| n == node);
        if !already {
            self.preconditions.push(precondition);
        }
    }

    /// Attributes of `node` as they will be after this unit, given its stored attributes.
    ///
    /// `None` when the node neither exists nor is created by the unit.
    pub fn overlay(&self, node: &NodeRef, stored: Option<&Props>) -> Option<Props> {
        let Some(staged) = self.staged.get(node) else {
            return stored.cloned();
        };
        let mut props = match stored {
            Some(props) => props.clone(),
            None if staged.merged => staged.on_create.clone(),
            None => return None,
        };
        props.extend(staged.set.clone());
        for key in &staged.removed {
            props.remove(key);
        }
        Some(props)
    }

    /// Whether the unit creates or merges `node`.
    pub fn creates(&self, node: &NodeRef) -> bool {
        self.staged.get(node).is_some_and(|s| s.merged)
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn preconditions(&self) -> &[Precondition] {
        &self.preconditions
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Distinct nodes written by this unit, in first-write order.
    pub fn written_nodes(&self) -> Vec<NodeRef> {
        let mut seen = Vec::new();
        for node in self.ops.iter().filter_map(WriteOp::written_node) {
            if !seen.contains(node) {
                seen.push(node.clone());
            }
        }
        seen
    }
}

impl Staged {
    fn stage_set(&mut self, props: &Props) {
        for (key, value) in props {
            self.removed.remove(key);
            self.set.insert(key.clone(), value.clone());
        }
    }
}

/// Read `node` as the unit will leave it: stored state plus staged writes.
///
/// The version is the stored one (0 for nodes the unit creates).
pub async fn read_through(
    store: &dyn GraphStore,
    unit: &UnitOfWork,
    node: &NodeRef,
) -> RegenResult<Option<StoredNode>> {
    let stored = store.get_node(node).await?;
    let version = stored.as_ref().map_or(0, |s| s.version);
    Ok(unit
        .overlay(node, stored.as_ref().map(|s| &s.props))
        .map(|props| StoredNode {
            kind: node.kind,
            id: node.id.clone(),
            props,
            version,
        }))
}

/// Result of a successful commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReceipt {
    pub nodes_written: Vec<NodeRef>,
    pub edges_written: usize,
    pub versions: BTreeMap<NodeRef, u64>,
}

/// Property-graph storage consumed by the engine.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// The identifier policy this store was constructed with.
    fn id_policy(&self) -> IdPolicy;

    /// Look a node up under the store's identifier policy.
    ///
    /// Under [`IdPolicy::Global`] an identifier held by a node of another
    /// kind is a `DuplicateIdentifierConflict`.
    async fn get_node(&self, node: &NodeRef) -> RegenResult<Option<StoredNode>>;

    /// Every domain node carrying `id`, regardless of kind.
    async fn find_by_id(&self, id: &str) -> RegenResult<Vec<StoredNode>>;

    async fn find_nodes(&self, query: &NodeQuery) -> RegenResult<Vec<StoredNode>>;

    async fn neighbors(
        &self,
        node: &NodeRef,
        rel: RelType,
        direction: Direction,
    ) -> RegenResult<Vec<Edge>>;

    async fn constraints(&self) -> RegenResult<Vec<ConstraintInfo>>;

    async fn indexes(&self) -> RegenResult<Vec<IndexInfo>>;

    /// Install a schema element; already-present elements are not an error.
    async fn install(&self, item: &SchemaItem) -> RegenResult<()>;

    fn capabilities(&self) -> StoreCapabilities;

    async fn counts(&self) -> RegenResult<GraphCounts>;

    /// Apply every op in order, atomically, after checking all preconditions.
    async fn commit(&self, unit: UnitOfWork) -> RegenResult<CommitReceipt>;
}

pub type SharedStore = Arc<dyn GraphStore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn agg() -> NodeRef {
        NodeRef::new(NodeKind::Aggregate, "AGG_ORDER")
    }

    #[test]
    fn test_overlay_applies_staged_writes() {
        let mut unit = UnitOfWork::new();
        let mut on_create = Props::new();
        on_create.insert("created_at".into(), "t0".into());
        let mut set = Props::new();
        set.insert("name".into(), "Order".into());
        unit.push(WriteOp::MergeNode {
            node: agg(),
            on_create,
            set,
        });
        unit.push(WriteOp::RemoveProps {
            node: agg(),
            keys: vec!["created_at".into()],
        });

        let staged = unit.overlay(&agg(), None).unwrap();
        assert_eq!(staged["name"].as_str(), Some("Order"));
        assert!(!staged.contains_key("created_at"));
        assert!(unit.creates(&agg()));
    }

    #[test]
    fn test_overlay_of_set_on_missing_node_is_none() {
        let mut unit = UnitOfWork::new();
        let mut props = Props::new();
        props.insert("dirty".into(), true.into());
        unit.push(WriteOp::SetProps {
            node: agg(),
            props,
        });
        assert!(unit.overlay(&agg(), None).is_none());

        let mut stored = Props::new();
        stored.insert("name".into(), "Order".into());
        let merged = unit.overlay(&agg(), Some(&stored)).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_first_precondition_wins() {
        let mut unit = UnitOfWork::new();
        unit.require(Precondition::Version {
            node: agg(),
            expected: Some(3),
        });
        unit.require(Precondition::Version {
            node: agg(),
            expected: Some(4),
        });
        assert_eq!(
            unit.preconditions(),
            &[Precondition::Version {
                node: agg(),
                expected: Some(3)
            }]
        );
    }

    #[test]
    fn test_written_nodes_are_distinct() {
        let mut unit = UnitOfWork::new();
        for _ in 0..2 {
            unit.push(WriteOp::SetProps {
                node: agg(),
                props: Props::new(),
            });
        }
        unit.push(WriteOp::MergeEdge {
            from: agg(),
            rel: RelType::HandlesCommand,
            to: NodeRef::new(NodeKind::Command, "CMD_PLACE_ORDER"),
            on_create: Props::new(),
            set: Props::new(),
        });
        assert_eq!(unit.written_nodes(), vec![agg()]);
    }

    #[test]
    fn test_query_matching() {
        let mut props = Props::new();
        props.insert("status".into(), "failed".into());
        let query = NodeQuery::kind(NodeKind::Run).eq("status", "failed");
        assert!(query.matches(&props));
        assert!(!NodeQuery::default().any_of(&["dirty"]).matches(&props));
    }
}
