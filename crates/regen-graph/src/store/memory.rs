//! In-memory reference store.
//!
//! Commits are copy-on-write: the current graph is cloned, every op is
//! applied to the clone, and the clone replaces the original only if all
//! ops succeeded. Readers never observe a half-applied unit.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use regen_core::config::IdPolicy;
use regen_core::model::{KindCategory, NodeKind, NodeRef, Props, RelType};
use regen_core::{Direction, RegenError, RegenResult};

use super::{
    CommitReceipt, ConstraintInfo, ConstraintType, Edge, GraphCounts, GraphStore, IndexInfo,
    NodeQuery, Precondition, SchemaItem, StoreCapabilities, StoredNode, UnitOfWork, WriteOp,
};

#[derive(Debug, Clone)]
struct NodeRecord {
    props: Props,
    version: u64,
}

type EdgeKey = (NodeRef, RelType, NodeRef);

#[derive(Debug, Clone, Default)]
struct GraphData {
    nodes: HashMap<NodeRef, NodeRecord>,
    ids: HashMap<String, BTreeSet<NodeKind>>,
    edges: HashMap<EdgeKey, Props>,
    outgoing: HashMap<(NodeRef, RelType), BTreeSet<NodeRef>>,
    incoming: HashMap<(NodeRef, RelType), BTreeSet<NodeRef>>,
    constraints: Vec<ConstraintInfo>,
    indexes: Vec<IndexInfo>,
}

impl GraphData {
    fn stored(&self, node: &NodeRef) -> Option<StoredNode> {
        self.nodes.get(node).map(|record| StoredNode {
            kind: node.kind,
            id: node.id.clone(),
            props: record.props.clone(),
            version: record.version,
        })
    }

    fn version(&self, node: &NodeRef) -> Option<u64> {
        self.nodes.get(node).map(|r| r.version)
    }

    fn check_free_id(&self, node: &NodeRef, policy: IdPolicy) -> RegenResult<()> {
        if policy == IdPolicy::LabelScoped {
            return Ok(());
        }
        if let Some(existing) = self
            .ids
            .get(&node.id)
            .and_then(|kinds| kinds.iter().find(|k| **k != node.kind))
        {
            return Err(RegenError::DuplicateIdentifierConflict {
                id: node.id.clone(),
                existing: existing.to_string(),
                requested: node.kind.to_string(),
            });
        }
        Ok(())
    }

    fn insert_node(&mut self, node: &NodeRef, props: Props) {
        self.nodes
            .insert(node.clone(), NodeRecord { props, version: 1 });
        self.ids
            .entry(node.id.clone())
            .or_default()
            .insert(node.kind);
    }

    fn existing_mut(&mut self, node: &NodeRef) -> RegenResult<&mut NodeRecord> {
        self.nodes
            .get_mut(node)
            .ok_or_else(|| RegenError::dangling(format!("{node} does not exist")))
    }

    fn apply(&mut self, op: &WriteOp, policy: IdPolicy) -> RegenResult<bool> {
        match op {
            WriteOp::MergeNode {
                node,
                on_create,
                set,
            } => {
                if let Some(record) = self.nodes.get_mut(node) {
                    record.props.extend(set.clone());
                    record.version += 1;
                } else {
                    self.check_free_id(node, policy)?;
                    let mut props = on_create.clone();
                    props.extend(set.clone());
                    self.insert_node(node, props);
                }
                Ok(false)
            }
            WriteOp::CreateNode { node, props } => {
                if self.nodes.contains_key(node) {
                    return Err(RegenError::DuplicateIdentifierConflict {
                        id: node.id.clone(),
                        existing: node.kind.to_string(),
                        requested: node.kind.to_string(),
                    });
                }
                self.check_free_id(node, policy)?;
                self.insert_node(node, props.clone());
                Ok(false)
            }
            WriteOp::SetProps { node, props } => {
                let record = self.existing_mut(node)?;
                record.props.extend(props.clone());
                record.version += 1;
                Ok(false)
            }
            WriteOp::RemoveProps { node, keys } => {
                let record = self.existing_mut(node)?;
                for key in keys {
                    record.props.remove(key);
                }
                record.version += 1;
                Ok(false)
            }
            WriteOp::MergeEdge {
                from,
                rel,
                to,
                on_create,
                set,
            } => {
                for end in [from, to] {
                    if !self.nodes.contains_key(end) {
                        return Err(RegenError::dangling(format!(
                            "{rel} endpoint {end} does not exist"
                        )));
                    }
                }
                if !rel.allows(from.kind, to.kind) {
                    return Err(RegenError::invalid(format!(
                        "{rel} cannot connect {from} to {to}"
                    )));
                }
                let key = (from.clone(), *rel, to.clone());
                match self.edges.get_mut(&key) {
                    Some(props) => props.extend(set.clone()),
                    None => {
                        let mut props = on_create.clone();
                        props.extend(set.clone());
                        self.edges.insert(key, props);
                        self.outgoing
                            .entry((from.clone(), *rel))
                            .or_default()
                            .insert(to.clone());
                        self.incoming
                            .entry((to.clone(), *rel))
                            .or_default()
                            .insert(from.clone());
                    }
                }
                Ok(true)
            }
            WriteOp::DeleteEdge { from, rel, to } => {
                let key = (from.clone(), *rel, to.clone());
                if self.edges.remove(&key).is_some() {
                    if let Some(set) = self.outgoing.get_mut(&(from.clone(), *rel)) {
                        set.remove(to);
                    }
                    if let Some(set) = self.incoming.get_mut(&(to.clone(), *rel)) {
                        set.remove(from);
                    }
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }
}

/// Reference [`GraphStore`] held entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    policy: IdPolicy,
    supports_constraints: bool,
    data: RwLock<GraphData>,
    fail_commits: AtomicU32,
    read_latency_ms: AtomicU64,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new(policy: IdPolicy) -> Self {
        Self {
            policy,
            supports_constraints: true,
            data: RwLock::new(GraphData::default()),
            fail_commits: AtomicU32::new(0),
            read_latency_ms: AtomicU64::new(0),
            commits: AtomicUsize::new(0),
        }
    }

    /// A store whose catalog cannot express uniqueness constraints.
    pub fn without_constraint_support(policy: IdPolicy) -> Self {
        Self {
            supports_constraints: false,
            ..Self::new(policy)
        }
    }

    /// Make the next `n` commits fail with `StoreUnavailable`.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Delay every node and relationship read.
    pub fn set_read_latency(&self, latency: Duration) {
        self.read_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of non-empty units committed so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    async fn read_delay(&self) {
        let ms = self.read_latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(IdPolicy::default())
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    fn id_policy(&self) -> IdPolicy {
        self.policy
    }

    async fn get_node(&self, node: &NodeRef) -> RegenResult<Option<StoredNode>> {
        self.read_delay().await;
        let data = self.data.read().await;
        if self.policy == IdPolicy::Global {
            data.check_free_id(node, self.policy)?;
        }
        Ok(data.stored(node))
    }

    async fn find_by_id(&self, id: &str) -> RegenResult<Vec<StoredNode>> {
        let data = self.data.read().await;
        let kinds = data.ids.get(id).cloned().unwrap_or_default();
        Ok(kinds
            .into_iter()
            .filter(|k| k.category() != KindCategory::System)
            .filter_map(|kind| data.stored(&NodeRef::new(kind, id)))
            .collect())
    }

    async fn find_nodes(&self, query: &NodeQuery) -> RegenResult<Vec<StoredNode>> {
        let data = self.data.read().await;
        let mut found: Vec<StoredNode> = data
            .nodes
            .iter()
            .filter(|(node, _)| query.kind.map_or(true, |k| node.kind == k))
            .filter(|(_, record)| query.matches(&record.props))
            .filter_map(|(node, _)| data.stored(node))
            .collect();
        found.sort_by(|a, b| (a.kind, &a.id).cmp(&(b.kind, &b.id)));
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn neighbors(
        &self,
        node: &NodeRef,
        rel: RelType,
        direction: Direction,
    ) -> RegenResult<Vec<Edge>> {
        self.read_delay().await;
        let data = self.data.read().await;
        let index = match direction {
            Direction::Outgoing => &data.outgoing,
            Direction::Incoming => &data.incoming,
        };
        let Some(others) = index.get(&(node.clone(), rel)) else {
            return Ok(Vec::new());
        };
        Ok(others
            .iter()
            .map(|other| {
                let key = match direction {
                    Direction::Outgoing => (node.clone(), rel, other.clone()),
                    Direction::Incoming => (other.clone(), rel, node.clone()),
                };
                Edge {
                    rel,
                    other: other.clone(),
                    props: data.edges.get(&key).cloned().unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn constraints(&self) -> RegenResult<Vec<ConstraintInfo>> {
        Ok(self.data.read().await.constraints.clone())
    }

    async fn indexes(&self) -> RegenResult<Vec<IndexInfo>> {
        Ok(self.data.read().await.indexes.clone())
    }

    async fn install(&self, item: &SchemaItem) -> RegenResult<()> {
        let mut data = self.data.write().await;
        match item {
            SchemaItem::Unique { kind, property } => {
                if !self.supports_constraints {
                    return Err(RegenError::SchemaViolation(format!(
                        "store cannot express a uniqueness constraint on {kind}.{property}"
                    )));
                }
                let exists = data
                    .constraints
                    .iter()
                    .any(|c| c.enforces_unique(kind.label(), property));
                if !exists {
                    data.constraints.push(ConstraintInfo {
                        name: format!("{}_{}_unique", kind.label().to_lowercase(), property),
                        label: kind.label().to_string(),
                        properties: vec![property.clone()],
                        constraint_type: ConstraintType::Uniqueness,
                    });
                }
            }
            SchemaItem::Index { kind, property } => {
                let exists = data
                    .indexes
                    .iter()
                    .any(|i| i.label == kind.label() && i.properties == [property.clone()]);
                if !exists {
                    data.indexes.push(IndexInfo {
                        name: format!("{}_{}", kind.label().to_lowercase(), property),
                        label: kind.label().to_string(),
                        properties: vec![property.clone()],
                    });
                }
            }
        }
        Ok(())
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            unique_constraints: self.supports_constraints,
            indexes: true,
        }
    }

    async fn counts(&self) -> RegenResult<GraphCounts> {
        let data = self.data.read().await;
        let mut counts = GraphCounts {
            nodes: data.nodes.len(),
            relationships: data.edges.len(),
            ..GraphCounts::default()
        };
        for node in data.nodes.keys() {
            *counts.by_kind.entry(node.kind).or_default() += 1;
        }
        Ok(counts)
    }

    async fn commit(&self, unit: UnitOfWork) -> RegenResult<CommitReceipt> {
        // A unit without writes still has its preconditions validated.
        if unit.is_empty() {
            check_preconditions(&*self.data.read().await, &unit)?;
            return Ok(CommitReceipt::default());
        }
        let pending = self.fail_commits.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_commits.store(pending - 1, Ordering::SeqCst);
            return Err(RegenError::StoreUnavailable(
                "injected connectivity failure".to_string(),
            ));
        }

        let mut guard = self.data.write().await;
        check_preconditions(&guard, &unit)?;

        let mut next = (*guard).clone();
        let mut edges_written = 0;
        for op in unit.ops() {
            if next.apply(op, self.policy)? {
                edges_written += 1;
            }
        }

        let nodes_written = unit.written_nodes();
        let versions = nodes_written
            .iter()
            .filter_map(|n| next.version(n).map(|v| (n.clone(), v)))
            .collect();
        *guard = next;
        self.commits.fetch_add(1, Ordering::SeqCst);
        debug!(
            ops = unit.len(),
            nodes = nodes_written.len(),
            edges = edges_written,
            "Committed unit of work"
        );

        Ok(CommitReceipt {
            nodes_written,
            edges_written,
            versions,
        })
    }
}

fn check_preconditions(data: &GraphData, unit: &UnitOfWork) -> RegenResult<()> {
    for Precondition::Version { node, expected } in unit.preconditions() {
        let found = data.version(node);
        if found != *expected {
            return Err(RegenError::ConcurrentModificationConflict {
                node: node.to_string(),
                expected: version_label(*expected),
                found: version_label(found),
            });
        }
    }
    Ok(())
}

fn version_label(version: Option<u64>) -> String {
    version.map_or_else(|| "absent".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(kind: NodeKind, id: &str) -> NodeRef {
        NodeRef::new(kind, id)
    }

    fn props(pairs: &[(&str, &str)]) -> Props {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), (*v).into()))
            .collect()
    }

    fn merge(n: &NodeRef, name: &str) -> WriteOp {
        WriteOp::MergeNode {
            node: n.clone(),
            on_create: Props::new(),
            set: props(&[("name", name)]),
        }
    }

    #[tokio::test]
    async fn test_failed_op_leaves_graph_untouched() {
        let store = MemoryStore::default();
        let agg = node(NodeKind::Aggregate, "AGG_ORDER");
        let mut unit = UnitOfWork::new();
        unit.push(merge(&agg, "Order"));
        unit.push(WriteOp::MergeEdge {
            from: agg.clone(),
            rel: RelType::HandlesCommand,
            to: node(NodeKind::Command, "CMD_MISSING"),
            on_create: Props::new(),
            set: Props::new(),
        });

        let err = store.commit(unit).await.unwrap_err();
        assert!(matches!(err, RegenError::DanglingReference(_)));
        assert!(store.get_node(&agg).await.unwrap().is_none());
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_versions_bump_per_write() {
        let store = MemoryStore::default();
        let agg = node(NodeKind::Aggregate, "AGG_ORDER");
        let mut unit = UnitOfWork::new();
        unit.push(merge(&agg, "Order"));
        let receipt = store.commit(unit).await.unwrap();
        assert_eq!(receipt.versions[&agg], 1);

        let mut unit = UnitOfWork::new();
        unit.push(merge(&agg, "Orders"));
        let receipt = store.commit(unit).await.unwrap();
        assert_eq!(receipt.versions[&agg], 2);
    }

    #[tokio::test]
    async fn test_stale_precondition_is_rejected() {
        let store = MemoryStore::default();
        let agg = node(NodeKind::Aggregate, "AGG_ORDER");
        let mut unit = UnitOfWork::new();
        unit.require(Precondition::Version {
            node: agg.clone(),
            expected: None,
        });
        unit.push(merge(&agg, "Order"));
        store.commit(unit.clone()).await.unwrap();

        let err = store.commit(unit).await.unwrap_err();
        assert!(matches!(err, RegenError::ConcurrentModificationConflict { .. }));
    }

    #[tokio::test]
    async fn test_preconditions_checked_without_writes() {
        let store = MemoryStore::default();
        let agg = node(NodeKind::Aggregate, "AGG_ORDER");
        let mut unit = UnitOfWork::new();
        unit.push(merge(&agg, "Order"));
        store.commit(unit).await.unwrap();

        let mut stale = UnitOfWork::new();
        stale.require(Precondition::Version {
            node: agg.clone(),
            expected: None,
        });
        let err = store.commit(stale).await.unwrap_err();
        assert!(matches!(err, RegenError::ConcurrentModificationConflict { .. }));

        let mut current = UnitOfWork::new();
        current.require(Precondition::Version {
            node: agg,
            expected: Some(1),
        });
        let commits = store.commit_count();
        store.commit(current).await.unwrap();
        assert_eq!(store.commit_count(), commits);
    }

    #[tokio::test]
    async fn test_global_policy_rejects_cross_kind_reuse() {
        let store = MemoryStore::new(IdPolicy::Global);
        let mut unit = UnitOfWork::new();
        unit.push(merge(&node(NodeKind::Aggregate, "X_1"), "x"));
        store.commit(unit).await.unwrap();

        let command = node(NodeKind::Command, "X_1");
        let mut unit = UnitOfWork::new();
        unit.push(merge(&command, "x"));
        assert!(matches!(
            store.commit(unit).await,
            Err(RegenError::DuplicateIdentifierConflict { .. })
        ));
        assert!(matches!(
            store.get_node(&command).await,
            Err(RegenError::DuplicateIdentifierConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_label_scoped_policy_allows_cross_kind_reuse() {
        let store = MemoryStore::new(IdPolicy::LabelScoped);
        let mut unit = UnitOfWork::new();
        unit.push(merge(&node(NodeKind::Aggregate, "X_1"), "x"));
        unit.push(merge(&node(NodeKind::Command, "X_1"), "x"));
        store.commit(unit).await.unwrap();
        assert_eq!(store.find_by_id("X_1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_neighbors_in_both_directions() {
        let store = MemoryStore::default();
        let policy = node(NodeKind::Policy, "POL_RESERVE_STOCK");
        let event = node(NodeKind::Event, "EVT_ORDER_PLACED");
        let mut unit = UnitOfWork::new();
        unit.push(merge(&policy, "Reserve stock"));
        unit.push(merge(&event, "Order placed"));
        unit.push(WriteOp::MergeEdge {
            from: policy.clone(),
            rel: RelType::ListensEvent,
            to: event.clone(),
            on_create: Props::new(),
            set: Props::new(),
        });
        store.commit(unit).await.unwrap();

        let listeners = store
            .neighbors(&event, RelType::ListensEvent, Direction::Incoming)
            .await
            .unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].other, policy);
        assert!(store
            .neighbors(&event, RelType::ListensEvent, Direction::Outgoing)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = MemoryStore::default();
        store.fail_next_commits(1);
        let mut unit = UnitOfWork::new();
        unit.push(merge(&node(NodeKind::Epic, "EP_1"), "e"));
        let err = store.commit(unit.clone()).await.unwrap_err();
        assert!(err.is_transient());
        store.commit(unit).await.unwrap();
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let store = MemoryStore::default();
        let item = SchemaItem::Unique {
            kind: NodeKind::Epic,
            property: "id".to_string(),
        };
        store.install(&item).await.unwrap();
        store.install(&item).await.unwrap();
        assert_eq!(store.constraints().await.unwrap().len(), 1);
    }
}
