//! Neo4j-backed [`GraphStore`].
//!
//! Labels and relationship types are interpolated into Cypher only from the
//! closed `NodeKind`/`RelType` sets; attribute names are checked against
//! [`is_identifier`] before interpolation. Everything else is a parameter.
//! Node versions live in the `rev` property. Timestamps are written as
//! RFC 3339 strings.
//!
//! Version preconditions take the node's write lock before reading `rev`,
//! so a competing transaction blocks until this one ends and then sees the
//! bumped version. Nodes expected to be absent are written with `CREATE`;
//! the uniqueness constraints from schema init turn a racing create into a
//! conflict.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use neo4rs::{BoltMap, BoltString, BoltType, Neo4jErrorKind, Query, Row, Txn};
use tracing::{debug, warn};

use regen_core::config::IdPolicy;
use regen_core::model::{KindCategory, NodeKind, NodeRef, PropValue, Props, RelType};
use regen_core::{Direction, RegenError, RegenResult};

use super::{
    CommitReceipt, ConstraintInfo, ConstraintType, Edge, GraphCounts, GraphStore, IndexInfo,
    NodeQuery, Precondition, SchemaItem, StoreCapabilities, StoredNode, UnitOfWork, WriteOp,
};
use crate::client::GraphClient;

const REV: &str = "rev";

pub struct Neo4jStore {
    client: GraphClient,
    policy: IdPolicy,
}

impl Neo4jStore {
    pub fn new(client: GraphClient, policy: IdPolicy) -> Self {
        Self { client, policy }
    }

    async fn rows(&self, query: Query) -> RegenResult<Vec<Row>> {
        let mut stream = self.client.inner().execute(query).await.map_err(store_err)?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await.map_err(store_err)? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn run(&self, query: Query) -> RegenResult<()> {
        self.client.inner().run(query).await.map_err(store_err)
    }
}

/// Map driver errors; connectivity problems are transient.
const CONSTRAINT_VIOLATION: &str = "Neo.ClientError.Schema.ConstraintValidationFailed";

fn store_err(err: neo4rs::Error) -> RegenError {
    match err {
        neo4rs::Error::ConnectionError | neo4rs::Error::IOError { .. } => {
            RegenError::StoreUnavailable(err.to_string())
        }
        // Deadlocks and lock timeouts between competing writers.
        neo4rs::Error::Neo4j(ref e) if e.kind() == Neo4jErrorKind::Transient => {
            RegenError::StoreUnavailable(err.to_string())
        }
        other => RegenError::Store(other.to_string()),
    }
}

/// A `CREATE` that lost a race against another transaction creating `node`.
fn create_err(err: neo4rs::Error, node: &NodeRef) -> RegenError {
    let lost_race = matches!(&err, neo4rs::Error::Neo4j(e) if e.code() == CONSTRAINT_VIOLATION);
    if lost_race {
        return RegenError::ConcurrentModificationConflict {
            node: node.to_string(),
            expected: "absent".to_string(),
            found: "created concurrently".to_string(),
        };
    }
    store_err(err)
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn checked_key(key: &str) -> RegenResult<&str> {
    if is_identifier(key) {
        Ok(key)
    } else {
        Err(RegenError::invalid(format!("'{key}' is not a valid attribute name")))
    }
}

fn bolt_value(value: &PropValue) -> BoltType {
    match value {
        PropValue::Bool(b) => BoltType::from(*b),
        PropValue::Int(i) => BoltType::from(*i),
        PropValue::Float(f) => BoltType::from(*f),
        PropValue::Time(t) => BoltType::from(t.to_rfc3339()),
        PropValue::Str(s) => BoltType::from(s.clone()),
        PropValue::List(items) => BoltType::from(items.clone()),
    }
}

fn bolt_map(props: &Props) -> RegenResult<BoltType> {
    let mut map = BoltMap::new();
    for (key, value) in props {
        map.put(BoltString::from(checked_key(key)?), bolt_value(value));
    }
    Ok(BoltType::Map(map))
}

fn prop_value(value: serde_json::Value) -> Option<PropValue> {
    use serde_json::Value;
    match value {
        Value::Bool(b) => Some(PropValue::Bool(b)),
        Value::Number(n) => n
            .as_i64()
            .map(PropValue::Int)
            .or_else(|| n.as_f64().map(PropValue::Float)),
        Value::String(s) => Some(PropValue::Str(s)),
        Value::Array(items) => Some(PropValue::List(
            items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )),
        _ => None,
    }
}

/// Decode a `labels(n)[0] AS label, properties(n) AS props` row.
fn stored_node(row: &Row) -> Option<StoredNode> {
    let label: String = row.get("label").ok()?;
    let kind: NodeKind = label.parse().ok()?;
    let raw: BTreeMap<String, serde_json::Value> = row.get("props").ok()?;
    let mut props: Props = raw
        .into_iter()
        .filter_map(|(k, v)| prop_value(v).map(|v| (k, v)))
        .collect();
    let version = props
        .remove(REV)
        .and_then(|v| v.as_int())
        .unwrap_or(0)
        .max(0) as u64;
    let id = props.get("id").and_then(PropValue::as_str)?.to_string();
    props.remove("id");
    Some(StoredNode {
        kind,
        id,
        props,
        version,
    })
}

fn domain_labels() -> Vec<String> {
    NodeKind::ALL
        .iter()
        .filter(|k| k.category() != KindCategory::System)
        .map(|k| k.label().to_string())
        .collect()
}

/// Rows produced by a query inside the transaction.
async fn txn_rows(txn: &mut Txn, query: Query) -> RegenResult<Vec<Row>> {
    let mut stream = txn.execute(query).await.map_err(store_err)?;
    let mut rows = Vec::new();
    while let Some(row) = stream.next(txn.handle()).await.map_err(store_err)? {
        rows.push(row);
    }
    Ok(rows)
}

async fn txn_version(txn: &mut Txn, node: &NodeRef) -> RegenResult<Option<u64>> {
    let query = Query::new(format!(
        "MATCH (n:{} {{id: $id}}) RETURN n.rev AS rev",
        node.kind.label()
    ))
    .param("id", node.id.as_str());
    let rows = txn_rows(txn, query).await?;
    Ok(rows
        .first()
        .map(|row| row.get::<i64>("rev").unwrap_or(0).max(0) as u64))
}

/// Current version of `node`, holding its write lock until the transaction ends.
async fn txn_lock_version(txn: &mut Txn, node: &NodeRef) -> RegenResult<Option<u64>> {
    let query = Query::new(format!(
        "MATCH (n:{} {{id: $id}})
         SET n._lock = true
         REMOVE n._lock
         RETURN n.rev AS rev",
        node.kind.label()
    ))
    .param("id", node.id.as_str());
    let rows = txn_rows(txn, query).await?;
    Ok(rows
        .first()
        .map(|row| row.get::<i64>("rev").unwrap_or(0).max(0) as u64))
}

fn conflict(node: &NodeRef, expected: Option<u64>, found: Option<u64>) -> RegenError {
    let label = |v: Option<u64>| v.map_or_else(|| "absent".to_string(), |v| v.to_string());
    RegenError::ConcurrentModificationConflict {
        node: node.to_string(),
        expected: label(expected),
        found: label(found),
    }
}

async fn txn_check_free_id(txn: &mut Txn, node: &NodeRef, policy: IdPolicy) -> RegenResult<()> {
    if policy == IdPolicy::LabelScoped {
        return Ok(());
    }
    let query = Query::new(
        "MATCH (n {id: $id})
         WHERE NOT $label IN labels(n)
         RETURN labels(n)[0] AS label LIMIT 1"
            .to_string(),
    )
    .param("id", node.id.as_str())
    .param("label", node.kind.label());
    let rows = txn_rows(txn, query).await?;
    if let Some(row) = rows.first() {
        return Err(RegenError::DuplicateIdentifierConflict {
            id: node.id.clone(),
            existing: row.get::<String>("label").unwrap_or_default(),
            requested: node.kind.to_string(),
        });
    }
    Ok(())
}

async fn apply_op(
    txn: &mut Txn,
    op: &WriteOp,
    policy: IdPolicy,
    must_create: &mut HashSet<NodeRef>,
) -> RegenResult<bool> {
    match op {
        WriteOp::MergeNode {
            node,
            on_create,
            set,
        } if must_create.remove(node) => {
            txn_check_free_id(txn, node, policy).await?;
            let query = Query::new(format!(
                "CREATE (n:{} {{id: $id}})
                 SET n += $on_create, n += $set, n.rev = 1",
                node.kind.label()
            ))
            .param("id", node.id.as_str())
            .param("on_create", bolt_map(on_create)?)
            .param("set", bolt_map(set)?);
            txn.run(query).await.map_err(|err| create_err(err, node))?;
            Ok(false)
        }
        WriteOp::MergeNode {
            node,
            on_create,
            set,
        } => {
            if txn_version(txn, node).await?.is_none() {
                txn_check_free_id(txn, node, policy).await?;
            }
            let query = Query::new(format!(
                "MERGE (n:{} {{id: $id}})
                 ON CREATE SET n += $on_create, n.rev = 0
                 SET n += $set, n.rev = n.rev + 1",
                node.kind.label()
            ))
            .param("id", node.id.as_str())
            .param("on_create", bolt_map(on_create)?)
            .param("set", bolt_map(set)?);
            txn.run(query).await.map_err(store_err)?;
            Ok(false)
        }
        WriteOp::CreateNode { node, props } => {
            if txn_version(txn, node).await?.is_some() {
                return Err(RegenError::DuplicateIdentifierConflict {
                    id: node.id.clone(),
                    existing: node.kind.to_string(),
                    requested: node.kind.to_string(),
                });
            }
            txn_check_free_id(txn, node, policy).await?;
            must_create.remove(node);
            let query = Query::new(format!(
                "CREATE (n:{} {{id: $id}}) SET n += $props, n.rev = 1",
                node.kind.label()
            ))
            .param("id", node.id.as_str())
            .param("props", bolt_map(props)?);
            txn.run(query).await.map_err(|err| create_err(err, node))?;
            Ok(false)
        }
        WriteOp::SetProps { node, props } => {
            let query = Query::new(format!(
                "MATCH (n:{} {{id: $id}})
                 SET n += $props, n.rev = coalesce(n.rev, 0) + 1
                 RETURN n.id AS id",
                node.kind.label()
            ))
            .param("id", node.id.as_str())
            .param("props", bolt_map(props)?);
            if txn_rows(txn, query).await?.is_empty() {
                return Err(RegenError::dangling(format!("{node} does not exist")));
            }
            Ok(false)
        }
        WriteOp::RemoveProps { node, keys } => {
            let mut clauses = Vec::with_capacity(keys.len());
            for key in keys {
                clauses.push(format!("n.{}", checked_key(key)?));
            }
            let remove = if clauses.is_empty() {
                String::new()
            } else {
                format!("REMOVE {}", clauses.join(", "))
            };
            let query = Query::new(format!(
                "MATCH (n:{} {{id: $id}})
                 {remove}
                 SET n.rev = coalesce(n.rev, 0) + 1
                 RETURN n.id AS id",
                node.kind.label()
            ))
            .param("id", node.id.as_str());
            if txn_rows(txn, query).await?.is_empty() {
                return Err(RegenError::dangling(format!("{node} does not exist")));
            }
            Ok(false)
        }
        WriteOp::MergeEdge {
            from,
            rel,
            to,
            on_create,
            set,
        } => {
            if !rel.allows(from.kind, to.kind) {
                return Err(RegenError::invalid(format!(
                    "{rel} cannot connect {from} to {to}"
                )));
            }
            let query = Query::new(format!(
                "MATCH (a:{} {{id: $from}}), (b:{} {{id: $to}})
                 MERGE (a)-[r:{}]->(b)
                 ON CREATE SET r += $on_create
                 SET r += $set
                 RETURN type(r) AS rel",
                from.kind.label(),
                to.kind.label(),
                rel.as_str()
            ))
            .param("from", from.id.as_str())
            .param("to", to.id.as_str())
            .param("on_create", bolt_map(on_create)?)
            .param("set", bolt_map(set)?);
            if txn_rows(txn, query).await?.is_empty() {
                return Err(RegenError::dangling(format!(
                    "{rel} endpoint {from} or {to} does not exist"
                )));
            }
            Ok(true)
        }
        WriteOp::DeleteEdge { from, rel, to } => {
            let query = Query::new(format!(
                "MATCH (a:{} {{id: $from}})-[r:{}]->(b:{} {{id: $to}})
                 DELETE r
                 RETURN count(*) AS deleted",
                from.kind.label(),
                rel.as_str(),
                to.kind.label()
            ))
            .param("from", from.id.as_str())
            .param("to", to.id.as_str());
            let rows = txn_rows(txn, query).await?;
            Ok(rows
                .first()
                .and_then(|row| row.get::<i64>("deleted").ok())
                .unwrap_or(0)
                > 0)
        }
    }
}

/// Check every precondition, locking the nodes expected to exist.
///
/// Returns the nodes expected to be absent.
async fn check_preconditions(
    txn: &mut Txn,
    unit: &UnitOfWork,
    lock: bool,
) -> RegenResult<HashSet<NodeRef>> {
    let mut absent = HashSet::new();
    for Precondition::Version { node, expected } in unit.preconditions() {
        let found = match expected {
            Some(_) if lock => txn_lock_version(txn, node).await?,
            _ => txn_version(txn, node).await?,
        };
        if found != *expected {
            return Err(conflict(node, *expected, found));
        }
        if expected.is_none() {
            absent.insert(node.clone());
        }
    }
    Ok(absent)
}

async fn apply_unit(txn: &mut Txn, unit: &UnitOfWork, policy: IdPolicy) -> RegenResult<CommitReceipt> {
    let mut must_create = check_preconditions(txn, unit, true).await?;

    let mut receipt = CommitReceipt::default();
    for op in unit.ops() {
        if apply_op(txn, op, policy, &mut must_create).await? {
            receipt.edges_written += 1;
        }
    }
    receipt.nodes_written = unit.written_nodes();
    for node in &receipt.nodes_written {
        if let Some(version) = txn_version(txn, node).await? {
            receipt.versions.insert(node.clone(), version);
        }
    }
    Ok(receipt)
}

#[async_trait]
impl GraphStore for Neo4jStore {
    fn id_policy(&self) -> IdPolicy {
        self.policy
    }

    async fn get_node(&self, node: &NodeRef) -> RegenResult<Option<StoredNode>> {
        let query = match self.policy {
            IdPolicy::LabelScoped => Query::new(format!(
                "MATCH (n:{} {{id: $id}})
                 RETURN labels(n)[0] AS label, properties(n) AS props",
                node.kind.label()
            )),
            IdPolicy::Global => Query::new(
                "MATCH (n {id: $id})
                 RETURN labels(n)[0] AS label, properties(n) AS props"
                    .to_string(),
            ),
        }
        .param("id", node.id.as_str());

        let mut found = None;
        for row in self.rows(query).await? {
            let Some(stored) = stored_node(&row) else {
                continue;
            };
            if stored.kind == node.kind {
                found = Some(stored);
            } else if stored.kind.category() != KindCategory::System {
                return Err(RegenError::DuplicateIdentifierConflict {
                    id: node.id.clone(),
                    existing: stored.kind.to_string(),
                    requested: node.kind.to_string(),
                });
            }
        }
        Ok(found)
    }

    async fn find_by_id(&self, id: &str) -> RegenResult<Vec<StoredNode>> {
        let query = Query::new(
            "MATCH (n {id: $id})
             WHERE labels(n)[0] IN $labels
             RETURN labels(n)[0] AS label, properties(n) AS props"
                .to_string(),
        )
        .param("id", id)
        .param("labels", domain_labels());
        Ok(self.rows(query).await?.iter().filter_map(stored_node).collect())
    }

    async fn find_nodes(&self, query: &NodeQuery) -> RegenResult<Vec<StoredNode>> {
        let pattern = match query.kind {
            Some(kind) => format!("(n:{})", kind.label()),
            None => "(n)".to_string(),
        };
        let mut filters = vec!["n.id IS NOT NULL".to_string()];
        for (i, (key, _)) in query.equals.iter().enumerate() {
            filters.push(format!("n.{} = $p{i}", checked_key(key)?));
        }
        if !query.any_present.is_empty() {
            let mut present = Vec::new();
            for key in &query.any_present {
                present.push(format!("n.{} IS NOT NULL", checked_key(key)?));
            }
            filters.push(format!("({})", present.join(" OR ")));
        }
        let limit = query
            .limit
            .map(|l| format!("LIMIT {l}"))
            .unwrap_or_default();

        let mut cypher = Query::new(format!(
            "MATCH {pattern}
             WHERE {}
             RETURN labels(n)[0] AS label, properties(n) AS props
             ORDER BY label, n.id
             {limit}",
            filters.join(" AND ")
        ));
        for (i, (_, value)) in query.equals.iter().enumerate() {
            cypher = cypher.param(&format!("p{i}"), bolt_value(value));
        }
        Ok(self.rows(cypher).await?.iter().filter_map(stored_node).collect())
    }

    async fn neighbors(
        &self,
        node: &NodeRef,
        rel: RelType,
        direction: Direction,
    ) -> RegenResult<Vec<Edge>> {
        let arrow = match direction {
            Direction::Outgoing => format!("-[r:{}]->", rel.as_str()),
            Direction::Incoming => format!("<-[r:{}]-", rel.as_str()),
        };
        let query = Query::new(format!(
            "MATCH (n:{} {{id: $id}}){arrow}(m)
             RETURN labels(m)[0] AS label, m.id AS id, properties(r) AS props",
            node.kind.label()
        ))
        .param("id", node.id.as_str());

        let mut edges = Vec::new();
        for row in self.rows(query).await? {
            let label: String = row.get("label").unwrap_or_default();
            let id: String = row.get("id").unwrap_or_default();
            let Ok(kind) = label.parse::<NodeKind>() else {
                debug!(label = %label, "Skipping neighbor with unknown label");
                continue;
            };
            let raw: BTreeMap<String, serde_json::Value> = row.get("props").unwrap_or_default();
            edges.push(Edge {
                rel,
                other: NodeRef::new(kind, id),
                props: raw
                    .into_iter()
                    .filter_map(|(k, v)| prop_value(v).map(|v| (k, v)))
                    .collect(),
            });
        }
        Ok(edges)
    }

    async fn constraints(&self) -> RegenResult<Vec<ConstraintInfo>> {
        let query = Query::new(
            "SHOW CONSTRAINTS YIELD name, type, labelsOrTypes, properties
             RETURN name, type, labelsOrTypes, properties"
                .to_string(),
        );
        let mut constraints = Vec::new();
        for row in self.rows(query).await? {
            let labels: Vec<String> = row.get("labelsOrTypes").unwrap_or_default();
            let raw_type: String = row.get("type").unwrap_or_default();
            let constraint_type = match raw_type.as_str() {
                "UNIQUENESS" | "NODE_PROPERTY_UNIQUENESS" => ConstraintType::Uniqueness,
                "NODE_KEY" => ConstraintType::NodeKey,
                "NODE_PROPERTY_EXISTENCE" => ConstraintType::Existence,
                other => ConstraintType::Other(other.to_string()),
            };
            constraints.push(ConstraintInfo {
                name: row.get("name").unwrap_or_default(),
                label: labels.into_iter().next().unwrap_or_default(),
                properties: row.get("properties").unwrap_or_default(),
                constraint_type,
            });
        }
        Ok(constraints)
    }

    async fn indexes(&self) -> RegenResult<Vec<IndexInfo>> {
        let query = Query::new(
            "SHOW INDEXES YIELD name, type, labelsOrTypes, properties
             WHERE type <> 'LOOKUP'
             RETURN name, labelsOrTypes, properties"
                .to_string(),
        );
        Ok(self
            .rows(query)
            .await?
            .into_iter()
            .map(|row| {
                let labels: Vec<String> = row.get("labelsOrTypes").unwrap_or_default();
                IndexInfo {
                    name: row.get("name").unwrap_or_default(),
                    label: labels.into_iter().next().unwrap_or_default(),
                    properties: row.get("properties").unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn install(&self, item: &SchemaItem) -> RegenResult<()> {
        let statement = match item {
            SchemaItem::Unique { kind, property } => format!(
                "CREATE CONSTRAINT {}_{}_unique IF NOT EXISTS FOR (n:{}) REQUIRE n.{} IS UNIQUE",
                kind.label().to_lowercase(),
                checked_key(property)?,
                kind.label(),
                property
            ),
            SchemaItem::Index { kind, property } => format!(
                "CREATE INDEX {}_{} IF NOT EXISTS FOR (n:{}) ON (n.{})",
                kind.label().to_lowercase(),
                checked_key(property)?,
                kind.label(),
                property
            ),
        };
        self.run(Query::new(statement)).await
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            unique_constraints: true,
            indexes: true,
        }
    }

    async fn counts(&self) -> RegenResult<GraphCounts> {
        let mut counts = GraphCounts::default();
        let by_label = Query::new(
            "MATCH (n) RETURN labels(n)[0] AS label, count(n) AS count".to_string(),
        );
        for row in self.rows(by_label).await? {
            let label: String = row.get("label").unwrap_or_default();
            let count = row.get::<i64>("count").unwrap_or(0).max(0) as usize;
            counts.nodes += count;
            if let Ok(kind) = label.parse::<NodeKind>() {
                counts.by_kind.insert(kind, count);
            }
        }
        let rels = Query::new("MATCH ()-[r]->() RETURN count(r) AS count".to_string());
        counts.relationships = self
            .rows(rels)
            .await?
            .first()
            .and_then(|row| row.get::<i64>("count").ok())
            .unwrap_or(0)
            .max(0) as usize;
        Ok(counts)
    }

    async fn commit(&self, unit: UnitOfWork) -> RegenResult<CommitReceipt> {
        if unit.is_empty() {
            if !unit.preconditions().is_empty() {
                let mut txn = self.client.inner().start_txn().await.map_err(store_err)?;
                let checked = check_preconditions(&mut txn, &unit, false).await;
                if let Err(rollback) = txn.rollback().await {
                    warn!(error = %rollback, "Neo4j rollback failed");
                }
                checked?;
            }
            return Ok(CommitReceipt::default());
        }
        let mut txn = self.client.inner().start_txn().await.map_err(store_err)?;
        match apply_unit(&mut txn, &unit, self.policy).await {
            Ok(receipt) => {
                txn.commit().await.map_err(store_err)?;
                debug!(
                    ops = unit.len(),
                    nodes = receipt.nodes_written.len(),
                    edges = receipt.edges_written,
                    "Committed Neo4j transaction"
                );
                Ok(receipt)
            }
            Err(err) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!(error = %rollback, "Neo4j rollback failed");
                }
                Err(err)
            }
        }
    }
}
