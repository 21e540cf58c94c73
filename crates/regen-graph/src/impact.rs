//! Impact analysis.
//!
//! Bounded traversal from changed roots across containment, trace and
//! event-chain relationships. Only downstream edges are followed, plus the
//! `LISTENS_EVENT` edge walked backwards from an Event to its listening
//! Policy.
//!
//! Hops are weighted. Moving within the requirement tree is free, as are
//! `EMITS_EVENT` and Event-to-Policy, so one hop of the event chain is one
//! command round (`HANDLES_COMMAND` or `TRIGGERS_COMMAND`). Containment and
//! trace edges cost one hop each. `AFFECTS_AGGREGATE` is never traversed:
//! its targets are collected into `affected_aggregates` whatever the budget.
//!
//! The traversal is a 0-1 BFS with a visited set, so every node is expanded
//! once and cycles terminate.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use regen_core::config::ImpactConfig;
use regen_core::model::{Direction, NodeKind, NodeRef, RelClass, RelType};
use regen_core::{RegenError, RegenResult};

use crate::store::GraphStore;

/// Traversal budget.
#[derive(Debug, Clone, Copy)]
pub struct ImpactOptions {
    pub max_hops: u32,
    pub timeout: Duration,
}

impl Default for ImpactOptions {
    fn default() -> Self {
        Self::from(&ImpactConfig::default())
    }
}

impl From<&ImpactConfig> for ImpactOptions {
    fn from(config: &ImpactConfig) -> Self {
        Self {
            max_hops: config.max_hops,
            timeout: config.traversal_timeout(),
        }
    }
}

impl ImpactOptions {
    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }
}

/// Impacted nodes grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImpactReport {
    pub roots: Vec<NodeRef>,
    /// Sorted, de-duplicated identifiers per kind. Roots and requirement nodes are excluded.
    pub impacted: BTreeMap<NodeKind, Vec<String>>,
    /// Aggregates reached through `AFFECTS_AGGREGATE` and not already impacted.
    pub affected_aggregates: Vec<String>,
    /// Root identifiers that reach each impacted node, keyed by `Kind:id`.
    pub contributors: BTreeMap<String, Vec<String>>,
    pub max_hops: u32,
}

impl ImpactReport {
    pub fn ids(&self, kind: NodeKind) -> &[String] {
        self.impacted.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total(&self) -> usize {
        self.impacted.values().map(Vec::len).sum::<usize>() + self.affected_aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Every node that should be flagged for regeneration.
    pub fn dirty_targets(&self) -> Vec<NodeRef> {
        let mut targets: Vec<NodeRef> = self
            .impacted
            .iter()
            .flat_map(|(kind, ids)| ids.iter().map(|id| NodeRef::new(*kind, id.clone())))
            .collect();
        targets.extend(
            self.affected_aggregates
                .iter()
                .map(|id| NodeRef::new(NodeKind::Aggregate, id.clone())),
        );
        targets
    }
}

/// One kind of edge the traversal may follow out of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Step {
    rel: RelType,
    direction: Direction,
    cost: u32,
}

fn step_cost(rel: RelType) -> u32 {
    match rel {
        RelType::HasStory | RelType::HasCriterion => 0,
        RelType::EmitsEvent | RelType::ListensEvent => 0,
        _ => 1,
    }
}

/// Edges followed out of a node of `kind`.
fn steps(kind: NodeKind) -> Vec<Step> {
    let mut steps = Vec::new();
    for rel in RelType::ALL {
        match (rel, rel.class()) {
            (_, RelClass::Audit) | (RelType::AffectsAggregate, _) => {}
            (RelType::ListensEvent, _) => {
                if kind == NodeKind::Event {
                    steps.push(Step {
                        rel,
                        direction: Direction::Incoming,
                        cost: step_cost(rel),
                    });
                }
            }
            _ => {
                if NodeKind::ALL.iter().any(|to| rel.allows(kind, *to)) {
                    steps.push(Step {
                        rel,
                        direction: Direction::Outgoing,
                        cost: step_cost(rel),
                    });
                }
            }
        }
    }
    steps
}

/// Nodes reached from one root with their hop distance.
#[derive(Debug, Default)]
struct Reach {
    reached: HashMap<NodeRef, u32>,
    affected: BTreeSet<String>,
}

async fn traverse(store: &dyn GraphStore, root: &NodeRef, max_hops: u32) -> RegenResult<Reach> {
    let mut reach = Reach::default();
    let mut best: HashMap<NodeRef, u32> = HashMap::new();
    let mut visited: HashSet<NodeRef> = HashSet::new();
    let mut queue: VecDeque<(NodeRef, u32)> = VecDeque::new();
    let mut plans: HashMap<NodeKind, Vec<Step>> = HashMap::new();

    best.insert(root.clone(), 0);
    queue.push_back((root.clone(), 0));

    while let Some((node, hops)) = queue.pop_front() {
        if !visited.insert(node.clone()) {
            continue;
        }
        reach.reached.insert(node.clone(), hops);

        if node.kind == NodeKind::Event {
            for edge in store
                .neighbors(&node, RelType::AffectsAggregate, Direction::Outgoing)
                .await?
            {
                reach.affected.insert(edge.other.id);
            }
        }

        let node_steps = plans.entry(node.kind).or_insert_with(|| steps(node.kind)).clone();
        for step in node_steps {
            let next_hops = hops + step.cost;
            if next_hops > max_hops {
                continue;
            }
            for edge in store.neighbors(&node, step.rel, step.direction).await? {
                if visited.contains(&edge.other) {
                    continue;
                }
                let improves = best.get(&edge.other).map_or(true, |known| next_hops < *known);
                if !improves {
                    continue;
                }
                best.insert(edge.other.clone(), next_hops);
                if step.cost == 0 {
                    queue.push_front((edge.other, next_hops));
                } else {
                    queue.push_back((edge.other, next_hops));
                }
            }
        }
    }

    debug!(root = %root, reached = reach.reached.len(), "Traversal finished");
    Ok(reach)
}

/// Current fingerprints of the roots; a missing root is a dangling reference.
async fn root_fingerprints(
    store: &dyn GraphStore,
    roots: &[NodeRef],
) -> RegenResult<Vec<Option<String>>> {
    let mut fingerprints = Vec::with_capacity(roots.len());
    for root in roots {
        let node = store
            .get_node(root)
            .await?
            .ok_or_else(|| RegenError::dangling(format!("impact root {root} does not exist")))?;
        fingerprints.push(node.fingerprint().map(str::to_string));
    }
    Ok(fingerprints)
}

async fn build_report(
    store: &dyn GraphStore,
    roots: &[NodeRef],
    max_hops: u32,
) -> RegenResult<ImpactReport> {
    let root_set: HashSet<&NodeRef> = roots.iter().collect();
    let mut impacted: BTreeMap<NodeKind, BTreeSet<String>> = BTreeMap::new();
    let mut contributors: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut affected: BTreeSet<String> = BTreeSet::new();

    for root in roots {
        let reach = traverse(store, root, max_hops).await?;
        for node in reach.reached.into_keys() {
            if root_set.contains(&node) || !node.kind.is_design() {
                continue;
            }
            contributors
                .entry(node.to_string())
                .or_default()
                .insert(root.id.clone());
            impacted.entry(node.kind).or_default().insert(node.id);
        }
        affected.extend(reach.affected);
    }

    let impacted_aggregates = impacted.get(&NodeKind::Aggregate).cloned().unwrap_or_default();
    affected.retain(|id| {
        !impacted_aggregates.contains(id)
            && !root_set.contains(&NodeRef::new(NodeKind::Aggregate, id.clone()))
    });

    Ok(ImpactReport {
        roots: roots.to_vec(),
        impacted: impacted
            .into_iter()
            .map(|(kind, ids)| (kind, ids.into_iter().collect()))
            .collect(),
        affected_aggregates: affected.into_iter().collect(),
        contributors: contributors
            .into_iter()
            .map(|(node, roots)| (node, roots.into_iter().collect()))
            .collect(),
        max_hops,
    })
}

/// Analyze roots, re-validating their fingerprints afterwards.
///
/// A root rewritten mid-traversal triggers one retry; a second rewrite is
/// a `ConcurrentModificationConflict`.
async fn analyze(
    store: &dyn GraphStore,
    roots: &[NodeRef],
    max_hops: u32,
) -> RegenResult<ImpactReport> {
    let mut last_conflict = None;
    for attempt in 1..=2 {
        let before = root_fingerprints(store, roots).await?;
        let report = build_report(store, roots, max_hops).await?;
        let after = root_fingerprints(store, roots).await?;

        let moved = roots
            .iter()
            .zip(before.iter().zip(after.iter()))
            .find(|(_, (b, a))| b != a);
        match moved {
            None => return Ok(report),
            Some((root, (b, a))) => {
                warn!(root = %root, attempt, "Impact root changed during traversal");
                last_conflict = Some(RegenError::ConcurrentModificationConflict {
                    node: root.to_string(),
                    expected: b.clone().unwrap_or_else(|| "none".to_string()),
                    found: a.clone().unwrap_or_else(|| "none".to_string()),
                });
            }
        }
    }
    Err(last_conflict.unwrap_or_else(|| RegenError::Store("impact analysis did not run".into())))
}

/// Find everything downstream of `roots` within the hop and time budget.
pub async fn find_impact(
    store: &dyn GraphStore,
    roots: &[NodeRef],
    options: ImpactOptions,
) -> RegenResult<ImpactReport> {
    let budget_ms = options.timeout.as_millis() as u64;
    let report = tokio::time::timeout(options.timeout, analyze(store, roots, options.max_hops))
        .await
        .map_err(|_| RegenError::ImpactTraversalTimeout { budget_ms })??;

    info!(
        roots = roots.len(),
        impacted = report.total(),
        affected_aggregates = report.affected_aggregates.len(),
        max_hops = options.max_hops,
        "Impact analysis complete"
    );
    Ok(report)
}

/// Resolve root arguments of the form `Kind:id` or a bare `id`.
///
/// A bare identifier must name exactly one node.
pub async fn resolve_roots(store: &dyn GraphStore, raw: &[String]) -> RegenResult<Vec<NodeRef>> {
    let mut roots = Vec::with_capacity(raw.len());
    for arg in raw {
        if let Some((kind, id)) = arg.split_once(':') {
            if let Ok(kind) = kind.parse::<NodeKind>() {
                roots.push(NodeRef::new(kind, id));
                continue;
            }
        }
        let mut found = store.find_by_id(arg).await?;
        match found.len() {
            0 => return Err(RegenError::dangling(format!("no node with id '{arg}'"))),
            1 => roots.push(found.remove(0).node_ref()),
            _ => {
                let kinds: Vec<String> = found.iter().map(|n| n.kind.to_string()).collect();
                return Err(RegenError::invalid(format!(
                    "id '{arg}' is ambiguous ({}); use Kind:id",
                    kinds.join(", ")
                )));
            }
        }
    }
    Ok(roots)
}
