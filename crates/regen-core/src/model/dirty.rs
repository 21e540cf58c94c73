//! Dirty state and regeneration phases.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{KindCategory, NodeKind, NodeRef};
use crate::error::RegenError;

pub const DIRTY: &str = "dirty";
pub const DIRTY_REASON: &str = "dirty_reason";
pub const DIRTY_AT: &str = "dirty_at";
/// Set when generation output for the node was upserted.
pub const REGENERATED_AT: &str = "regenerated_at";
/// Run that produced the latest generation output.
pub const REGENERATED_BY: &str = "regenerated_by";

/// The three co-mutated dirty attributes.
pub const DIRTY_FIELDS: [&str; 3] = [DIRTY, DIRTY_REASON, DIRTY_AT];

/// Ordered stage of regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Structural,
    Behavioral,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Structural => "Structural",
            Phase::Behavioral => "Behavioral",
        }
    }

    /// The phase that regenerates nodes of `kind`, if any.
    pub fn for_kind(kind: NodeKind) -> Option<Phase> {
        match kind.category() {
            KindCategory::Structural => Some(Phase::Structural),
            KindCategory::Behavioral => Some(Phase::Behavioral),
            _ => None,
        }
    }

    pub fn kinds(&self) -> &'static [NodeKind] {
        match self {
            Phase::Structural => &[
                NodeKind::BoundedContext,
                NodeKind::Aggregate,
                NodeKind::Entity,
                NodeKind::ValueObject,
                NodeKind::Field,
            ],
            Phase::Behavioral => &[NodeKind::Command, NodeKind::Event, NodeKind::Policy],
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = RegenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "structural" => Ok(Phase::Structural),
            "behavioral" | "behavioural" => Ok(Phase::Behavioral),
            _ => Err(RegenError::invalid(format!("unknown phase '{s}'"))),
        }
    }
}

/// One node currently flagged for regeneration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirtyEntry {
    pub node: NodeRef,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of the dirty registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirtySet {
    pub entries: Vec<DirtyEntry>,
}

impl DirtySet {
    pub fn new(entries: Vec<DirtyEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Distinct kinds present in the set.
    pub fn kinds(&self) -> BTreeSet<NodeKind> {
        self.entries.iter().map(|e| e.node.kind).collect()
    }

    /// Sorted identifiers grouped by kind.
    pub fn by_kind(&self) -> BTreeMap<NodeKind, Vec<String>> {
        let mut grouped: BTreeMap<NodeKind, Vec<String>> = BTreeMap::new();
        for entry in &self.entries {
            grouped
                .entry(entry.node.kind)
                .or_default()
                .push(entry.node.id.clone());
        }
        for ids in grouped.values_mut() {
            ids.sort();
            ids.dedup();
        }
        grouped
    }

    /// The subset regenerated by `phase`.
    pub fn for_phase(&self, phase: Phase) -> DirtySet {
        DirtySet::new(
            self.entries
                .iter()
                .filter(|e| Phase::for_kind(e.node.kind) == Some(phase))
                .cloned()
                .collect(),
        )
    }

    pub fn refs(&self) -> Vec<NodeRef> {
        self.entries.iter().map(|e| e.node.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: NodeKind, id: &str) -> DirtyEntry {
        DirtyEntry {
            node: NodeRef::new(kind, id),
            reason: "upstream change".to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_phase_for_kind() {
        assert_eq!(Phase::for_kind(NodeKind::Field), Some(Phase::Structural));
        assert_eq!(Phase::for_kind(NodeKind::Policy), Some(Phase::Behavioral));
        assert_eq!(Phase::for_kind(NodeKind::UserStory), None);
        assert_eq!(Phase::for_kind(NodeKind::Run), None);
    }

    #[test]
    fn test_by_kind_sorts_and_dedups() {
        let set = DirtySet::new(vec![
            entry(NodeKind::Command, "CMD_B"),
            entry(NodeKind::Command, "CMD_A"),
            entry(NodeKind::Command, "CMD_B"),
            entry(NodeKind::Aggregate, "AGG_ORDER"),
        ]);
        let grouped = set.by_kind();
        assert_eq!(grouped[&NodeKind::Command], vec!["CMD_A", "CMD_B"]);
        assert_eq!(grouped[&NodeKind::Aggregate], vec!["AGG_ORDER"]);
    }

    #[test]
    fn test_for_phase_filters() {
        let set = DirtySet::new(vec![
            entry(NodeKind::Aggregate, "AGG_ORDER"),
            entry(NodeKind::Event, "EVT_ORDER_PLACED"),
        ]);
        let behavioral = set.for_phase(Phase::Behavioral);
        assert_eq!(behavioral.len(), 1);
        assert_eq!(behavioral.entries[0].node.id, "EVT_ORDER_PLACED");
    }
}
