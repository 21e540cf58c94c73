//! Knowledge graph model: node kinds, relationship catalog and attribute values.

pub mod change;
pub mod dirty;
pub mod payload;
pub mod run;
pub mod trace;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegenError;

/// Attribute holding a node's content fingerprint.
pub const FINGERPRINT: &str = "fingerprint";
/// Attribute set once when a node is first created.
pub const CREATED_AT: &str = "created_at";
/// Attribute refreshed on every semantic update.
pub const UPDATED_AT: &str = "updated_at";

/// Every label the engine reads or writes.
///
/// The first eleven variants are domain kinds; `Change` and `Run` are the
/// engine's own audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Epic,
    UserStory,
    AcceptanceCriterion,
    BoundedContext,
    Aggregate,
    Entity,
    ValueObject,
    Field,
    Command,
    Event,
    Policy,
    Change,
    Run,
}

/// Coarse grouping of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindCategory {
    Requirement,
    Structural,
    Behavioral,
    System,
}

impl NodeKind {
    pub const ALL: [NodeKind; 13] = [
        NodeKind::Epic,
        NodeKind::UserStory,
        NodeKind::AcceptanceCriterion,
        NodeKind::BoundedContext,
        NodeKind::Aggregate,
        NodeKind::Entity,
        NodeKind::ValueObject,
        NodeKind::Field,
        NodeKind::Command,
        NodeKind::Event,
        NodeKind::Policy,
        NodeKind::Change,
        NodeKind::Run,
    ];

    /// The graph label for this kind.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Epic => "Epic",
            NodeKind::UserStory => "UserStory",
            NodeKind::AcceptanceCriterion => "AcceptanceCriterion",
            NodeKind::BoundedContext => "BoundedContext",
            NodeKind::Aggregate => "Aggregate",
            NodeKind::Entity => "Entity",
            NodeKind::ValueObject => "ValueObject",
            NodeKind::Field => "Field",
            NodeKind::Command => "Command",
            NodeKind::Event => "Event",
            NodeKind::Policy => "Policy",
            NodeKind::Change => "Change",
            NodeKind::Run => "Run",
        }
    }

    pub fn category(&self) -> KindCategory {
        match self {
            NodeKind::Epic | NodeKind::UserStory | NodeKind::AcceptanceCriterion => {
                KindCategory::Requirement
            }
            NodeKind::BoundedContext
            | NodeKind::Aggregate
            | NodeKind::Entity
            | NodeKind::ValueObject
            | NodeKind::Field => KindCategory::Structural,
            NodeKind::Command | NodeKind::Event | NodeKind::Policy => KindCategory::Behavioral,
            NodeKind::Change | NodeKind::Run => KindCategory::System,
        }
    }

    pub fn is_requirement(&self) -> bool {
        self.category() == KindCategory::Requirement
    }

    /// Design artifacts are the kinds that can be dirtied and regenerated.
    pub fn is_design(&self) -> bool {
        matches!(
            self.category(),
            KindCategory::Structural | KindCategory::Behavioral
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for NodeKind {
    type Err = RegenError;

    /// Case-insensitive; accepts both `UserStory` and `user_story`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        NodeKind::ALL
            .into_iter()
            .find(|k| k.label().to_lowercase() == normalized)
            .ok_or_else(|| RegenError::invalid(format!("unknown node kind '{s}'")))
    }
}

/// Class of a relationship type, which decides how the engine treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RelClass {
    RequirementContainment,
    StructuralContainment,
    Trace,
    EventChain,
    Audit,
}

/// Typed directed relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelType {
    HasStory,
    HasCriterion,
    HasAggregate,
    HasEntity,
    HasValueObject,
    HasField,
    HandlesCommand,
    EmitsEvent,
    /// Stored as `(Policy)-[:LISTENS_EVENT]->(Event)`.
    ListensEvent,
    TriggersCommand,
    AffectsAggregate,
    ImpactsBoundedContext,
    ImpactsAggregate,
    ImpactsEntity,
    ImpactsValueObject,
    ImpactsField,
    CoversCommand,
    CoversEvent,
    CoversPolicy,
    Changed,
    Touched,
}

impl RelType {
    pub const ALL: [RelType; 21] = [
        RelType::HasStory,
        RelType::HasCriterion,
        RelType::HasAggregate,
        RelType::HasEntity,
        RelType::HasValueObject,
        RelType::HasField,
        RelType::HandlesCommand,
        RelType::EmitsEvent,
        RelType::ListensEvent,
        RelType::TriggersCommand,
        RelType::AffectsAggregate,
        RelType::ImpactsBoundedContext,
        RelType::ImpactsAggregate,
        RelType::ImpactsEntity,
        RelType::ImpactsValueObject,
        RelType::ImpactsField,
        RelType::CoversCommand,
        RelType::CoversEvent,
        RelType::CoversPolicy,
        RelType::Changed,
        RelType::Touched,
    ];

    /// The relationship type name as stored in the graph.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelType::HasStory => "HAS_STORY",
            RelType::HasCriterion => "HAS_CRITERION",
            RelType::HasAggregate => "HAS_AGGREGATE",
            RelType::HasEntity => "HAS_ENTITY",
            RelType::HasValueObject => "HAS_VALUE_OBJECT",
            RelType::HasField => "HAS_FIELD",
            RelType::HandlesCommand => "HANDLES_COMMAND",
            RelType::EmitsEvent => "EMITS_EVENT",
            RelType::ListensEvent => "LISTENS_EVENT",
            RelType::TriggersCommand => "TRIGGERS_COMMAND",
            RelType::AffectsAggregate => "AFFECTS_AGGREGATE",
            RelType::ImpactsBoundedContext => "IMPACTS_BOUNDED_CONTEXT",
            RelType::ImpactsAggregate => "IMPACTS_AGGREGATE",
            RelType::ImpactsEntity => "IMPACTS_ENTITY",
            RelType::ImpactsValueObject => "IMPACTS_VALUE_OBJECT",
            RelType::ImpactsField => "IMPACTS_FIELD",
            RelType::CoversCommand => "COVERS_COMMAND",
            RelType::CoversEvent => "COVERS_EVENT",
            RelType::CoversPolicy => "COVERS_POLICY",
            RelType::Changed => "CHANGED",
            RelType::Touched => "TOUCHED",
        }
    }

    pub fn class(&self) -> RelClass {
        match self {
            RelType::HasStory | RelType::HasCriterion => RelClass::RequirementContainment,
            RelType::HasAggregate
            | RelType::HasEntity
            | RelType::HasValueObject
            | RelType::HasField => RelClass::StructuralContainment,
            RelType::HandlesCommand
            | RelType::EmitsEvent
            | RelType::ListensEvent
            | RelType::TriggersCommand
            | RelType::AffectsAggregate => RelClass::EventChain,
            RelType::ImpactsBoundedContext
            | RelType::ImpactsAggregate
            | RelType::ImpactsEntity
            | RelType::ImpactsValueObject
            | RelType::ImpactsField
            | RelType::CoversCommand
            | RelType::CoversEvent
            | RelType::CoversPolicy => RelClass::Trace,
            RelType::Changed | RelType::Touched => RelClass::Audit,
        }
    }

    pub fn is_containment(&self) -> bool {
        matches!(
            self.class(),
            RelClass::RequirementContainment | RelClass::StructuralContainment
        )
    }

    /// Whether `(from)-[self]->(to)` is a legal edge.
    pub fn allows(&self, from: NodeKind, to: NodeKind) -> bool {
        use NodeKind::*;
        match self {
            RelType::HasStory => from == Epic && to == UserStory,
            RelType::HasCriterion => from == UserStory && to == AcceptanceCriterion,
            RelType::HasAggregate => from == BoundedContext && to == Aggregate,
            RelType::HasEntity => from == Aggregate && to == Entity,
            RelType::HasValueObject => from == Aggregate && to == ValueObject,
            RelType::HasField => matches!(from, Aggregate | Entity | ValueObject) && to == Field,
            RelType::HandlesCommand => from == Aggregate && to == Command,
            RelType::EmitsEvent => from == Command && to == Event,
            RelType::ListensEvent => from == Policy && to == Event,
            RelType::TriggersCommand => from == Policy && to == Command,
            RelType::AffectsAggregate => from == Event && to == Aggregate,
            RelType::Changed => from == Change,
            RelType::Touched => from == Run,
            trace => from.is_requirement() && RelType::trace_for(to) == Some(*trace),
        }
    }

    /// The containment relationship owning a child of `child` kind under `parent`.
    pub fn containment(parent: NodeKind, child: NodeKind) -> Option<RelType> {
        [
            RelType::HasStory,
            RelType::HasCriterion,
            RelType::HasAggregate,
            RelType::HasEntity,
            RelType::HasValueObject,
            RelType::HasField,
        ]
        .into_iter()
        .find(|rel| rel.allows(parent, child))
    }

    /// The trace relationship used for a requirement pointing at `target`.
    pub fn trace_for(target: NodeKind) -> Option<RelType> {
        match target {
            NodeKind::BoundedContext => Some(RelType::ImpactsBoundedContext),
            NodeKind::Aggregate => Some(RelType::ImpactsAggregate),
            NodeKind::Entity => Some(RelType::ImpactsEntity),
            NodeKind::ValueObject => Some(RelType::ImpactsValueObject),
            NodeKind::Field => Some(RelType::ImpactsField),
            NodeKind::Command => Some(RelType::CoversCommand),
            NodeKind::Event => Some(RelType::CoversEvent),
            NodeKind::Policy => Some(RelType::CoversPolicy),
            _ => None,
        }
    }
}

impl fmt::Display for RelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelType {
    type Err = RegenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        RelType::ALL
            .into_iter()
            .find(|r| r.as_str() == upper)
            .ok_or_else(|| RegenError::invalid(format!("unknown relationship type '{s}'")))
    }
}

/// Direction to follow a relationship from a given node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Reference to a node by kind and identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub kind: NodeKind,
    pub id: String,
}

impl NodeRef {
    pub fn new(kind: NodeKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Attribute values the store contract allows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Time(DateTime<Utc>),
    List(Vec<String>),
    Str(String),
}

impl PropValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropValue::Float(f) => Some(*f),
            PropValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Timestamps may come back from a store as RFC 3339 strings.
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            PropValue::Time(t) => Some(*t),
            PropValue::Str(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            PropValue::List(l) => Some(l),
            _ => None,
        }
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::Str(value.to_string())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::Str(value)
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Float(value)
    }
}

impl From<DateTime<Utc>> for PropValue {
    fn from(value: DateTime<Utc>) -> Self {
        PropValue::Time(value)
    }
}

impl From<Vec<String>> for PropValue {
    fn from(value: Vec<String>) -> Self {
        PropValue::List(value)
    }
}

/// Node or relationship attributes, ordered by key.
pub type Props = BTreeMap<String, PropValue>;

/// Read a string attribute.
pub fn prop_str(props: &Props, key: &str) -> Option<String> {
    props.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Read a timestamp attribute.
pub fn prop_time(props: &Props, key: &str) -> Option<DateTime<Utc>> {
    props.get(key).and_then(PropValue::as_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_is_lenient() {
        assert_eq!("user_story".parse::<NodeKind>().unwrap(), NodeKind::UserStory);
        assert_eq!("ValueObject".parse::<NodeKind>().unwrap(), NodeKind::ValueObject);
        assert_eq!("acceptance-criterion".parse::<NodeKind>().unwrap(), NodeKind::AcceptanceCriterion);
        assert!("Spaceship".parse::<NodeKind>().is_err());
    }

    #[test]
    fn test_containment_lookup() {
        assert_eq!(
            RelType::containment(NodeKind::Epic, NodeKind::UserStory),
            Some(RelType::HasStory)
        );
        assert_eq!(
            RelType::containment(NodeKind::Entity, NodeKind::Field),
            Some(RelType::HasField)
        );
        assert_eq!(RelType::containment(NodeKind::Epic, NodeKind::Field), None);
    }

    #[test]
    fn test_trace_endpoints() {
        assert!(RelType::CoversCommand.allows(NodeKind::AcceptanceCriterion, NodeKind::Command));
        assert!(RelType::ImpactsAggregate.allows(NodeKind::UserStory, NodeKind::Aggregate));
        assert!(!RelType::ImpactsAggregate.allows(NodeKind::Aggregate, NodeKind::Aggregate));
        assert!(!RelType::CoversEvent.allows(NodeKind::UserStory, NodeKind::Command));
    }

    #[test]
    fn test_listens_event_direction() {
        assert!(RelType::ListensEvent.allows(NodeKind::Policy, NodeKind::Event));
        assert!(!RelType::ListensEvent.allows(NodeKind::Event, NodeKind::Policy));
    }

    #[test]
    fn test_rel_type_round_trips_through_name() {
        for rel in RelType::ALL {
            assert_eq!(rel.as_str().parse::<RelType>().unwrap(), rel);
        }
    }

    #[test]
    fn test_time_reads_from_rfc3339_string() {
        let value = PropValue::Str("2026-03-01T10:00:00Z".to_string());
        assert!(value.as_time().is_some());
        assert!(PropValue::Str("soon".to_string()).as_time().is_none());
    }
}
