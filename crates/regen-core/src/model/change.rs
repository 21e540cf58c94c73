//! Immutable change records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{prop_str, prop_time, NodeKind, NodeRef, Props};

/// Append-only record of a fingerprint transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: String,
    pub label: NodeKind,
    pub node_id: String,
    pub before_hash: Option<String>,
    pub after_hash: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(
        node: &NodeRef,
        before_hash: Option<String>,
        after_hash: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("CHG_{}", Uuid::new_v4().simple()),
            label: node.kind,
            node_id: node.id.clone(),
            before_hash,
            after_hash: after_hash.into(),
            reason: reason.into(),
            at: Utc::now(),
        }
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.label, self.node_id.clone())
    }

    pub fn to_props(&self) -> Props {
        let mut props = Props::new();
        props.insert("label".to_string(), self.label.label().into());
        props.insert("node_id".to_string(), self.node_id.clone().into());
        if let Some(before) = &self.before_hash {
            props.insert("before_hash".to_string(), before.clone().into());
        }
        props.insert("after_hash".to_string(), self.after_hash.clone().into());
        props.insert("reason".to_string(), self.reason.clone().into());
        props.insert("at".to_string(), self.at.into());
        props
    }

    /// Rebuild a record from stored attributes; `None` if required attributes are missing.
    pub fn from_props(id: &str, props: &Props) -> Option<Self> {
        Some(Self {
            id: id.to_string(),
            label: prop_str(props, "label")?.parse().ok()?,
            node_id: prop_str(props, "node_id")?,
            before_hash: prop_str(props, "before_hash"),
            after_hash: prop_str(props, "after_hash")?,
            reason: prop_str(props, "reason").unwrap_or_default(),
            at: prop_time(props, "at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_props_round_trip() {
        let node = NodeRef::new(NodeKind::UserStory, "US_001");
        let record = ChangeRecord::new(&node, Some("h1".into()), "h2", "story text edited");
        let restored = ChangeRecord::from_props(&record.id, &record.to_props()).unwrap();
        assert_eq!(restored, record);
        assert!(record.id.starts_with("CHG_"));
    }

    #[test]
    fn test_first_record_has_no_before_hash() {
        let node = NodeRef::new(NodeKind::Epic, "EP_1");
        let record = ChangeRecord::new(&node, None, "h1", "created");
        let props = record.to_props();
        assert!(!props.contains_key("before_hash"));
        assert_eq!(ChangeRecord::from_props(&record.id, &props).unwrap().before_hash, None);
    }
}
