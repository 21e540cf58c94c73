//! Scored trace links from requirements to design elements.

use serde::{Deserialize, Serialize};

use super::{NodeRef, PropValue, Props, RelType};
use crate::error::{RegenError, RegenResult};

pub const CONFIDENCE: &str = "confidence";
pub const RATIONALE: &str = "rationale";
pub const EVIDENCE_REF: &str = "evidence_ref";

/// An explicit trace relationship request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceLink {
    pub from: NodeRef,
    pub to: NodeRef,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub evidence_ref: Option<String>,
}

impl TraceLink {
    pub fn new(from: NodeRef, to: NodeRef, confidence: f64) -> Self {
        Self {
            from,
            to,
            confidence,
            rationale: String::new(),
            evidence_ref: None,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence_ref = Some(evidence.into());
        self
    }

    /// Resolve the relationship type, rejecting illegal endpoints and out-of-range scores.
    pub fn rel_type(&self) -> RegenResult<RelType> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(RegenError::invalid(format!(
                "trace {} -> {} has confidence {} outside [0, 1]",
                self.from, self.to, self.confidence
            )));
        }
        if !self.from.kind.is_requirement() {
            return Err(RegenError::invalid(format!(
                "trace source {} must be a requirement node",
                self.from
            )));
        }
        RelType::trace_for(self.to.kind).ok_or_else(|| {
            RegenError::invalid(format!(
                "trace target {} must be a domain or behavior node",
                self.to
            ))
        })
    }

    /// Attributes overwritten on every upsert of the link.
    pub fn props(&self) -> Props {
        let mut props = Props::new();
        props.insert(CONFIDENCE.to_string(), PropValue::Float(self.confidence));
        props.insert(RATIONALE.to_string(), self.rationale.clone().into());
        if let Some(evidence) = &self.evidence_ref {
            props.insert(EVIDENCE_REF.to_string(), evidence.clone().into());
        }
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeKind;

    fn link(confidence: f64) -> TraceLink {
        TraceLink::new(
            NodeRef::new(NodeKind::UserStory, "US_001"),
            NodeRef::new(NodeKind::Aggregate, "AGG_ORDER"),
            confidence,
        )
    }

    #[test]
    fn test_rel_type_for_aggregate() {
        assert_eq!(link(0.9).rel_type().unwrap(), RelType::ImpactsAggregate);
    }

    #[test]
    fn test_confidence_bounds() {
        assert!(link(0.0).rel_type().is_ok());
        assert!(link(1.0).rel_type().is_ok());
        assert!(link(1.01).rel_type().is_err());
        assert!(link(-0.1).rel_type().is_err());
        assert!(link(f64::NAN).rel_type().is_err());
    }

    #[test]
    fn test_source_must_be_requirement() {
        let bad = TraceLink::new(
            NodeRef::new(NodeKind::Aggregate, "AGG_ORDER"),
            NodeRef::new(NodeKind::Command, "CMD_PLACE_ORDER"),
            0.5,
        );
        assert!(bad.rel_type().is_err());
    }

    #[test]
    fn test_props_omit_missing_evidence() {
        let props = link(0.7).with_rationale("order lifecycle").props();
        assert!(!props.contains_key(EVIDENCE_REF));
        assert_eq!(props[RATIONALE].as_str(), Some("order lifecycle"));
    }
}
