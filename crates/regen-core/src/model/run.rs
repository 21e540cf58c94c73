//! Run records: one atomic unit of regeneration work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::dirty::Phase;
use super::{prop_str, prop_time, PropValue, Props};

/// What a Run is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunPhase {
    Structural,
    Behavioral,
    /// Seed or externally supplied bulk load.
    Ingest,
    /// Manual administrative mutation (dirty mark/clear, change notification).
    Admin,
}

impl RunPhase {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "structural" => Some(Self::Structural),
            "behavioral" => Some(Self::Behavioral),
            "ingest" => Some(Self::Ingest),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::Behavioral => "behavioral",
            Self::Ingest => "ingest",
            Self::Admin => "admin",
        }
    }
}

impl From<Phase> for RunPhase {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Structural => Self::Structural,
            Phase::Behavioral => Self::Behavioral,
        }
    }
}

/// Run status; moves monotonically `queued -> running -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, to: &Self) -> bool {
        match (self, to) {
            (Self::Queued, Self::Running) => true,
            (Self::Queued, Self::Failed) => true,
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Failed) => true,
            _ => false,
        }
    }
}

/// Execution metadata for a Run node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub phase: RunPhase,
    pub agent: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure_kind: Option<String>,
    pub failure_message: Option<String>,
    /// Descriptions of bundle operations that were not applied.
    pub unapplied: Vec<String>,
}

impl Run {
    pub fn new_id() -> String {
        format!("RUN_{}", Uuid::new_v4().simple())
    }

    pub fn queued(phase: RunPhase, agent: impl Into<String>) -> Self {
        Self {
            id: Self::new_id(),
            phase,
            agent: agent.into(),
            status: RunStatus::Queued,
            started_at: None,
            ended_at: None,
            failure_kind: None,
            failure_message: None,
            unapplied: Vec::new(),
        }
    }

    pub fn to_props(&self) -> Props {
        let mut props = Props::new();
        props.insert("phase".to_string(), self.phase.as_str().into());
        props.insert("agent".to_string(), self.agent.clone().into());
        props.insert("status".to_string(), self.status.as_str().into());
        if let Some(at) = self.started_at {
            props.insert("started_at".to_string(), at.into());
        }
        if let Some(at) = self.ended_at {
            props.insert("ended_at".to_string(), at.into());
        }
        if let Some(kind) = &self.failure_kind {
            props.insert("failure_kind".to_string(), kind.clone().into());
        }
        if let Some(message) = &self.failure_message {
            props.insert("failure_message".to_string(), message.clone().into());
        }
        if !self.unapplied.is_empty() {
            props.insert("unapplied".to_string(), PropValue::List(self.unapplied.clone()));
        }
        props
    }

    pub fn from_props(id: &str, props: &Props) -> Option<Self> {
        Some(Self {
            id: id.to_string(),
            phase: RunPhase::from_str(&prop_str(props, "phase")?)?,
            agent: prop_str(props, "agent").unwrap_or_default(),
            status: RunStatus::from_str(&prop_str(props, "status")?)?,
            started_at: prop_time(props, "started_at"),
            ended_at: prop_time(props, "ended_at"),
            failure_kind: prop_str(props, "failure_kind"),
            failure_message: prop_str(props, "failure_message"),
            unapplied: props
                .get("unapplied")
                .and_then(|v| v.as_list())
                .map(<[String]>::to_vec)
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(RunStatus::Queued.can_transition_to(&RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(&RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(&RunStatus::Failed));
        assert!(!RunStatus::Completed.can_transition_to(&RunStatus::Failed));
        assert!(!RunStatus::Failed.can_transition_to(&RunStatus::Running));
        assert!(!RunStatus::Running.can_transition_to(&RunStatus::Queued));
    }

    #[test]
    fn test_run_props_round_trip() {
        let mut run = Run::queued(RunPhase::Structural, "regen-worker");
        run.status = RunStatus::Failed;
        run.started_at = Some(Utc::now());
        run.ended_at = Some(Utc::now());
        run.failure_kind = Some("DanglingReference".to_string());
        run.unapplied = vec!["upsert Aggregate:AGG_X".to_string()];
        let restored = Run::from_props(&run.id, &run.to_props()).unwrap();
        assert_eq!(restored, run);
    }
}
