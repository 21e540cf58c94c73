//! Job-queue contract.
//!
//! Messages carry references only. Workers resolve requirement text and
//! node snapshots from the graph when they pick a job up.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RegenResult;
use crate::model::dirty::Phase;
use crate::model::NodeKind;

pub const REGENERATE_JOB: &str = "regenerate";

/// Whether a job regenerates only the dirty nodes or everything under the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    #[default]
    Dirty,
    Full,
}

impl JobMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "dirty" => Some(Self::Dirty),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub job_type: String,
    pub project_id: String,
    pub root_id: String,
    pub dirty_node_ids: BTreeMap<NodeKind, Vec<String>>,
    pub phase: Phase,
    pub mode: JobMode,
    pub run_id: String,
}

impl JobMessage {
    pub fn regenerate(
        project_id: impl Into<String>,
        root_id: impl Into<String>,
        phase: Phase,
        dirty_node_ids: BTreeMap<NodeKind, Vec<String>>,
        mode: JobMode,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            job_type: REGENERATE_JOB.to_string(),
            project_id: project_id.into(),
            root_id: root_id.into(),
            dirty_node_ids,
            phase,
            mode,
            run_id: run_id.into(),
        }
    }
}

/// Transport for job messages, scoped per project.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn publish(&self, job: &JobMessage) -> RegenResult<()>;

    /// Wait up to `wait` for the next job of `project_id`.
    async fn receive(&self, project_id: &str, wait: Duration) -> RegenResult<Option<JobMessage>>;

    /// Number of jobs waiting for `project_id`.
    async fn pending(&self, project_id: &str) -> RegenResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_uses_camel_case_references_only() {
        let mut dirty = BTreeMap::new();
        dirty.insert(NodeKind::Aggregate, vec!["AGG_ORDER".to_string()]);
        let job = JobMessage::regenerate("shop", "US_001", Phase::Structural, dirty, JobMode::Dirty, "RUN_1");
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["jobType"], "regenerate");
        assert_eq!(json["rootId"], "US_001");
        assert_eq!(json["dirtyNodeIds"]["Aggregate"][0], "AGG_ORDER");
        assert_eq!(json["phase"], "Structural");
        assert_eq!(json["mode"], "dirty");
        assert_eq!(json.as_object().unwrap().len(), 7);
    }
}
