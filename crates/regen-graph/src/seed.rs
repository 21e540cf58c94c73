//! Seed loader.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use regen_core::model::run::RunPhase;
use regen_core::model::trace::TraceLink;
use regen_core::{NodePayload, NodeRef, RegenResult, RelType};

use crate::batch::{BatchCoordinator, BundleOp, BundleOutcome};

/// An event-chain relationship between two seeded nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedLink {
    pub from: NodeRef,
    pub rel: RelType,
    pub to: NodeRef,
}

/// Bulk graph content applied as one bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedDocument {
    #[serde(default)]
    pub nodes: Vec<NodePayload>,
    #[serde(default)]
    pub links: Vec<SeedLink>,
    #[serde(default)]
    pub traces: Vec<TraceLink>,
}

impl SeedDocument {
    pub fn from_json(raw: &str) -> RegenResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: &Path) -> RegenResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Nodes first (parents before children), then links, then traces.
    pub fn into_ops(self) -> Vec<BundleOp> {
        let mut nodes = self.nodes;
        nodes.sort_by_key(NodePayload::kind);
        let mut ops: Vec<BundleOp> = nodes
            .into_iter()
            .map(|payload| BundleOp::upsert(payload, "seed"))
            .collect();
        ops.extend(
            self.links
                .into_iter()
                .map(|link| BundleOp::Link {
                    from: link.from,
                    rel: link.rel,
                    to: link.to,
                }),
        );
        ops.extend(self.traces.into_iter().map(BundleOp::Trace));
        ops
    }
}

/// Apply `document` under a new ingest Run.
pub async fn load_seed(
    coordinator: &BatchCoordinator,
    document: SeedDocument,
) -> RegenResult<BundleOutcome> {
    let counts = (
        document.nodes.len(),
        document.links.len(),
        document.traces.len(),
    );
    let outcome = coordinator
        .execute(RunPhase::Ingest, "seed", document.into_ops())
        .await?;
    info!(
        run_id = %outcome.run_id,
        nodes = counts.0,
        links = counts.1,
        traces = counts.2,
        "Seed loaded"
    );
    Ok(outcome)
}
