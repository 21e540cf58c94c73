//! Batch/transaction coordinator.
//!
//! A bundle is staged op by op into one [`UnitOfWork`] and committed
//! together with the Run's `TOUCHED` edges and its transition to
//! `completed`. Either the whole unit lands or nothing does, in which case
//! the Run is moved to `failed` with every op listed as unapplied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use regen_core::model::change::ChangeRecord;
use regen_core::model::run::{Run, RunPhase, RunStatus};
use regen_core::model::trace::TraceLink;
use regen_core::model::{NodeRef, RelType};
use regen_core::{EngineConfig, NodePayload, RegenError, RegenResult};

use crate::dirty::{stage_clear, stage_mark};
use crate::run::{self, Termination};
use crate::store::{SharedStore, UnitOfWork};
use crate::trace::stage_trace;
use crate::upsert::{stage_link, stage_upsert, UpsertOptions};

/// One operation inside a bundle.
#[derive(Debug, Clone)]
pub enum BundleOp {
    Upsert {
        payload: NodePayload,
        reason: String,
        /// Generation output; stamps `regenerated_at`/`regenerated_by` with the Run.
        generated: bool,
    },
    Link {
        from: NodeRef,
        rel: RelType,
        to: NodeRef,
    },
    Trace(TraceLink),
    MarkDirty {
        nodes: Vec<NodeRef>,
        reason: String,
    },
    ClearDirty {
        nodes: Vec<NodeRef>,
    },
}

impl BundleOp {
    pub fn upsert(payload: NodePayload, reason: impl Into<String>) -> Self {
        BundleOp::Upsert {
            payload,
            reason: reason.into(),
            generated: false,
        }
    }

    pub fn generated(payload: NodePayload) -> Self {
        BundleOp::Upsert {
            payload,
            reason: String::new(),
            generated: true,
        }
    }

    /// Short description recorded on failed Runs.
    pub fn describe(&self) -> String {
        let join = |nodes: &[NodeRef]| {
            nodes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        match self {
            BundleOp::Upsert { payload, .. } => format!("upsert {}", payload.node_ref()),
            BundleOp::Link { from, rel, to } => format!("link {from} {rel} {to}"),
            BundleOp::Trace(link) => format!("trace {} -> {}", link.from, link.to),
            BundleOp::MarkDirty { nodes, .. } => format!("mark {}", join(nodes)),
            BundleOp::ClearDirty { nodes } => format!("clear {}", join(nodes)),
        }
    }
}

/// A bundle staged against a Run, ready to commit.
#[derive(Debug)]
pub struct PreparedBundle {
    run: Run,
    run_version: u64,
    unit: UnitOfWork,
    descriptions: Vec<String>,
    changes: Vec<ChangeRecord>,
    marked: Vec<NodeRef>,
    cleared: Vec<NodeRef>,
    refused: Vec<NodeRef>,
    cancelled: Arc<AtomicBool>,
}

impl PreparedBundle {
    pub fn run_id(&self) -> &str {
        &self.run.id
    }

    /// Flag checked before every commit attempt.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Result of a committed bundle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BundleOutcome {
    pub run_id: String,
    pub applied: usize,
    pub nodes_written: Vec<NodeRef>,
    pub changes: Vec<ChangeRecord>,
    pub marked: Vec<NodeRef>,
    pub cleared: Vec<NodeRef>,
    /// Left dirty because no regeneration output has been upserted for them yet.
    pub refused: Vec<NodeRef>,
    pub attempts: u32,
}

/// Single logical writer for each Run.
#[derive(Clone)]
pub struct BatchCoordinator {
    store: SharedStore,
    config: EngineConfig,
}

impl BatchCoordinator {
    pub fn new(store: SharedStore, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stage `ops` for the running Run `run_id`.
    ///
    /// A logical error in any op fails the Run and writes nothing else.
    pub async fn prepare(&self, run_id: &str, ops: Vec<BundleOp>) -> RegenResult<PreparedBundle> {
        let store = self.store.as_ref();
        let (run, run_version) = run::load(store, run_id).await?;
        if run.status != RunStatus::Running {
            return Err(RegenError::phase(
                run_id,
                format!("bundles need a running run, found {}", run.status.as_str()),
            ));
        }

        let descriptions: Vec<String> = ops.iter().map(BundleOp::describe).collect();
        let mut prepared = PreparedBundle {
            run,
            run_version,
            unit: UnitOfWork::new(),
            descriptions,
            changes: Vec::new(),
            marked: Vec::new(),
            cleared: Vec::new(),
            refused: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        for (index, op) in ops.iter().enumerate() {
            if let Err(err) = self.stage(&mut prepared, op).await {
                warn!(run_id, op = index, error = %err, "Bundle rejected while staging");
                self.record_failure(&prepared, &err).await;
                return Err(err);
            }
        }
        debug!(run_id, ops = ops.len(), writes = prepared.unit.len(), "Bundle prepared");
        Ok(prepared)
    }

    async fn stage(&self, prepared: &mut PreparedBundle, op: &BundleOp) -> RegenResult<()> {
        let store = self.store.as_ref();
        let unit = &mut prepared.unit;
        match op {
            BundleOp::Upsert {
                payload,
                reason,
                generated,
            } => {
                let options = if *generated {
                    UpsertOptions::generated(prepared.run.id.clone())
                } else {
                    UpsertOptions::reason(reason.clone())
                };
                let outcome = stage_upsert(store, unit, payload, &options).await?;
                prepared.changes.extend(outcome.change);
            }
            BundleOp::Link { from, rel, to } => stage_link(store, unit, from, *rel, to).await?,
            BundleOp::Trace(link) => {
                stage_trace(store, unit, link).await?;
            }
            BundleOp::MarkDirty { nodes, reason } => {
                let outcome = stage_mark(store, unit, nodes, reason).await?;
                if let Some(node) = outcome.missing.first() {
                    return Err(RegenError::dangling(format!("cannot mark missing node {node}")));
                }
                prepared.marked.extend(outcome.marked);
            }
            BundleOp::ClearDirty { nodes } => {
                let outcome = stage_clear(store, unit, nodes, self.config.clear_policy).await?;
                prepared.cleared.extend(outcome.cleared);
                prepared.refused.extend(outcome.refused);
            }
        }
        Ok(())
    }

    /// Commit a prepared bundle and complete its Run.
    ///
    /// Transient store errors are retried with backoff; anything else, a
    /// cancellation or the Run budget running out fails the Run.
    pub async fn commit(&self, prepared: PreparedBundle) -> RegenResult<BundleOutcome> {
        let budget = self.config.batch.run_timeout();
        let run_id = prepared.run.id.clone();
        let result = match tokio::time::timeout(budget, self.commit_with_retry(&prepared)).await {
            Ok(result) => result,
            Err(_) => Err(RegenError::RunTimeout {
                run_id: run_id.clone(),
                budget_ms: budget.as_millis() as u64,
            }),
        };

        match result {
            Ok(outcome) => {
                info!(
                    run_id = %run_id,
                    nodes = outcome.nodes_written.len(),
                    changes = outcome.changes.len(),
                    cleared = outcome.cleared.len(),
                    attempts = outcome.attempts,
                    "Bundle committed"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.record_failure(&prepared, &err).await;
                Err(err)
            }
        }
    }

    async fn commit_with_retry(&self, prepared: &PreparedBundle) -> RegenResult<BundleOutcome> {
        let run_id = prepared.run.id.as_str();
        let mut unit = prepared.unit.clone();
        let touched: Vec<NodeRef> = unit
            .written_nodes()
            .into_iter()
            .filter(|node| node.kind.is_design() || node.kind.is_requirement())
            .collect();
        run::stage_touch(&mut unit, run_id, &touched);
        run::stage_finish(
            &mut unit,
            &prepared.run,
            prepared.run_version,
            RunStatus::Completed,
            Termination::default(),
        )?;

        let max_retries = self.config.batch.max_retries;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if prepared.cancelled.load(Ordering::SeqCst) {
                return Err(RegenError::RunCancelled(run_id.to_string()));
            }
            match self.store.commit(unit.clone()).await {
                Ok(_) => {
                    return Ok(BundleOutcome {
                        run_id: run_id.to_string(),
                        applied: prepared.descriptions.len(),
                        nodes_written: touched,
                        changes: prepared.changes.clone(),
                        marked: prepared.marked.clone(),
                        cleared: prepared.cleared.clone(),
                        refused: prepared.refused.clone(),
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_transient() && attempt <= max_retries => {
                    let delay = self.config.batch.backoff(attempt);
                    warn!(run_id, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying bundle commit");
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    return Err(RegenError::TransactionAbort(format!(
                        "gave up after {attempt} attempts: {err}"
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn record_failure(&self, prepared: &PreparedBundle, err: &RegenError) {
        let run_id = prepared.run.id.as_str();
        if let Err(record_err) = run::fail(
            self.store.as_ref(),
            run_id,
            err,
            prepared.descriptions.clone(),
        )
        .await
        {
            warn!(run_id, error = %record_err, "Could not record run failure");
        }
    }

    /// Prepare and commit in one step.
    pub async fn run_bundle(&self, run_id: &str, ops: Vec<BundleOp>) -> RegenResult<BundleOutcome> {
        let prepared = self.prepare(run_id, ops).await?;
        self.commit(prepared).await
    }

    /// Start a Run and apply `ops` under it.
    pub async fn execute(
        &self,
        phase: RunPhase,
        agent: &str,
        ops: Vec<BundleOp>,
    ) -> RegenResult<BundleOutcome> {
        let run = run::start(self.store.as_ref(), phase, agent).await?;
        self.run_bundle(&run.id, ops).await
    }
}
