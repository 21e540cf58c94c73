//! Regeneration pipeline.
//!
//! Change notification, in-process regeneration, and the queue-backed
//! variant where a worker picks up one phase at a time.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use regen_core::job::{JobMessage, JobMode, JobQueue, REGENERATE_JOB};
use regen_core::model::run::RunPhase;
use regen_core::model::NodeRef;
use regen_core::{
    ClearPolicy, DirtyEntry, DirtySet, EngineConfig, NodePayload, Phase, RegenError, RegenResult,
};

use crate::batch::{BatchCoordinator, BundleOp, BundleOutcome};
use crate::change::evaluate;
use crate::dirty;
use crate::generation::{build_context, Generator};
use crate::impact::{find_impact, resolve_roots, ImpactOptions, ImpactReport};
use crate::run;
use crate::scope::scope;
use crate::store::{SharedStore, UnitOfWork};

/// Result of [`RegenerationPipeline::on_change`].
#[derive(Debug, Clone, Serialize)]
pub struct ChangeOutcome {
    pub node: NodeRef,
    pub changed: bool,
    /// The bundle that wrote the payload, its Change record and the dirty marks.
    pub bundle: Option<BundleOutcome>,
    pub impact: Option<ImpactReport>,
    pub marked: Vec<NodeRef>,
}

/// One phase of an in-process regeneration.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub run_id: String,
    pub outcome: Option<BundleOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegenerationReport {
    pub root: NodeRef,
    pub phases: Vec<PhaseResult>,
    /// Phases not attempted because an earlier one failed.
    pub skipped: Vec<Phase>,
}

impl RegenerationReport {
    pub fn succeeded(&self) -> bool {
        self.skipped.is_empty() && self.phases.iter().all(|p| p.error.is_none())
    }
}

pub struct RegenerationPipeline {
    store: SharedStore,
    config: EngineConfig,
    coordinator: BatchCoordinator,
}

impl RegenerationPipeline {
    pub fn new(store: SharedStore, config: EngineConfig) -> Self {
        let coordinator = BatchCoordinator::new(store.clone(), config.clone());
        Self {
            store,
            config,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &BatchCoordinator {
        &self.coordinator
    }

    fn impact_options(&self) -> ImpactOptions {
        ImpactOptions::from(&self.config.impact)
    }

    /// Upsert `payload` and, if its fingerprint moved, mark everything downstream dirty.
    ///
    /// The upsert and the marks commit in one bundle, so a failed
    /// propagation leaves the old fingerprint in place for a retry to see.
    /// Impact is computed first from the root's committed edges; the
    /// upsert's version precondition rejects the bundle if the root moved
    /// in between.
    pub async fn on_change(&self, payload: NodePayload, reason: &str) -> RegenResult<ChangeOutcome> {
        let node = payload.node_ref();
        let store = self.store.as_ref();
        let exists = store.get_node(&node).await?.is_some();
        let evaluation = evaluate(store, &UnitOfWork::new(), &node, &payload.fingerprint()).await?;
        if exists && !evaluation.changed {
            info!(node = %node, "Payload unchanged, nothing to propagate");
            return Ok(ChangeOutcome {
                node,
                changed: false,
                bundle: None,
                impact: None,
                marked: Vec::new(),
            });
        }

        let impact = if exists {
            find_impact(store, std::slice::from_ref(&node), self.impact_options()).await?
        } else {
            ImpactReport {
                roots: vec![node.clone()],
                max_hops: self.config.impact.max_hops,
                ..ImpactReport::default()
            }
        };

        let mut ops = vec![BundleOp::upsert(payload, reason)];
        let targets = impact.dirty_targets();
        if !targets.is_empty() {
            ops.push(BundleOp::MarkDirty {
                nodes: targets,
                reason: format!("Impacted by change to {node}: {reason}"),
            });
        }
        let bundle = self
            .coordinator
            .execute(RunPhase::Admin, "change-detector", ops)
            .await?;

        info!(node = %node, marked = bundle.marked.len(), "Change propagated");
        Ok(ChangeOutcome {
            node,
            changed: true,
            marked: bundle.marked.clone(),
            bundle: Some(bundle),
            impact: Some(impact),
        })
    }

    /// Nodes a regeneration of `root` covers.
    ///
    /// `Dirty` keeps the impacted nodes that are currently dirty; `Full`
    /// takes every impacted node.
    pub async fn regeneration_set(&self, root: &NodeRef, mode: JobMode) -> RegenResult<DirtySet> {
        let store = self.store.as_ref();
        let impact = find_impact(store, std::slice::from_ref(root), self.impact_options()).await?;
        let targets = impact.dirty_targets();
        let entries = match mode {
            JobMode::Dirty => dirty::list(store, None)
                .await?
                .entries
                .into_iter()
                .filter(|entry| targets.contains(&entry.node))
                .collect(),
            JobMode::Full => targets
                .into_iter()
                .map(|node| DirtyEntry {
                    node,
                    reason: format!("full regeneration of {root}"),
                    at: Utc::now(),
                })
                .collect(),
        };
        Ok(DirtySet::new(entries))
    }

    /// Regenerate `root` phase by phase. A failed phase stops the phases after it.
    pub async fn regenerate(
        &self,
        root: &NodeRef,
        generator: &dyn Generator,
        agent: &str,
        mode: JobMode,
    ) -> RegenResult<RegenerationReport> {
        let set = self.regeneration_set(root, mode).await?;
        let phases = scope(&set);
        let mut report = RegenerationReport {
            root: root.clone(),
            phases: Vec::new(),
            skipped: Vec::new(),
        };

        for (index, phase) in phases.iter().enumerate() {
            let run = run::start(self.store.as_ref(), RunPhase::from(*phase), agent).await?;
            let result = self
                .execute_phase(&run.id, root, *phase, &set.for_phase(*phase), generator)
                .await;
            match result {
                Ok(outcome) => report.phases.push(PhaseResult {
                    phase: *phase,
                    run_id: run.id,
                    outcome: Some(outcome),
                    error: None,
                }),
                Err(err) => {
                    warn!(root = %root, phase = %phase, error = %err, "Phase failed, stopping");
                    report.phases.push(PhaseResult {
                        phase: *phase,
                        run_id: run.id,
                        outcome: None,
                        error: Some(err.to_string()),
                    });
                    report.skipped = phases[index + 1..].to_vec();
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Generate and apply one phase under the running Run `run_id`.
    async fn execute_phase(
        &self,
        run_id: &str,
        root: &NodeRef,
        phase: Phase,
        dirty: &DirtySet,
        generator: &dyn Generator,
    ) -> RegenResult<BundleOutcome> {
        let store = self.store.as_ref();
        let ops = match self.phase_ops(root, phase, dirty, generator).await {
            Ok(ops) => ops,
            Err(err) => {
                if let Err(record_err) = run::fail(store, run_id, &err, Vec::new()).await {
                    warn!(run_id, error = %record_err, "Could not record run failure");
                }
                return Err(err);
            }
        };
        self.coordinator.run_bundle(run_id, ops).await
    }

    async fn phase_ops(
        &self,
        root: &NodeRef,
        phase: Phase,
        dirty: &DirtySet,
        generator: &dyn Generator,
    ) -> RegenResult<Vec<BundleOp>> {
        let store = self.store.as_ref();
        let context = build_context(store, root, phase, dirty).await?;
        let output = generator.generate(&context).await?;

        if let Some(entity) = output.entities.iter().find(|e| !e.kind().is_design()) {
            return Err(RegenError::invalid(format!(
                "generation output may not contain requirement node {}",
                entity.node_ref()
            )));
        }

        let mut links = Vec::with_capacity(output.trace.source_to_target.len());
        for hint in &output.trace.source_to_target {
            links.push(hint.resolve(store, &output.entities).await?);
        }

        let regenerated: Vec<NodeRef> = output.entities.iter().map(NodePayload::node_ref).collect();
        let mut ops: Vec<BundleOp> = output
            .entities
            .into_iter()
            .map(BundleOp::generated)
            .collect();
        ops.extend(links.into_iter().map(BundleOp::Trace));

        if self.config.clear_policy == ClearPolicy::OnUpsert {
            let clear: Vec<NodeRef> = dirty
                .refs()
                .into_iter()
                .filter(|node| regenerated.contains(node))
                .collect();
            if !clear.is_empty() {
                ops.push(BundleOp::ClearDirty { nodes: clear });
            }
        }
        Ok(ops)
    }

    /// Publish one reference-only job per phase, each with a queued Run.
    pub async fn enqueue(
        &self,
        queue: &dyn JobQueue,
        project_id: &str,
        root: &NodeRef,
        mode: JobMode,
    ) -> RegenResult<Vec<JobMessage>> {
        let set = self.regeneration_set(root, mode).await?;
        let mut jobs = Vec::new();
        for phase in scope(&set) {
            let run = run::enqueue(self.store.as_ref(), RunPhase::from(phase), "regen-queue").await?;
            let job = JobMessage::regenerate(
                project_id,
                root.to_string(),
                phase,
                set.for_phase(phase).by_kind(),
                mode,
                run.id,
            );
            queue.publish(&job).await?;
            info!(project_id, run_id = %job.run_id, phase = %phase, "Enqueued regeneration job");
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Worker side of [`Self::enqueue`]: resolve the job against the graph and run its phase.
    pub async fn process_job(
        &self,
        job: &JobMessage,
        generator: &dyn Generator,
    ) -> RegenResult<BundleOutcome> {
        if job.job_type != REGENERATE_JOB {
            return Err(RegenError::invalid(format!("unknown job type '{}'", job.job_type)));
        }
        let store = self.store.as_ref();
        run::begin(store, &job.run_id).await?;

        let resolved = match self.job_targets(job).await {
            Ok(resolved) => resolved,
            Err(err) => {
                if let Err(record_err) = run::fail(store, &job.run_id, &err, Vec::new()).await {
                    warn!(run_id = %job.run_id, error = %record_err, "Could not record run failure");
                }
                return Err(err);
            }
        };
        let (root, set) = resolved;
        self.execute_phase(&job.run_id, &root, job.phase, &set, generator)
            .await
    }

    /// Root and still-relevant nodes of a job, read fresh from the graph.
    async fn job_targets(&self, job: &JobMessage) -> RegenResult<(NodeRef, DirtySet)> {
        let store = self.store.as_ref();
        let root = resolve_roots(store, std::slice::from_ref(&job.root_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RegenError::dangling(format!("job root '{}'", job.root_id)))?;

        let mut entries = Vec::new();
        for (kind, ids) in &job.dirty_node_ids {
            for id in ids {
                let node = NodeRef::new(*kind, id.clone());
                let Some(stored) = store.get_node(&node).await? else {
                    warn!(node = %node, "Job node no longer exists");
                    continue;
                };
                if job.mode == JobMode::Dirty && !stored.is_dirty() {
                    continue;
                }
                entries.push(DirtyEntry {
                    node,
                    reason: format!("job {}", job.run_id),
                    at: Utc::now(),
                });
            }
        }
        Ok((root, DirtySet::new(entries)))
    }
}
