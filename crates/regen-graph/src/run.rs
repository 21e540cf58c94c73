//! Run tracker.
//!
//! Runs live in the graph as `Run` nodes. Status moves forward only, and
//! every status write carries a version check on the Run node, so two
//! writers cannot both finish the same Run.

use chrono::Utc;
use tracing::{info, warn};

use regen_core::model::run::{Run, RunPhase, RunStatus};
use regen_core::model::{Direction, NodeKind, NodeRef, Props, RelType, CREATED_AT};
use regen_core::{RegenError, RegenResult};

use crate::store::{GraphStore, NodeQuery, Precondition, UnitOfWork, WriteOp};

pub(crate) fn run_ref(run_id: &str) -> NodeRef {
    NodeRef::new(NodeKind::Run, run_id)
}

/// Read a Run together with its node version.
pub async fn load(store: &dyn GraphStore, run_id: &str) -> RegenResult<(Run, u64)> {
    let node = store
        .get_node(&run_ref(run_id))
        .await?
        .ok_or_else(|| RegenError::NotFound(format!("run '{run_id}'")))?;
    let run = Run::from_props(&node.id, &node.props)
        .ok_or_else(|| RegenError::Store(format!("run '{run_id}' has malformed attributes")))?;
    Ok((run, node.version))
}

pub async fn get(store: &dyn GraphStore, run_id: &str) -> RegenResult<Option<Run>> {
    match load(store, run_id).await {
        Ok((run, _)) => Ok(Some(run)),
        Err(RegenError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

async fn create(store: &dyn GraphStore, run: &Run) -> RegenResult<()> {
    let mut unit = UnitOfWork::new();
    unit.push(WriteOp::CreateNode {
        node: run_ref(&run.id),
        props: run.to_props(),
    });
    store.commit(unit).await?;
    Ok(())
}

/// Record a Run that a worker will pick up later.
pub async fn enqueue(
    store: &dyn GraphStore,
    phase: RunPhase,
    agent: &str,
) -> RegenResult<Run> {
    let run = Run::queued(phase, agent);
    create(store, &run).await?;
    info!(run_id = %run.id, phase = phase.as_str(), agent, "Queued run");
    Ok(run)
}

/// Open a Run that is already executing.
pub async fn start(store: &dyn GraphStore, phase: RunPhase, agent: &str) -> RegenResult<Run> {
    let mut run = Run::queued(phase, agent);
    run.status = RunStatus::Running;
    run.started_at = Some(Utc::now());
    create(store, &run).await?;
    info!(run_id = %run.id, phase = phase.as_str(), agent, "Started run");
    Ok(run)
}

/// Move a queued Run to running.
pub async fn begin(store: &dyn GraphStore, run_id: &str) -> RegenResult<Run> {
    let (mut run, version) = load(store, run_id).await?;
    if run.status != RunStatus::Queued {
        return Err(RegenError::phase(
            run_id,
            format!("cannot begin a run that is {}", run.status.as_str()),
        ));
    }
    run.status = RunStatus::Running;
    run.started_at = Some(Utc::now());

    let mut unit = UnitOfWork::new();
    unit.require(Precondition::Version {
        node: run_ref(run_id),
        expected: Some(version),
    });
    let mut props = Props::new();
    props.insert("status".into(), run.status.as_str().into());
    if let Some(at) = run.started_at {
        props.insert("started_at".into(), at.into());
    }
    unit.push(WriteOp::SetProps {
        node: run_ref(run_id),
        props,
    });
    store.commit(unit).await?;
    info!(run_id, "Run picked up");
    Ok(run)
}

/// Stage `TOUCHED` edges from the Run to `nodes`.
pub fn stage_touch(unit: &mut UnitOfWork, run_id: &str, nodes: &[NodeRef]) {
    let at = Utc::now();
    for node in nodes {
        let mut on_create = Props::new();
        on_create.insert(CREATED_AT.to_string(), at.into());
        unit.push(WriteOp::MergeEdge {
            from: run_ref(run_id),
            rel: RelType::Touched,
            to: node.clone(),
            on_create,
            set: Props::new(),
        });
    }
}

/// Record that a non-terminal Run touched `nodes`.
pub async fn touch(store: &dyn GraphStore, run_id: &str, nodes: &[NodeRef]) -> RegenResult<()> {
    let (run, version) = load(store, run_id).await?;
    if run.status.is_terminal() {
        return Err(RegenError::phase(
            run_id,
            format!("cannot touch nodes from a {} run", run.status.as_str()),
        ));
    }
    let mut unit = UnitOfWork::new();
    unit.require(Precondition::Version {
        node: run_ref(run_id),
        expected: Some(version),
    });
    stage_touch(&mut unit, run_id, nodes);
    store.commit(unit).await?;
    Ok(())
}

/// How a Run ended.
#[derive(Debug, Clone, Default)]
pub struct Termination {
    pub failure_kind: Option<String>,
    pub failure_message: Option<String>,
    pub unapplied: Vec<String>,
}

impl Termination {
    pub fn failed(err: &RegenError, unapplied: Vec<String>) -> Self {
        Self {
            failure_kind: Some(err.kind().to_string()),
            failure_message: Some(err.to_string()),
            unapplied,
        }
    }
}

/// Stage the terminal transition of `run`, read at `version`.
pub fn stage_finish(
    unit: &mut UnitOfWork,
    run: &Run,
    version: u64,
    status: RunStatus,
    termination: Termination,
) -> RegenResult<Run> {
    if run.status.is_terminal() {
        return Err(RegenError::phase(
            &run.id,
            format!("run is already {}", run.status.as_str()),
        ));
    }
    if !status.is_terminal() || !run.status.can_transition_to(&status) {
        return Err(RegenError::phase(
            &run.id,
            format!(
                "cannot move from {} to {}",
                run.status.as_str(),
                status.as_str()
            ),
        ));
    }

    let mut finished = run.clone();
    finished.status = status;
    finished.ended_at = Some(Utc::now());
    finished.failure_kind = termination.failure_kind;
    finished.failure_message = termination.failure_message;
    finished.unapplied = termination.unapplied;

    unit.require(Precondition::Version {
        node: run_ref(&run.id),
        expected: Some(version),
    });
    unit.push(WriteOp::SetProps {
        node: run_ref(&run.id),
        props: finished.to_props(),
    });
    Ok(finished)
}

/// Move a Run to a terminal status.
pub async fn finish(
    store: &dyn GraphStore,
    run_id: &str,
    status: RunStatus,
    termination: Termination,
) -> RegenResult<Run> {
    let (run, version) = load(store, run_id).await?;
    let mut unit = UnitOfWork::new();
    let finished = stage_finish(&mut unit, &run, version, status, termination)?;
    store.commit(unit).await?;
    info!(run_id, status = status.as_str(), "Run finished");
    Ok(finished)
}

/// Mark a Run failed with `err`.
pub async fn fail(
    store: &dyn GraphStore,
    run_id: &str,
    err: &RegenError,
    unapplied: Vec<String>,
) -> RegenResult<Run> {
    warn!(run_id, kind = err.kind(), error = %err, "Run failed");
    finish(
        store,
        run_id,
        RunStatus::Failed,
        Termination::failed(err, unapplied),
    )
    .await
}

/// Nodes touched by a Run.
pub async fn touched(store: &dyn GraphStore, run_id: &str) -> RegenResult<Vec<NodeRef>> {
    let mut nodes: Vec<NodeRef> = store
        .neighbors(&run_ref(run_id), RelType::Touched, Direction::Outgoing)
        .await?
        .into_iter()
        .map(|edge| edge.other)
        .collect();
    nodes.sort();
    Ok(nodes)
}

/// Runs, newest first, optionally filtered by status.
pub async fn list(store: &dyn GraphStore, status: Option<RunStatus>) -> RegenResult<Vec<Run>> {
    let mut query = NodeQuery::kind(NodeKind::Run);
    if let Some(status) = status {
        query = query.eq("status", status.as_str());
    }
    let mut runs: Vec<Run> = store
        .find_nodes(&query)
        .await?
        .iter()
        .filter_map(|n| Run::from_props(&n.id, &n.props))
        .collect();
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
    Ok(runs)
}
