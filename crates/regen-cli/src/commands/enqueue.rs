//! Job enqueueing.

use anyhow::{anyhow, Context, Result};
use clap::Args;
use colored::Colorize;
use tracing::info;

use regen_core::job::{JobMode, JobQueue};
use regen_graph::{resolve_roots, RegenerationPipeline};
use regen_queue::{init_pool, RedisJobQueue};

use super::Session;

#[derive(Args)]
pub struct EnqueueArgs {
    /// Root node as `Kind:id` or a bare id
    pub root_id: String,

    /// Project the jobs are queued under
    #[arg(long)]
    pub project: String,

    /// dirty or full
    #[arg(long, default_value = "dirty")]
    pub mode: String,
}

pub async fn execute(args: EnqueueArgs, session: &Session) -> Result<()> {
    let mode = JobMode::from_str(&args.mode)
        .ok_or_else(|| anyhow!("unknown mode '{}', expected dirty or full", args.mode))?;
    let root = resolve_roots(session.store.as_ref(), std::slice::from_ref(&args.root_id))
        .await?
        .remove(0);

    let pool = init_pool(&session.config.queue.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", session.config.queue.redis_url))?;
    let queue = RedisJobQueue::new(pool, session.config.queue.key_prefix.clone());

    let pipeline = RegenerationPipeline::new(session.store.clone(), session.config.clone());
    let jobs = pipeline.enqueue(&queue, &args.project, &root, mode).await?;
    info!(
        project = %args.project,
        root = %root,
        jobs = jobs.len(),
        "Regeneration enqueued from CLI"
    );

    if jobs.is_empty() {
        println!("{}", "Nothing to regenerate.".dimmed());
        return Ok(());
    }
    for job in &jobs {
        println!(
            "{} {} {}",
            "queued".green(),
            job.phase.as_str().bold(),
            job.run_id.dimmed()
        );
    }
    println!(
        "{} job(s) waiting for {}",
        queue.pending(&args.project).await?,
        args.project.cyan()
    );
    Ok(())
}
