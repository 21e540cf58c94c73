//! Impact query.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use tracing::info;

use regen_core::model::run::RunPhase;
use regen_graph::{find_impact, resolve_roots, BatchCoordinator, BundleOp, ImpactOptions};

use super::Session;
use crate::output;

#[derive(Args)]
pub struct ImpactArgs {
    /// Root nodes as `Kind:id` or a bare id
    #[arg(required = true)]
    pub ids: Vec<String>,

    /// Override the configured hop budget
    #[arg(long)]
    pub max_hops: Option<u32>,

    /// Mark every impacted node dirty
    #[arg(long)]
    pub mark: bool,

    /// Dirty reason used with --mark
    #[arg(long, default_value = "manual impact analysis")]
    pub reason: String,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: ImpactArgs, session: &Session) -> Result<()> {
    let store = session.store.as_ref();
    let roots = resolve_roots(store, &args.ids).await?;

    let mut options = ImpactOptions::from(&session.config.impact);
    if let Some(max_hops) = args.max_hops {
        options = options.with_max_hops(max_hops);
    }
    let report = find_impact(store, &roots, options).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        output::print_impact(&report);
    }

    let targets = report.dirty_targets();
    if args.mark && !targets.is_empty() {
        let coordinator = BatchCoordinator::new(session.store.clone(), session.config.clone());
        let outcome = coordinator
            .execute(
                RunPhase::Admin,
                "regen-cli",
                vec![BundleOp::MarkDirty {
                    nodes: targets,
                    reason: args.reason,
                }],
            )
            .await?;
        info!(
            run_id = %outcome.run_id,
            marked = outcome.marked.len(),
            "Impacted nodes marked from CLI"
        );
        if !args.json {
            println!(
                "{} marked {} node(s) dirty ({})",
                "✓".green(),
                outcome.marked.len(),
                outcome.run_id.dimmed()
            );
        }
    }
    Ok(())
}
