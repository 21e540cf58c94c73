//! Dirty flag commands.

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use tracing::info;

use regen_core::model::run::RunPhase;
use regen_core::{NodeKind, NodeRef};
use regen_graph::{dirty, BatchCoordinator, BundleOp};

use super::Session;
use crate::output;

#[derive(Subcommand)]
pub enum DirtyCommands {
    /// List dirty nodes
    List {
        /// Only this node kind
        #[arg(long)]
        kind: Option<String>,
    },

    /// Flag nodes for regeneration
    Mark {
        kind: String,
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(long)]
        reason: String,
    },

    /// Remove dirty flags, subject to the configured clear policy
    Clear {
        kind: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Report nodes with a partial dirty triple
    Audit,
}

fn refs(kind: &str, ids: Vec<String>) -> Result<Vec<NodeRef>> {
    let kind: NodeKind = kind.parse()?;
    Ok(ids.into_iter().map(|id| NodeRef::new(kind, id)).collect())
}

pub async fn execute(cmd: DirtyCommands, session: &Session) -> Result<()> {
    let store = session.store.as_ref();
    let coordinator = BatchCoordinator::new(session.store.clone(), session.config.clone());

    match cmd {
        DirtyCommands::List { kind } => {
            let kind = kind.map(|k| k.parse::<NodeKind>()).transpose()?;
            output::print_dirty(&dirty::list(store, kind).await?);
        }
        DirtyCommands::Mark { kind, ids, reason } => {
            let nodes = refs(&kind, ids)?;
            let outcome = coordinator
                .execute(RunPhase::Admin, "regen-cli", vec![BundleOp::MarkDirty { nodes, reason }])
                .await?;
            info!(
                run_id = %outcome.run_id,
                kind = %kind,
                marked = outcome.marked.len(),
                "Dirty flags set from CLI"
            );
            println!("{} marked {} node(s)", "✓".green(), outcome.marked.len());
        }
        DirtyCommands::Clear { kind, ids } => {
            let nodes = refs(&kind, ids)?;
            let outcome = coordinator
                .execute(RunPhase::Admin, "regen-cli", vec![BundleOp::ClearDirty { nodes }])
                .await?;
            info!(
                run_id = %outcome.run_id,
                kind = %kind,
                cleared = outcome.cleared.len(),
                refused = outcome.refused.len(),
                "Dirty flags cleared from CLI"
            );
            println!("{} cleared {} node(s)", "✓".green(), outcome.cleared.len());
            for node in &outcome.refused {
                println!(
                    "  {} {} kept: not regenerated since it was marked",
                    "!".yellow(),
                    node
                );
            }
        }
        DirtyCommands::Audit => output::print_partial(&dirty::audit(store).await?),
    }
    Ok(())
}
