//! Seed loading.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tracing::info;

use regen_graph::{load_seed, BatchCoordinator, SeedDocument};

use super::Session;

#[derive(Args)]
pub struct SeedArgs {
    /// JSON document with `nodes`, `links` and `traces`
    pub file: PathBuf,
}

pub async fn execute(args: SeedArgs, session: &Session) -> Result<()> {
    let document = SeedDocument::from_path(&args.file)
        .with_context(|| format!("Failed to read seed {}", args.file.display()))?;
    let coordinator = BatchCoordinator::new(session.store.clone(), session.config.clone());
    let outcome = load_seed(&coordinator, document).await?;
    info!(file = %args.file.display(), run_id = %outcome.run_id, "Seed applied from CLI");

    println!("{} seed loaded ({})", "✓".green(), outcome.run_id.dimmed());
    println!("  Nodes written:   {}", outcome.nodes_written.len());
    println!("  Changes recorded: {}", outcome.changes.len());
    Ok(())
}
