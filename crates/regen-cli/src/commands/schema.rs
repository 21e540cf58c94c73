//! Schema commands.

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;
use tracing::info;

use regen_graph::{initialize_schema, verify_schema};

use super::Session;

#[derive(Subcommand)]
pub enum SchemaCommands {
    /// Install uniqueness constraints and indexes (idempotent)
    Init,

    /// Check that every expected constraint and index is present
    Verify,
}

pub async fn execute(cmd: SchemaCommands, session: &Session) -> Result<()> {
    let store = session.store.as_ref();
    match cmd {
        SchemaCommands::Init => {
            let installed = initialize_schema(store).await?;
            info!(installed, "Schema initialized from CLI");
            println!("{} {} schema item(s) in place", "✓".green(), installed);
            Ok(())
        }
        SchemaCommands::Verify => {
            let report = verify_schema(store).await?;
            for pair in &report.missing_constraints {
                println!("  {} missing constraint {}", "✗".red(), pair);
            }
            for pair in &report.missing_indexes {
                println!("  {} missing index {}", "✗".red(), pair);
            }
            for pair in &report.extra_constraints {
                println!("  {} unexpected constraint {}", "?".yellow(), pair);
            }
            if !report.is_healthy() {
                bail!("schema is incomplete; run 'regen schema init'");
            }
            println!("{} schema verified", "✓".green());
            Ok(())
        }
    }
}
