//! Run inspection.

use anyhow::{anyhow, Result};
use clap::Subcommand;

use regen_core::model::run::RunStatus;
use regen_graph::run;

use super::Session;
use crate::output;

#[derive(Subcommand)]
pub enum RunCommands {
    /// Show one run and the nodes it touched
    Show { run_id: String },

    /// List runs, newest first
    List {
        /// queued, running, completed or failed
        #[arg(long)]
        status: Option<String>,
    },
}

pub async fn execute(cmd: RunCommands, session: &Session) -> Result<()> {
    let store = session.store.as_ref();
    match cmd {
        RunCommands::Show { run_id } => {
            let (found, _) = run::load(store, &run_id).await?;
            let touched: Vec<String> = run::touched(store, &run_id)
                .await?
                .iter()
                .map(ToString::to_string)
                .collect();
            output::print_run(&found, &touched);
        }
        RunCommands::List { status } => {
            let status = status
                .map(|s| RunStatus::from_str(&s).ok_or_else(|| anyhow!("unknown run status '{s}'")))
                .transpose()?;
            output::print_runs(&run::list(store, status).await?);
        }
    }
    Ok(())
}
