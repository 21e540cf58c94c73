//! Change history.

use anyhow::Result;
use clap::Args;

use regen_graph::change::history;
use regen_graph::resolve_roots;

use super::Session;
use crate::output;

#[derive(Args)]
pub struct HistoryArgs {
    /// Node as `Kind:id` or a bare id
    pub id: String,

    /// Most recent N records
    #[arg(long, default_value = "20")]
    pub limit: usize,
}

pub async fn execute(args: HistoryArgs, session: &Session) -> Result<()> {
    let store = session.store.as_ref();
    let node = resolve_roots(store, std::slice::from_ref(&args.id))
        .await?
        .remove(0);
    println!("Changes to {}", node);
    output::print_changes(&history(store, &node, Some(args.limit)).await?);
    Ok(())
}
