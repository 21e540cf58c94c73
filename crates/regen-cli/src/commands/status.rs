//! Graph status.

use anyhow::Result;
use colored::Colorize;

use regen_graph::{dirty, GraphStore};

use super::Session;
use crate::output;

pub async fn execute(session: &Session) -> Result<()> {
    let store = session.store.as_ref();
    let counts = store.counts().await?;
    let dirty_nodes = dirty::list(store, None).await?;

    println!("{}", "Knowledge Graph Status".bold());
    output::rule(40);
    println!("  Nodes:         {}", counts.nodes.to_string().cyan());
    println!("  Relationships: {}", counts.relationships.to_string().cyan());
    for (kind, n) in &counts.by_kind {
        println!("    {:<20} {}", kind.label(), n);
    }
    let dirty_count = dirty_nodes.len().to_string();
    if dirty_nodes.is_empty() {
        println!("  Dirty:         {}", dirty_count.green());
    } else {
        println!("  Dirty:         {}", dirty_count.yellow());
    }
    println!("  Id policy:     {}", store.id_policy().as_str());
    output::rule(40);
    Ok(())
}
