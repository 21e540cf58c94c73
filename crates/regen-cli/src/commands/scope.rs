//! Regeneration scope.

use anyhow::Result;

use regen_graph::{dirty, plan};

use super::Session;
use crate::output;

pub async fn execute(session: &Session) -> Result<()> {
    let set = dirty::list(session.store.as_ref(), None).await?;
    output::print_plan(&plan(&set));
    Ok(())
}
