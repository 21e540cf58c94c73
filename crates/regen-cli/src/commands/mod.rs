//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use regen_core::EngineConfig;
use regen_graph::{GraphClient, Neo4jStore, SharedStore};

pub mod dirty;
pub mod enqueue;
pub mod history;
pub mod impact;
pub mod runs;
pub mod schema;
pub mod scope;
pub mod seed;
pub mod status;

/// Impact analysis and selective regeneration for the design knowledge graph
#[derive(Parser)]
#[command(name = "regen")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to ./regen.toml when present)
    #[arg(short, long, global = true, env = "REGEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Graph schema constraints and indexes
    #[command(subcommand)]
    Schema(schema::SchemaCommands),

    /// Show what a change to the given nodes would affect
    Impact(impact::ImpactArgs),

    /// Inspect and edit dirty flags
    #[command(subcommand)]
    Dirty(dirty::DirtyCommands),

    /// Print the phase plan for the current dirty nodes
    Scope,

    /// Load a JSON seed document
    Seed(seed::SeedArgs),

    /// Inspect regeneration runs
    #[command(subcommand)]
    Runs(runs::RunCommands),

    /// Show the change history of a node
    History(history::HistoryArgs),

    /// Queue regeneration jobs for a root node
    Enqueue(enqueue::EnqueueArgs),

    /// Graph counts and dirty totals
    Status,
}

/// Loaded configuration plus a connected graph store.
pub struct Session {
    pub config: EngineConfig,
    pub store: SharedStore,
}

impl Session {
    async fn open(config: EngineConfig) -> Result<Self> {
        let client = GraphClient::connect(&config.graph)
            .await
            .context("Could not connect to the knowledge graph")?;
        let store: SharedStore = Arc::new(Neo4jStore::new(client, config.id_policy));
        Ok(Self { config, store })
    }
}

impl Cli {
    /// Whether the command prints machine-readable output on stdout.
    pub fn json_output(&self) -> bool {
        matches!(&self.command, Commands::Impact(args) if args.json)
    }

    pub async fn execute(self) -> Result<()> {
        let config = EngineConfig::load(self.config.as_deref())
            .context("Failed to load configuration")?;
        let session = Session::open(config).await?;

        match self.command {
            Commands::Schema(cmd) => schema::execute(cmd, &session).await,
            Commands::Impact(args) => impact::execute(args, &session).await,
            Commands::Dirty(cmd) => dirty::execute(cmd, &session).await,
            Commands::Scope => scope::execute(&session).await,
            Commands::Seed(args) => seed::execute(args, &session).await,
            Commands::Runs(cmd) => runs::execute(cmd, &session).await,
            Commands::History(args) => history::execute(args, &session).await,
            Commands::Enqueue(args) => enqueue::execute(args, &session).await,
            Commands::Status => status::execute(&session).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_impact_flags_parse() {
        let cli = Cli::try_parse_from([
            "regen", "impact", "US_001", "Command:CMD_X", "--max-hops", "2", "--mark",
        ])
        .unwrap();
        match cli.command {
            Commands::Impact(args) => {
                assert_eq!(args.ids, ["US_001", "Command:CMD_X"]);
                assert_eq!(args.max_hops, Some(2));
                assert!(args.mark);
            }
            _ => panic!("expected impact"),
        }
    }

    #[test]
    fn test_json_output_only_for_json_impact() {
        let json = Cli::try_parse_from(["regen", "impact", "US_001", "--json"]).unwrap();
        assert!(json.json_output());
        let table = Cli::try_parse_from(["regen", "impact", "US_001"]).unwrap();
        assert!(!table.json_output());
        let status = Cli::try_parse_from(["regen", "status"]).unwrap();
        assert!(!status.json_output());
    }
}
