//! # Regen Graph
//!
//! Knowledge-graph storage and the selective regeneration engine.
//!
//! Provides the graph store contract with in-memory and Neo4j
//! implementations, change detection, impact analysis, dirty tracking,
//! and run-scoped batch application of generation output.

pub mod batch;
pub mod change;
pub mod client;
pub mod dirty;
pub mod generation;
pub mod impact;
pub mod pipeline;
pub mod run;
pub mod schema;
pub mod scope;
pub mod seed;
pub mod store;
pub mod trace;
pub mod upsert;

pub use batch::{BatchCoordinator, BundleOp, BundleOutcome, PreparedBundle};
pub use client::GraphClient;
pub use generation::{GenerationContext, GenerationOutput, Generator};
pub use impact::{find_impact, resolve_roots, ImpactOptions, ImpactReport};
pub use pipeline::{ChangeOutcome, RegenerationPipeline, RegenerationReport};
pub use schema::{initialize_schema, verify_schema, SchemaReport};
pub use scope::{plan, scope, RegenerationPlan};
pub use seed::{load_seed, SeedDocument};
pub use store::{GraphStore, MemoryStore, Neo4jStore, SharedStore, StoredNode, UnitOfWork};
pub use upsert::{upsert, UpsertOptions, UpsertOutcome};
