//! Regen Core Library
//!
//! Node model, payload schemas, fingerprints, errors and configuration for
//! the selective regeneration engine.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod job;
pub mod model;

pub use config::{ClearPolicy, EngineConfig, IdPolicy};
pub use error::{RegenError, RegenResult};
pub use model::dirty::{DirtyEntry, DirtySet, Phase};
pub use model::payload::NodePayload;
pub use model::{Direction, NodeKind, NodeRef, PropValue, Props, RelType};
