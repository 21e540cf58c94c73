//! Centralized error types for the regeneration engine.

use thiserror::Error;

/// Main error type for engine operations.
#[derive(Error, Debug)]
pub enum RegenError {
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Identifier '{id}' is already used by a {existing} node (requested {requested})")]
    DuplicateIdentifierConflict {
        id: String,
        existing: String,
        requested: String,
    },

    #[error("Dangling reference: {0}")]
    DanglingReference(String),

    #[error("Impact traversal exceeded its budget of {budget_ms}ms")]
    ImpactTraversalTimeout { budget_ms: u64 },

    #[error("Transaction aborted: {0}")]
    TransactionAbort(String),

    #[error("Invalid phase sequence for run '{run_id}': {detail}")]
    InvalidPhaseSequence { run_id: String, detail: String },

    #[error("Concurrent modification of {node}: expected version {expected}, found {found}")]
    ConcurrentModificationConflict {
        node: String,
        expected: String,
        found: String,
    },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Run '{0}' was cancelled")]
    RunCancelled(String),

    #[error("Run '{run_id}' exceeded its budget of {budget_ms}ms")]
    RunTimeout { run_id: String, budget_ms: u64 },

    #[error("Graph store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Graph store error: {0}")]
    Store(String),

    #[error("Generation collaborator failed: {0}")]
    Generation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for engine operations.
pub type RegenResult<T> = Result<T, RegenError>;

impl RegenError {
    /// Create an invalid payload error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Create a dangling reference error.
    pub fn dangling(msg: impl Into<String>) -> Self {
        Self::DanglingReference(msg.into())
    }

    /// Create an invalid phase sequence error.
    pub fn phase(run_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidPhaseSequence {
            run_id: run_id.into(),
            detail: detail.into(),
        }
    }

    /// Only store connectivity failures are retried, and only by the batch coordinator.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Stable short name recorded on failed runs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SchemaViolation(_) => "SchemaViolation",
            Self::DuplicateIdentifierConflict { .. } => "DuplicateIdentifierConflict",
            Self::DanglingReference(_) => "DanglingReference",
            Self::ImpactTraversalTimeout { .. } => "ImpactTraversalTimeout",
            Self::TransactionAbort(_) => "TransactionAbort",
            Self::InvalidPhaseSequence { .. } => "InvalidPhaseSequence",
            Self::ConcurrentModificationConflict { .. } => "ConcurrentModificationConflict",
            Self::InvalidPayload(_) => "InvalidPayload",
            Self::NotFound(_) => "NotFound",
            Self::RunCancelled(_) => "RunCancelled",
            Self::RunTimeout { .. } => "RunTimeout",
            Self::StoreUnavailable(_) => "StoreUnavailable",
            Self::Store(_) => "Store",
            Self::Generation(_) => "Generation",
            Self::Config(_) => "Config",
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
            Self::Toml(_) => "Toml",
        }
    }
}
