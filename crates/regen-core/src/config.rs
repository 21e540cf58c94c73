//! Engine configuration.
//!
//! Loaded once from an optional TOML file plus environment overrides, then
//! passed by reference. Nothing here is mutated after load.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RegenError, RegenResult};

/// How node identifiers are scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdPolicy {
    /// An identifier names at most one node across every kind.
    #[default]
    Global,
    /// Identifiers are unique per kind only.
    LabelScoped,
}

impl IdPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "global" => Some(Self::Global),
            "label_scoped" | "label" => Some(Self::LabelScoped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::LabelScoped => "label_scoped",
        }
    }
}

/// When dirty flags are removed after regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearPolicy {
    /// Cleared in the same bundle that upserts generation output.
    #[default]
    OnUpsert,
    /// Output is stamped, flags stay until an explicit clear.
    ManualApproval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactConfig {
    pub max_hops: u32,
    pub traversal_timeout_ms: u64,
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self {
            max_hops: 3,
            traversal_timeout_ms: 5_000,
        }
    }
}

impl ImpactConfig {
    pub fn traversal_timeout(&self) -> Duration {
        Duration::from_millis(self.traversal_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub run_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            run_timeout_ms: 30_000,
            max_retries: 3,
            backoff_base_ms: 50,
            backoff_max_ms: 2_000,
        }
    }
}

impl BatchConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }
}

/// Neo4j connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "neo4j".to_string(),
            database: "neo4j".to_string(),
            max_connections: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub redis_url: String,
    pub key_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "regen".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub id_policy: IdPolicy,
    pub clear_policy: ClearPolicy,
    pub impact: ImpactConfig,
    pub batch: BatchConfig,
    pub graph: GraphConfig,
    pub queue: QueueConfig,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> RegenResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given (or `regen.toml` if present), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> RegenResult<Self> {
        let mut config = match path {
            Some(p) => Self::from_toml_str(&std::fs::read_to_string(p)?)?,
            None if Path::new("regen.toml").exists() => {
                Self::from_toml_str(&std::fs::read_to_string("regen.toml")?)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        debug!(
            id_policy = config.id_policy.as_str(),
            max_hops = config.impact.max_hops,
            graph = %config.graph.uri,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> RegenResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uri) = lookup("NEO4J_URI") {
            self.graph.uri = uri;
        }
        if let Some(user) = lookup("NEO4J_USER") {
            self.graph.user = user;
        }
        if let Some(password) = lookup("NEO4J_PASSWORD") {
            self.graph.password = password;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.queue.redis_url = url;
        }
        if let Some(policy) = lookup("REGEN_ID_POLICY") {
            self.id_policy = IdPolicy::from_str(&policy).ok_or_else(|| {
                RegenError::Config(format!("REGEN_ID_POLICY has unknown value '{policy}'"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> RegenResult<()> {
        if self.impact.traversal_timeout_ms == 0 {
            return Err(RegenError::Config(
                "impact.traversal_timeout_ms must be positive".to_string(),
            ));
        }
        if self.batch.run_timeout_ms == 0 {
            return Err(RegenError::Config("batch.run_timeout_ms must be positive".to_string()));
        }
        if self.batch.backoff_base_ms > self.batch.backoff_max_ms {
            return Err(RegenError::Config(
                "batch.backoff_base_ms exceeds batch.backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}
