//! Schema initialization and structural verification.
//!
//! Verification compares `(label, property)` pairs against the store's
//! catalog and ignores constraint names, so constraints created by hand
//! under other names still count.

use serde::Serialize;
use tracing::{info, warn};

use regen_core::model::NodeKind;
use regen_core::{RegenError, RegenResult};

use crate::store::{GraphStore, SchemaItem};

/// Secondary indexes recommended for lookups by name and history scans.
const INDEXES: &[(NodeKind, &str)] = &[
    (NodeKind::BoundedContext, "name"),
    (NodeKind::Aggregate, "name"),
    (NodeKind::Command, "name"),
    (NodeKind::Event, "name"),
    (NodeKind::Epic, "title"),
    (NodeKind::UserStory, "title"),
    (NodeKind::Change, "node_id"),
    (NodeKind::Run, "status"),
];

/// A label/property pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SchemaPair {
    pub label: String,
    pub property: String,
}

impl std::fmt::Display for SchemaPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.label, self.property)
    }
}

/// Outcome of [`verify_schema`]; healthy when nothing is missing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaReport {
    pub missing_constraints: Vec<SchemaPair>,
    pub missing_indexes: Vec<SchemaPair>,
    /// Uniqueness constraints on engine labels that are not part of the expected set.
    pub extra_constraints: Vec<SchemaPair>,
}

impl SchemaReport {
    pub fn is_healthy(&self) -> bool {
        self.missing_constraints.is_empty() && self.missing_indexes.is_empty()
    }
}

/// Every schema element the engine expects.
pub fn expected_items() -> Vec<SchemaItem> {
    let constraints = NodeKind::ALL.iter().map(|kind| SchemaItem::Unique {
        kind: *kind,
        property: "id".to_string(),
    });
    let indexes = INDEXES.iter().map(|(kind, property)| SchemaItem::Index {
        kind: *kind,
        property: property.to_string(),
    });
    constraints.chain(indexes).collect()
}

fn require_constraint_support(store: &dyn GraphStore) -> RegenResult<()> {
    if !store.capabilities().unique_constraints {
        return Err(RegenError::SchemaViolation(
            "store cannot express per-label uniqueness constraints".to_string(),
        ));
    }
    Ok(())
}

/// Install constraints and indexes. Safe to run repeatedly.
pub async fn initialize_schema(store: &dyn GraphStore) -> RegenResult<usize> {
    require_constraint_support(store)?;
    info!("Initializing graph schema...");

    let items = expected_items();
    for item in &items {
        if matches!(item, SchemaItem::Index { .. }) && !store.capabilities().indexes {
            warn!(?item, "Store has no secondary indexes, skipping");
            continue;
        }
        store.install(item).await?;
    }

    info!("Graph schema initialized ({} items)", items.len());
    Ok(items.len())
}

/// Compare the store's catalog against [`expected_items`].
pub async fn verify_schema(store: &dyn GraphStore) -> RegenResult<SchemaReport> {
    require_constraint_support(store)?;
    let constraints = store.constraints().await?;
    let indexes = store.indexes().await?;

    let mut report = SchemaReport::default();
    for item in expected_items() {
        match item {
            SchemaItem::Unique { kind, property } => {
                if !constraints
                    .iter()
                    .any(|c| c.enforces_unique(kind.label(), &property))
                {
                    report.missing_constraints.push(SchemaPair {
                        label: kind.label().to_string(),
                        property,
                    });
                }
            }
            SchemaItem::Index { kind, property } => {
                let indexed = indexes
                    .iter()
                    .any(|i| i.label == kind.label() && i.properties == [property.clone()]);
                if !indexed {
                    report.missing_indexes.push(SchemaPair {
                        label: kind.label().to_string(),
                        property,
                    });
                }
            }
        }
    }

    for constraint in &constraints {
        let ours = NodeKind::ALL.iter().any(|k| k.label() == constraint.label);
        let expected = constraint.properties.len() == 1 && constraint.properties[0] == "id";
        if ours && !expected {
            report.extra_constraints.push(SchemaPair {
                label: constraint.label.clone(),
                property: constraint.properties.join(","),
            });
        }
    }

    if !report.is_healthy() {
        warn!(
            missing_constraints = report.missing_constraints.len(),
            missing_indexes = report.missing_indexes.len(),
            "Graph schema is incomplete"
        );
    }
    Ok(report)
}
