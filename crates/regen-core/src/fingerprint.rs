//! Content fingerprints for change detection.
//!
//! A fingerprint is the SHA-256 of a canonical JSON rendering of a node's
//! semantic attributes. Keys are ordered, list values are treated as
//! unordered sets, and bookkeeping attributes never participate, so the
//! result depends only on payload content and is stable across restarts.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::model::dirty::{DIRTY, DIRTY_AT, DIRTY_REASON, REGENERATED_AT, REGENERATED_BY};
use crate::model::{PropValue, Props, CREATED_AT, FINGERPRINT, UPDATED_AT};

/// Attributes excluded from fingerprinting.
const NON_SEMANTIC: &[&str] = &[
    FINGERPRINT,
    CREATED_AT,
    UPDATED_AT,
    DIRTY,
    DIRTY_REASON,
    DIRTY_AT,
    REGENERATED_AT,
    REGENERATED_BY,
];

/// Compute the fingerprint of a set of attributes.
pub fn fingerprint(props: &Props) -> String {
    let mut canonical = Map::new();
    for (key, value) in props {
        if NON_SEMANTIC.contains(&key.as_str()) {
            continue;
        }
        canonical.insert(key.clone(), canonical_value(value));
    }

    // serde_json::Map without `preserve_order` is a BTreeMap, so keys serialize sorted.
    let rendered = Value::Object(canonical).to_string();
    hex::encode(Sha256::digest(rendered.as_bytes()))
}

fn canonical_value(value: &PropValue) -> Value {
    match value {
        PropValue::Bool(b) => Value::Bool(*b),
        PropValue::Int(i) => Value::from(*i),
        PropValue::Float(f) => Value::from(*f),
        PropValue::Time(t) => Value::String(t.to_rfc3339()),
        PropValue::Str(s) => Value::String(s.clone()),
        PropValue::List(items) => {
            let mut sorted = items.clone();
            sorted.sort();
            sorted.dedup();
            Value::Array(sorted.into_iter().map(Value::String).collect())
        }
    }
}
