//! Canonicalizer and input hasher.
//!
//! The digest collapses semantically identical generation requests onto one
//! job, so it must not depend on key insertion order, reference list order,
//! or on whether an optional value was absent, `null` or empty.
//!
//! Layout of the hashed text:
//!
//! ```text
//! {canonical prompt_spec}|{canonical references}[|{canonical lore snapshot}]
//! ```
//!
//! The snapshot segment is present only for drift-sensitive hashing.

use serde_json::{Map, Number, Value, json};
use sha2::{Digest, Sha256};

use crate::asset::AssetType;
use crate::id::WorldId;
use crate::lore::{LoreReferences, LoreSnapshot};

/// Everything that identifies a generation request semantically.
#[derive(Debug, Clone, Copy)]
pub struct HashInput<'a> {
    pub world_id: WorldId,
    pub asset_type: AssetType,
    pub provider: &'a str,
    pub model_id: Option<&'a str>,
    pub prompt_spec: &'a Value,
    pub references: &'a LoreReferences,
    /// Included only when drift-sensitive hashing is on.
    pub snapshot: Option<&'a LoreSnapshot>,
}

/// Hex-encoded SHA-256 over the canonical request text.
pub fn compute_input_hash(input: &HashInput<'_>) -> String {
    let mut text = canonical_json(input.prompt_spec);
    text.push('|');
    text.push_str(&canonical_references(input));
    if let Some(snapshot) = input.snapshot {
        text.push('|');
        text.push_str(&canonical_snapshot(snapshot));
    }
    sha256_hex(text.as_bytes())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `true` when the prompt spec carries no content after normalization.
pub fn is_blank(value: &Value) -> bool {
    normalize(value).is_none()
}

/// Sorted-key, whitespace-free rendering of `value` after normalization.
///
/// Object members that are `null`, `""`, `[]` or `{}` are dropped, integral
/// floats are written as integers. Array order is significant and kept.
///
/// `normalize` rebuilds every object with its keys inserted in sorted order,
/// so the compact `Display` form is sorted whether `Map` is a `BTreeMap` or,
/// with serde_json's `preserve_order` feature enabled anywhere in the build,
/// an `IndexMap`.
pub fn canonical_json(value: &Value) -> String {
    normalize(value).unwrap_or(Value::Null).to_string()
}

fn canonical_references(input: &HashInput<'_>) -> String {
    let refs = input.references;
    let model_id = input
        .model_id
        .map(str::trim)
        .filter(|m| !m.is_empty());

    let value = json!({
        "world_id": input.world_id.to_string(),
        "asset_type": input.asset_type.as_str(),
        "provider": input.provider.trim(),
        "model_id": model_id,
        "claim_ids": sorted_strings(refs.claim_ids.iter()),
        "entity_ids": sorted_strings(refs.entity_ids.iter()),
        "source_chunk_ids": sorted_strings(refs.source_chunk_ids.iter()),
        "source_id": refs.source_id.map(|id| id.to_string()),
    });
    canonical_json(&value)
}

fn canonical_snapshot(snapshot: &LoreSnapshot) -> String {
    // `captured_at` and `source_id` are not part of the drift marker set.
    let value = json!({
        "claims": snapshot.claims,
        "entities": snapshot.entities,
        "source_chunks": snapshot.source_chunks,
    });
    canonical_json(&value)
}

fn sorted_strings<T: ToString>(ids: impl Iterator<Item = T>) -> Vec<String> {
    let mut out: Vec<String> = ids.map(|id| id.to_string()).collect();
    out.sort();
    out.dedup();
    out
}

fn normalize(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::Number(n) => Some(Value::Number(normalize_number(n))),
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .map(|item| normalize(item).unwrap_or(Value::Null))
                .collect(),
        )),
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let kept: Map<String, Value> = entries
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k.clone(), v)))
                .collect();
            if kept.is_empty() {
                None
            } else {
                Some(Value::Object(kept))
            }
        }
        other => Some(other.clone()),
    }
}

fn normalize_number(n: &Number) -> Number {
    if n.is_f64() {
        if let Some(f) = n.as_f64() {
            if f.fract() == 0.0 && f.abs() < 9.0e15 {
                return Number::from(f as i64);
            }
        }
    }
    n.clone()
}
