//! Node-type signatures: `<node_name>::<normalized input descriptor>`.
//!
//! The descriptor is the node's declared `required` and `optional` inputs,
//! reduced to a sorted `name:TYPE` list and hashed so that declaration order
//! does not matter. Unknown, empty or unreadable descriptors collapse to the
//! wildcard `_`.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::{SIGNATURE_SEPARATOR, WILDCARD_SIGNATURE};

/// Hex characters of the digest kept in a signature.
pub const SIGNATURE_HEX_LEN: usize = 16;

/// Type label used for inputs declared as a list of choices.
pub const COMBO_TYPE: &str = "COMBO";

const INPUT_SECTIONS: &[&str] = &["required", "optional"];

fn input_type_label(spec: &Value) -> String {
    match spec {
        Value::String(s) => s.clone(),
        Value::Array(items) => match items.first() {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(_)) => COMBO_TYPE.to_string(),
            Some(other) => other.to_string(),
            None => "*".to_string(),
        },
        Value::Null => "*".to_string(),
        other => other.to_string(),
    }
}

/// Sorted `name:TYPE` entries, or `None` when nothing usable is declared.
pub fn input_entries(input_types: &Value) -> Option<Vec<String>> {
    let parsed;
    let descriptor = match input_types {
        Value::String(raw) => {
            let raw = raw.trim();
            if raw.is_empty() {
                return None;
            }
            parsed = serde_json::from_str::<Value>(raw).ok()?;
            &parsed
        }
        other => other,
    };
    let sections = descriptor.as_object()?;

    let mut entries: Vec<String> = INPUT_SECTIONS
        .iter()
        .filter_map(|section| sections.get(*section).and_then(Value::as_object))
        .flat_map(|inputs| {
            inputs
                .iter()
                .map(|(name, spec)| format!("{name}:{}", input_type_label(spec)))
        })
        .collect();

    if entries.is_empty() {
        return None;
    }
    entries.sort();
    Some(entries)
}

/// Normalized, order-independent descriptor for `input_types`.
pub fn normalize_input_signature(input_types: &Value) -> String {
    match input_entries(input_types) {
        Some(entries) => {
            let digest = Sha256::digest(entries.join(",").as_bytes());
            let hex = format!("{digest:x}");
            hex[..SIGNATURE_HEX_LEN].to_string()
        }
        None => WILDCARD_SIGNATURE.to_string(),
    }
}

pub fn node_key(node_name: &str, input_types: &Value) -> String {
    format!(
        "{node_name}{SIGNATURE_SEPARATOR}{}",
        normalize_input_signature(input_types)
    )
}

pub fn wildcard_key(node_name: &str) -> String {
    format!("{node_name}{SIGNATURE_SEPARATOR}{WILDCARD_SIGNATURE}")
}

/// Node name part of a signature key.
pub fn key_node_name(key: &str) -> &str {
    key.rsplit_once(SIGNATURE_SEPARATOR)
        .map_or(key, |(name, _)| name)
}
