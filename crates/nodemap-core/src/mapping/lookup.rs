//! Consumer-side lookup against a mapping file.

use serde_json::Value;

use crate::mapping::signature::{node_key, wildcard_key};
use crate::models::{MappingEntry, MappingFile};

/// Ranked entries found for a node, and which key produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<'a> {
    pub key: String,
    pub exact: bool,
    pub entries: &'a [MappingEntry],
}

impl MappingFile {
    /// Entries for the exact signature of `input_types`, falling back to the
    /// wildcard signature of `node_name`.
    pub fn resolve(&self, node_name: &str, input_types: &Value) -> Option<Resolution<'_>> {
        let exact = node_key(node_name, input_types);
        if let Some(entries) = self.mappings.get(&exact) {
            return Some(Resolution {
                key: exact,
                exact: true,
                entries,
            });
        }
        let wildcard = wildcard_key(node_name);
        self.mappings.get(&wildcard).map(|entries| Resolution {
            key: wildcard,
            exact: false,
            entries,
        })
    }
}
