//! Registry cache file: loading with timestamp back-fill, and checkpoint
//! saves with aggregates derived from the live node set.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::{NodemapError, NodemapResult};
use crate::models::{format_timestamp, CachedNode, VersionRecord};
use crate::store::files::write_json_atomic;

/// Aggregates written at the top of the cache file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheTotals {
    pub node_count: usize,
    pub versions_processed: usize,
    pub metadata_entries: usize,
}

impl CacheTotals {
    pub fn of<'a>(nodes: impl IntoIterator<Item = &'a CachedNode>) -> Self {
        let mut totals = Self::default();
        for node in nodes {
            totals.node_count += 1;
            totals.versions_processed += node.versions_list.len();
            totals.metadata_entries += node
                .versions_list
                .iter()
                .map(VersionRecord::metadata_len)
                .sum::<usize>();
        }
        totals
    }
}

#[derive(Serialize)]
struct CacheDocument<'a> {
    cached_at: String,
    #[serde(flatten)]
    totals: CacheTotals,
    nodes: Vec<&'a CachedNode>,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the node set keyed by id. A missing file is an empty cache;
    /// nodes that do not have the expected shape are logged and skipped.
    pub fn load(&self, now: DateTime<Utc>) -> NodemapResult<IndexMap<String, CachedNode>> {
        if !self.path.exists() {
            debug!("no cache at {}, starting empty", self.path.display());
            return Ok(IndexMap::new());
        }
        let raw = std::fs::read(&self.path)?;
        let doc: Value = serde_json::from_slice(&raw)?;
        let Some(object) = doc.as_object() else {
            return Err(NodemapError::InvalidData(format!(
                "{} is not a JSON object",
                self.path.display()
            )));
        };

        let fallback = object
            .get("cached_at")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format_timestamp(now));

        let entries = object
            .get("nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut nodes = IndexMap::with_capacity(entries.len());
        let mut skipped = 0usize;
        for entry in entries {
            match serde_json::from_value::<CachedNode>(entry) {
                Ok(mut node) if !node.info.id.is_empty() => {
                    backfill_timestamps(&mut node, &fallback);
                    nodes.insert(node.info.id.clone(), node);
                }
                Ok(_) => skipped += 1,
                Err(e) => {
                    debug!("skipping malformed cache node: {e}");
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            warn!(
                "skipped {skipped} malformed node(s) while loading {}",
                self.path.display()
            );
        }
        info!("loaded {} cached nodes from {}", nodes.len(), self.path.display());
        Ok(nodes)
    }

    /// Atomically write the node set, recomputing aggregates first.
    pub fn save<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a CachedNode>,
        now: DateTime<Utc>,
    ) -> NodemapResult<CacheTotals> {
        let nodes: Vec<&CachedNode> = nodes.into_iter().collect();
        let totals = CacheTotals::of(nodes.iter().copied());
        let doc = CacheDocument {
            cached_at: format_timestamp(now),
            totals,
            nodes,
        };
        write_json_atomic(&self.path, &doc)?;
        debug!(
            "cache saved: {} nodes, {} versions",
            totals.node_count, totals.versions_processed
        );
        Ok(totals)
    }
}

fn backfill_timestamps(node: &mut CachedNode, fallback: &str) {
    let first_seen = node
        .first_seen
        .get_or_insert_with(|| fallback.to_string())
        .clone();
    node.last_checked.get_or_insert_with(|| fallback.to_string());
    for version in &mut node.versions_list {
        version.first_seen.get_or_insert_with(|| first_seen.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{parse_timestamp, CacheFile};
    use serde_json::json;

    #[test]
    fn test_missing_file_is_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache.json"));
        assert!(store.load(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_load_backfills_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&json!({
                "cached_at": "2025-01-01T00:00:00",
                "nodes": [
                    {"id": "a", "versions_list": [{"version": "1.0.0"}]},
                    {"id": "b", "first_seen": "2024-05-05T00:00:00Z",
                     "versions_list": [{"version": "2.0.0"}]},
                    {"name": "missing id"},
                    "not a node"
                ]
            }))
            .unwrap(),
        )
        .unwrap();

        let nodes = CacheStore::new(&path).load(Utc::now()).unwrap();
        assert_eq!(nodes.len(), 2);
        let a = &nodes["a"];
        assert_eq!(a.first_seen.as_deref(), Some("2025-01-01T00:00:00"));
        assert_eq!(a.last_checked.as_deref(), Some("2025-01-01T00:00:00"));
        assert_eq!(
            a.versions_list[0].first_seen.as_deref(),
            Some("2025-01-01T00:00:00")
        );
        let b = &nodes["b"];
        assert_eq!(
            b.versions_list[0].first_seen.as_deref(),
            Some("2024-05-05T00:00:00Z")
        );
    }

    #[test]
    fn test_save_recomputes_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache.json"));
        let now = parse_timestamp("2025-03-01T00:00:00Z").unwrap();

        let mut node: CachedNode =
            serde_json::from_value(json!({"id": "a", "versions_list": [
                {"version": "1.0.0", "comfy_nodes": [{"comfy_node_name": "X"}], "metadata_cached": true},
                {"version": "0.1.0"}
            ]}))
            .unwrap();
        node.recount_metadata();
        let totals = store.save([&node], now).unwrap();
        assert_eq!(totals.node_count, 1);
        assert_eq!(totals.versions_processed, 2);
        assert_eq!(totals.metadata_entries, 1);

        let file: CacheFile = crate::store::read_json(store.path()).unwrap();
        assert_eq!(file.node_count, 1);
        assert_eq!(file.metadata_entries, 1);
        assert_eq!(file.nodes[0].metadata_count, 1);
        assert_eq!(file.cached_at, format_timestamp(now));
    }
}
