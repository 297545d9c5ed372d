//! Integrity checks for the cache and mapping files.
//!
//! Checks run on raw JSON so structural damage is reported instead of
//! failing deserialization. Errors fail validation; warnings do not.

use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::models::parse_timestamp;

/// Orphaned entries listed individually before the rest are summarized.
const ORPHANS_SHOWN: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn log(&self) {
        if self.is_ok() {
            info!("validation passed");
        } else {
            error!("validation failed with {} error(s)", self.errors.len());
        }
        for e in &self.errors {
            error!("  {e}");
        }
        for w in &self.warnings {
            warn!("  {w}");
        }
    }
}

fn declared_count(doc: &Value, field: &str) -> Option<u64> {
    doc.get(field).and_then(Value::as_u64)
}

fn check_declared(
    report: &mut ValidationReport,
    what: &str,
    declared: Option<u64>,
    actual: usize,
) {
    if let Some(declared) = declared {
        if declared != actual as u64 {
            report.warn(format!(
                "{what} mismatch: declared {declared}, actual {actual}"
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub fn validate_cache(doc: &Value, report: &mut ValidationReport) {
    let Some(object) = doc.as_object() else {
        report.error("cache is not a JSON object");
        return;
    };
    for field in ["cached_at", "node_count", "nodes"] {
        if !object.contains_key(field) {
            report.error(format!("cache missing required field: {field}"));
        }
    }
    let Some(nodes) = object.get("nodes").map(Value::as_array) else {
        return;
    };
    let Some(nodes) = nodes else {
        report.error("cache 'nodes' field must be a list");
        return;
    };

    let mut versions = 0usize;
    let mut metadata = 0usize;
    let mut with_versions = 0usize;
    let mut seen_ids = HashSet::new();

    for (i, node) in nodes.iter().enumerate() {
        let Some(node) = node.as_object() else {
            report.error(format!("node {i} is not an object"));
            continue;
        };
        for field in ["id", "name"] {
            if !node.contains_key(field) {
                report.error(format!("node {i} missing required field: {field}"));
            }
        }
        let label = node
            .get("id")
            .and_then(Value::as_str)
            .map_or_else(|| i.to_string(), str::to_string);
        if node.get("id").and_then(Value::as_str).is_some() && !seen_ids.insert(label.clone()) {
            report.error(format!("duplicate node id: {label}"));
        }

        let Some(list) = node.get("versions_list").and_then(Value::as_array) else {
            continue;
        };
        if !list.is_empty() {
            with_versions += 1;
        }
        versions += list.len();
        for (j, version) in list.iter().enumerate() {
            let Some(version) = version.as_object() else {
                report.error(format!("node {label} version {j} is not an object"));
                continue;
            };
            match version.get("version").and_then(Value::as_str) {
                Some(v) if !v.is_empty() => {}
                _ => report.error(format!("node {label} version {j} missing 'version' field")),
            }
            metadata += version
                .get("comfy_nodes")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
        }
    }

    check_declared(report, "node count", declared_count(doc, "node_count"), nodes.len());
    check_declared(
        report,
        "version count",
        declared_count(doc, "versions_processed"),
        versions,
    );
    check_declared(
        report,
        "metadata entry count",
        declared_count(doc, "metadata_entries"),
        metadata,
    );
    info!(
        "cache: {} nodes, {with_versions} with versions, {versions} versions, {metadata} metadata entries",
        nodes.len()
    );
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

pub fn validate_mapping(doc: &Value, report: &mut ValidationReport) {
    let Some(object) = doc.as_object() else {
        report.error("mapping is not a JSON object");
        return;
    };
    for field in ["version", "stats", "mappings", "packages"] {
        if !object.contains_key(field) {
            report.error(format!("mapping missing required field: {field}"));
        }
    }

    let empty = serde_json::Map::new();
    let mappings = match object.get("mappings") {
        None => &empty,
        Some(Value::Object(m)) => m,
        Some(_) => {
            report.error("mapping 'mappings' field must be an object");
            return;
        }
    };
    let packages = match object.get("packages") {
        None => &empty,
        Some(Value::Object(p)) => p,
        Some(_) => {
            report.error("mapping 'packages' field must be an object");
            return;
        }
    };

    let null = Value::Null;
    let stats = object.get("stats").unwrap_or(&null);
    check_declared(report, "package count", declared_count(stats, "packages"), packages.len());
    check_declared(
        report,
        "signature count",
        declared_count(stats, "signatures"),
        mappings.len(),
    );

    let mut orphans = 0usize;
    for (key, entries) in mappings {
        let Some(entries) = entries.as_array() else {
            report.error(format!("signature {key} is not a list of entries"));
            continue;
        };
        let mut ranks = Vec::with_capacity(entries.len());
        let mut ids = HashSet::new();
        for entry in entries {
            let Some(package_id) = entry.get("package_id").and_then(Value::as_str) else {
                report.error(format!("signature {key} has an entry without 'package_id'"));
                continue;
            };
            if !ids.insert(package_id) {
                report.error(format!("signature {key} lists {package_id} twice"));
            }
            if !packages.contains_key(package_id) {
                orphans += 1;
                if orphans <= ORPHANS_SHOWN {
                    report.warn(format!("signature {key} references missing package {package_id}"));
                }
            }
            match entry.get("source") {
                None => {}
                Some(Value::String(s)) if s == "manager" => {}
                Some(other) => report.error(format!(
                    "signature {key} entry {package_id} has unexpected source {other}"
                )),
            }
            match entry.get("rank").and_then(Value::as_u64) {
                Some(rank) => ranks.push(rank),
                None => report.error(format!("signature {key} entry {package_id} has no rank")),
            }
        }
        ranks.sort_unstable();
        let contiguous = ranks.iter().enumerate().all(|(i, r)| *r == i as u64 + 1);
        if !contiguous {
            report.error(format!("signature {key} ranks are not contiguous from 1"));
        }
    }
    if orphans > ORPHANS_SHOWN {
        report.warn(format!("... and {} more orphaned entries", orphans - ORPHANS_SHOWN));
    }

    for (id, package) in packages {
        if !package.is_object() {
            report.error(format!("package {id} is not an object"));
        } else if package.get("display_name").is_none() {
            report.warn(format!("package {id} missing 'display_name'"));
        }
    }

    info!(
        "mapping: {} signatures, {} packages, {orphans} orphaned entries",
        mappings.len(),
        packages.len()
    );
}

// ---------------------------------------------------------------------------
// Cross-file
// ---------------------------------------------------------------------------

/// Package id sets and timestamps of a cache and the mapping built from it.
/// Synthetic packages only exist in the mapping and are left out.
pub fn validate_consistency(cache: &Value, mapping: &Value, report: &mut ValidationReport) {
    let cache_ids: HashSet<&str> = cache
        .get("nodes")
        .and_then(Value::as_array)
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(|n| n.get("id").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    let mapping_ids: HashSet<&str> = mapping
        .get("packages")
        .and_then(Value::as_object)
        .map(|packages| {
            packages
                .iter()
                .filter(|(_, p)| !p.get("synthetic").and_then(Value::as_bool).unwrap_or(false))
                .map(|(id, _)| id.as_str())
                .collect()
        })
        .unwrap_or_default();

    let only_cache = cache_ids.difference(&mapping_ids).count();
    let only_mapping = mapping_ids.difference(&cache_ids).count();
    if only_cache > 0 {
        report.warn(format!("{only_cache} packages in cache but not in mapping"));
    }
    if only_mapping > 0 {
        report.warn(format!("{only_mapping} packages in mapping but not in cache"));
    }

    let cached_at = cache.get("cached_at").and_then(Value::as_str).unwrap_or("");
    let generated_at = mapping
        .get("generated_at")
        .and_then(Value::as_str)
        .unwrap_or("");
    if !cached_at.is_empty() && !generated_at.is_empty() {
        match (parse_timestamp(cached_at), parse_timestamp(generated_at)) {
            (Some(cached), Some(generated)) if generated < cached => {
                report.warn("mapping is older than cache, consider rebuilding it");
            }
            (Some(_), Some(_)) => {}
            _ => report.warn("could not parse timestamps for the consistency check"),
        }
    }
}

fn load(path: &Path, what: &str, report: &mut ValidationReport) -> Option<Value> {
    if !path.exists() {
        report.error(format!("{what} file not found: {}", path.display()));
        return None;
    }
    let parsed = std::fs::read(path)
        .map_err(|e| e.to_string())
        .and_then(|raw| serde_json::from_slice(&raw).map_err(|e| e.to_string()));
    match parsed {
        Ok(value) => Some(value),
        Err(e) => {
            report.error(format!("{what} file {} is unreadable: {e}", path.display()));
            None
        }
    }
}

/// Validate both files and, when both load, their consistency.
pub fn validate_files(cache_path: &Path, mapping_path: &Path) -> ValidationReport {
    let mut report = ValidationReport::default();
    let cache = load(cache_path, "cache", &mut report);
    let mapping = load(mapping_path, "mapping", &mut report);
    if let Some(cache) = &cache {
        validate_cache(cache, &mut report);
    }
    if let Some(mapping) = &mapping {
        validate_mapping(mapping, &mut report);
    }
    if let (Some(cache), Some(mapping)) = (&cache, &mapping) {
        validate_consistency(cache, mapping, &mut report);
    }
    report
}
