//! Shared typed models for the registry cache, the node mapping file and the
//! helpers both of them use for timestamps.
//!
//! Registry payloads are loosely typed in practice (nulls where strings are
//! expected, floats where counts are expected), so most fields deserialize
//! leniently and unknown keys are kept in `extra` and written back untouched.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Contract constants
// ---------------------------------------------------------------------------

/// Separator between node name and input signature in a mapping key.
pub const SIGNATURE_SEPARATOR: &str = "::";

/// Input signature used when the declared inputs are unknown.
pub const WILDCARD_SIGNATURE: &str = "_";

// ---------------------------------------------------------------------------
// Lenient deserializers
// ---------------------------------------------------------------------------

pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accept integers, floats, numeric strings and null for a counter field.
pub(crate) fn lenient_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<f64>().map(|f| f.max(0.0) as u64).unwrap_or(0),
        _ => 0,
    })
}

fn is_false(value: &bool) -> bool {
    !*value
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Render a timestamp the way every artifact stores it.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse the timestamp shapes found in registry data and older caches:
/// RFC 3339, naive ISO date-times (read as UTC) and bare dates.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Registry cache
// ---------------------------------------------------------------------------

/// Basic package fields as returned by the registry listing endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub author: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub repository: String,
    #[serde(default, deserialize_with = "lenient_count")]
    pub downloads: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub github_stars: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rating: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub license: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub category: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub icon: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeInfo {
    /// Version string of the registry's `latest_version` object, if any.
    pub fn latest_version_tag(&self) -> Option<&str> {
        self.latest_version
            .as_ref()
            .and_then(|v| v.get("version"))
            .and_then(Value::as_str)
    }

    /// Overwrite every basic field with `newer`, keeping unknown keys that the
    /// newer payload does not mention.
    pub fn absorb(&mut self, newer: NodeInfo) {
        let NodeInfo {
            id,
            name,
            author,
            description,
            repository,
            downloads,
            github_stars,
            rating,
            license,
            category,
            icon,
            tags,
            status,
            created_at,
            latest_version,
            extra,
        } = newer;
        self.id = id;
        self.name = name;
        self.author = author;
        self.description = description;
        self.repository = repository;
        self.downloads = downloads;
        self.github_stars = github_stars;
        self.rating = rating;
        self.license = license;
        self.category = category;
        self.icon = icon;
        self.tags = tags;
        self.status = status;
        self.created_at = created_at;
        self.latest_version = latest_version;
        for (key, value) in extra {
            self.extra.insert(key, value);
        }
    }
}

/// Phase-transition record decided by the basic-info phase and consumed by
/// the versions phase. Stored as a bare boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshState {
    pub needs_version_refresh: bool,
}

impl Default for RefreshState {
    fn default() -> Self {
        Self::pending()
    }
}

impl RefreshState {
    pub const fn pending() -> Self {
        Self {
            needs_version_refresh: true,
        }
    }

    pub const fn settled() -> Self {
        Self {
            needs_version_refresh: false,
        }
    }

    /// Decide whether a node already in the cache needs its version list
    /// re-fetched: the latest version moved, or the last check is missing,
    /// unreadable, or older than `refresh_after`.
    pub fn decide(
        cached_latest: Option<&str>,
        api_latest: Option<&str>,
        last_checked: Option<&str>,
        now: DateTime<Utc>,
        refresh_after: chrono::Duration,
    ) -> Self {
        if cached_latest != api_latest {
            return Self::pending();
        }
        match last_checked.and_then(parse_timestamp) {
            Some(checked) if now - checked <= refresh_after => Self::settled(),
            _ => Self::pending(),
        }
    }
}

/// One `(node name, input descriptor)` pair scraped from a version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    #[serde(default, deserialize_with = "null_as_default")]
    pub comfy_node_name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input_types: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeMetadata {
    pub fn new(name: impl Into<String>, input_types: Value) -> Self {
        Self {
            comfy_node_name: name.into(),
            input_types,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub changelog: String,
    #[serde(rename = "createdAt", default, deserialize_with = "null_as_default")]
    pub created_at: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub deprecated: bool,
    /// Download URL as reported by the versions endpoint.
    #[serde(
        rename = "downloadUrl",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub api_download_url: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub download_url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub dependencies: Vec<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub install_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_os: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_accelerators: Option<Value>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub supported_comfyui_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comfy_nodes: Option<Vec<NodeMetadata>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata_cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VersionRecord {
    pub fn new(version: impl Into<String>, created_at: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            created_at: created_at.into(),
            ..Self::default()
        }
    }

    /// Download URL preferring the install-derived value.
    pub fn effective_download_url(&self) -> &str {
        if self.download_url.is_empty() {
            &self.api_download_url
        } else {
            &self.download_url
        }
    }

    pub fn metadata_len(&self) -> usize {
        self.comfy_nodes.as_ref().map_or(0, Vec::len)
    }
}

/// Stable sort by `createdAt`, newest first. ISO strings order lexically.
pub fn sort_versions_by_date(versions: &mut [VersionRecord]) {
    versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// A registry package together with its cache bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedNode {
    #[serde(flatten)]
    pub info: NodeInfo,
    #[serde(default, deserialize_with = "null_as_default")]
    pub versions_list: Vec<VersionRecord>,
    #[serde(default)]
    pub basic_cached: bool,
    #[serde(default)]
    pub versions_cached: bool,
    #[serde(default)]
    pub metadata_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<String>,
    #[serde(rename = "_needs_version_refresh", default)]
    pub refresh: RefreshState,
}

impl CachedNode {
    /// A node seen for the first time in a listing page.
    pub fn discovered(info: NodeInfo, now: DateTime<Utc>) -> Self {
        let stamp = format_timestamp(now);
        Self {
            info,
            versions_list: Vec::new(),
            basic_cached: true,
            versions_cached: false,
            metadata_count: 0,
            first_seen: Some(stamp.clone()),
            last_checked: Some(stamp),
            refresh: RefreshState::pending(),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn recount_metadata(&mut self) {
        self.metadata_count = self
            .versions_list
            .iter()
            .filter(|v| v.metadata_cached)
            .count();
    }
}

/// Top-level registry cache file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheFile {
    #[serde(default)]
    pub cached_at: String,
    #[serde(default)]
    pub node_count: usize,
    #[serde(default)]
    pub versions_processed: usize,
    #[serde(default)]
    pub metadata_entries: usize,
    #[serde(default)]
    pub nodes: Vec<CachedNode>,
}

impl CacheFile {
    /// Build a cache document whose aggregates are derived from `nodes`.
    pub fn from_nodes(nodes: Vec<CachedNode>, cached_at: DateTime<Utc>) -> Self {
        let mut file = Self {
            cached_at: format_timestamp(cached_at),
            nodes,
            ..Self::default()
        };
        file.recompute_aggregates();
        file
    }

    pub fn recompute_aggregates(&mut self) {
        self.node_count = self.nodes.len();
        self.versions_processed = self.nodes.iter().map(|n| n.versions_list.len()).sum();
        self.metadata_entries = self
            .nodes
            .iter()
            .flat_map(|n| n.versions_list.iter())
            .map(VersionRecord::metadata_len)
            .sum();
    }
}

// ---------------------------------------------------------------------------
// Node mappings
// ---------------------------------------------------------------------------

/// Provenance marker carried only by community-sourced data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntrySource {
    #[serde(rename = "manager")]
    Manager,
}

/// One package able to supply a signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub package_id: String,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub rank: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EntrySource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageVersion {
    pub version: String,
    #[serde(default)]
    pub changelog: String,
    #[serde(default)]
    pub release_date: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub supported_accelerators: Option<Value>,
    #[serde(default)]
    pub supported_comfyui_version: String,
    #[serde(default)]
    pub supported_os: Option<Value>,
}

impl From<&VersionRecord> for PackageVersion {
    fn from(record: &VersionRecord) -> Self {
        Self {
            version: record.version.clone(),
            changelog: record.changelog.clone(),
            release_date: record.created_at.clone(),
            dependencies: record.dependencies.clone(),
            deprecated: record.deprecated,
            download_url: record.effective_download_url().to_string(),
            status: record.status.clone(),
            supported_accelerators: record.supported_accelerators.clone(),
            supported_comfyui_version: record.supported_comfyui_version.clone(),
            supported_os: record.supported_os.clone(),
        }
    }
}

/// Catalog entry for a package, registry-sourced or synthesized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default, deserialize_with = "lenient_count")]
    pub downloads: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub github_stars: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rating: f64,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub versions: IndexMap<String, PackageVersion>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub synthetic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EntrySource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingStats {
    #[serde(default)]
    pub packages: usize,
    #[serde(default)]
    pub signatures: usize,
    #[serde(default)]
    pub total_nodes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub augmented: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub augmentation_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes_from_manager: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_packages: Option<usize>,
}

/// Top-level node mapping file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingFile {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub generated_at: String,
    #[serde(default)]
    pub stats: MappingStats,
    #[serde(default)]
    pub mappings: IndexMap<String, Vec<MappingEntry>>,
    #[serde(default)]
    pub packages: IndexMap<String, PackageRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_round_trips_unknown_fields() {
        let raw = json!({
            "id": "pkg",
            "name": "Pkg",
            "publisher": {"id": "someone"},
            "downloads": 12.0,
            "github_stars": null,
            "latest_version": {"version": "1.2.0"},
            "versions_list": [{"version": "1.2.0", "createdAt": "2025-01-01T00:00:00Z", "node_id": "pkg"}],
            "basic_cached": true,
        });
        let node: CachedNode = serde_json::from_value(raw).unwrap();
        assert_eq!(node.info.downloads, 12);
        assert_eq!(node.info.github_stars, 0);
        assert_eq!(node.info.latest_version_tag(), Some("1.2.0"));
        assert!(node.info.extra.contains_key("publisher"));
        assert!(!node.info.extra.contains_key("versions_list"));
        assert!(node.versions_list[0].extra.contains_key("node_id"));
        // Missing flag defaults to "needs refresh".
        assert!(node.refresh.needs_version_refresh);

        let out = serde_json::to_value(&node).unwrap();
        assert_eq!(out["publisher"]["id"], "someone");
        assert_eq!(out["_needs_version_refresh"], true);
    }

    #[test]
    fn test_absorb_keeps_unmentioned_extra_keys() {
        let mut old: NodeInfo = serde_json::from_value(json!({
            "id": "a", "name": "Old", "icon_color": "red", "publisher": "x"
        }))
        .unwrap();
        let newer: NodeInfo = serde_json::from_value(json!({
            "id": "a", "name": "New", "publisher": "y"
        }))
        .unwrap();
        old.absorb(newer);
        assert_eq!(old.name, "New");
        assert_eq!(old.extra["publisher"], "y");
        assert_eq!(old.extra["icon_color"], "red");
    }

    #[test]
    fn test_refresh_decision_rules() {
        let now = parse_timestamp("2025-06-02T12:00:00Z").unwrap();
        let day = chrono::Duration::hours(24);
        let recent = "2025-06-02T00:00:00Z";
        let stale = "2025-05-30T00:00:00Z";

        let moved = RefreshState::decide(Some("1.0"), Some("1.1"), Some(recent), now, day);
        assert!(moved.needs_version_refresh);

        let fresh = RefreshState::decide(Some("1.0"), Some("1.0"), Some(recent), now, day);
        assert!(!fresh.needs_version_refresh);

        let old = RefreshState::decide(Some("1.0"), Some("1.0"), Some(stale), now, day);
        assert!(old.needs_version_refresh);

        let unreadable = RefreshState::decide(None, None, Some("yesterday"), now, day);
        assert!(unreadable.needs_version_refresh);

        let never = RefreshState::decide(None, None, None, now, day);
        assert!(never.needs_version_refresh);
    }

    #[test]
    fn test_parse_timestamp_accepts_common_shapes() {
        assert!(parse_timestamp("2025-01-01T00:00:00Z").is_some());
        assert!(parse_timestamp("2025-09-18T07:01:22.656499Z").is_some());
        assert!(parse_timestamp("2024-01-01T00:00:00").is_some());
        assert!(parse_timestamp("2024-01-01T00:00:00.123456").is_some());
        assert!(parse_timestamp("2024-01-01").is_some());
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("not a date").is_none());
    }

    #[test]
    fn test_aggregates_follow_live_nodes() {
        let mut node = CachedNode::discovered(
            NodeInfo {
                id: "a".into(),
                ..NodeInfo::default()
            },
            Utc::now(),
        );
        let mut v1 = VersionRecord::new("1.0.0", "2025-01-01");
        v1.comfy_nodes = Some(vec![
            NodeMetadata::new("A", Value::Null),
            NodeMetadata::new("B", Value::Null),
        ]);
        node.versions_list = vec![v1, VersionRecord::new("0.9.0", "2024-01-01")];

        let mut file = CacheFile::from_nodes(vec![node], Utc::now());
        assert_eq!(file.node_count, 1);
        assert_eq!(file.versions_processed, 2);
        assert_eq!(file.metadata_entries, 2);

        file.nodes.clear();
        file.recompute_aggregates();
        assert_eq!(file.node_count, 0);
        assert_eq!(file.metadata_entries, 0);
    }

    #[test]
    fn test_sort_versions_is_stable_for_equal_dates() {
        let mut versions = vec![
            VersionRecord::new("a", "2024-01-01"),
            VersionRecord::new("b", "2025-01-01"),
            VersionRecord::new("c", "2024-01-01"),
        ];
        sort_versions_by_date(&mut versions);
        let order: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_registry_entries_serialize_without_source() {
        let entry = MappingEntry {
            package_id: "pkg".into(),
            versions: vec!["1.0.0".into()],
            rank: 1,
            source: None,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("source").is_none());

        let community = MappingEntry {
            source: Some(EntrySource::Manager),
            ..entry
        };
        let value = serde_json::to_value(&community).unwrap();
        assert_eq!(value["source"], "manager");
    }
}
