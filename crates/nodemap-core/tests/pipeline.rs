//! End-to-end runs of the cache builder and mapping engine against a
//! scripted registry.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use _nodemap_core::community::CommunityMap;
use _nodemap_core::config::{BuilderConfig, PhaseSelection, ScoringPolicy};
use _nodemap_core::indexer::CacheBuilder;
use _nodemap_core::mapping::{Augmenter, MappingBuilder};
use _nodemap_core::models::{
    format_timestamp, CacheFile, CachedNode, EntrySource, MappingFile, NodeInfo, NodeMetadata,
    RefreshState, VersionRecord,
};
use _nodemap_core::registry::{FetchError, FetchOutcome, ScriptedRegistry};
use _nodemap_core::store::CacheStore;

fn listing(id: &str, latest: &str, downloads: u64, stars: u64) -> NodeInfo {
    NodeInfo {
        id: id.to_string(),
        name: id.to_string(),
        repository: format!("https://github.com/acme/{id}"),
        downloads,
        github_stars: stars,
        latest_version: Some(json!({"version": latest})),
        ..NodeInfo::default()
    }
}

fn released(version: &str, days_ago: i64) -> VersionRecord {
    VersionRecord {
        api_download_url: format!("https://cdn/{version}.zip"),
        ..VersionRecord::new(version, format_timestamp(Utc::now() - Duration::days(days_ago)))
    }
}

fn builder(
    registry: &Arc<ScriptedRegistry>,
    dir: &std::path::Path,
    phases: PhaseSelection,
) -> CacheBuilder<ScriptedRegistry> {
    let config = BuilderConfig {
        phases,
        ..BuilderConfig::default().without_delays()
    };
    let builder =
        CacheBuilder::new(registry.clone(), config, CacheStore::new(dir.join("cache.json")))
            .unwrap();
    builder.resume().unwrap();
    builder
}

fn all_phases() -> PhaseSelection {
    PhaseSelection::default()
}

fn mapping_from(builder: &CacheBuilder<ScriptedRegistry>) -> MappingFile {
    let cache = CacheFile::from_nodes(builder.snapshot(), Utc::now());
    MappingBuilder::new(ScoringPolicy::default()).build(&cache)
}

#[tokio::test]
async fn test_basic_phase_leaves_last_checked_for_versions_phase() {
    let dir = tempfile::tempdir().unwrap();
    let checked = format_timestamp(Utc::now() - Duration::hours(2));
    let mut seeded = CachedNode::discovered(listing("fill-nodes", "1.8.0", 1000, 400), Utc::now());
    seeded.versions_list = vec![VersionRecord::new("1.8.0", "2025-01-01T00:00:00Z")];
    seeded.versions_cached = true;
    seeded.last_checked = Some(checked.clone());
    seeded.refresh = RefreshState::settled();
    CacheStore::new(dir.path().join("cache.json"))
        .save([&seeded], Utc::now())
        .unwrap();

    let registry = Arc::new(ScriptedRegistry::with_nodes(vec![listing(
        "fill-nodes",
        "1.9.0",
        1200,
        410,
    )]));
    registry.set_versions(
        "fill-nodes",
        FetchOutcome::Success(vec![released("1.9.0", 1), released("1.8.0", 100)]),
    );

    let basic_only = PhaseSelection {
        nodes: true,
        versions: false,
        metadata: false,
    };
    let first = builder(&registry, dir.path(), basic_only);
    first.run().await.unwrap();
    let node = first.node("fill-nodes").unwrap();
    assert_eq!(node.last_checked.as_deref(), Some(checked.as_str()));
    assert!(node.refresh.needs_version_refresh);
    assert_eq!(node.info.downloads, 1200);

    let versions_only = PhaseSelection {
        nodes: false,
        versions: true,
        metadata: false,
    };
    let second = builder(&registry, dir.path(), versions_only);
    second.run().await.unwrap();
    let node = second.node("fill-nodes").unwrap();
    assert_eq!(registry.call_count("versions:fill-nodes"), 1);
    assert_eq!(node.versions_list.len(), 2);
    assert_eq!(node.versions_list[0].version, "1.9.0");
    assert!(!node.refresh.needs_version_refresh);
    assert_ne!(node.last_checked.as_deref(), Some(checked.as_str()));
}

#[tokio::test]
async fn test_rerun_without_changes_is_quiet_and_stable() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ScriptedRegistry::with_nodes(vec![
        listing("a", "1.0.0", 100, 1),
        listing("b", "2.0.0", 50, 0),
    ]));
    registry.set_versions("a", FetchOutcome::Success(vec![released("1.0.0", 5)]));
    registry.set_versions("b", FetchOutcome::Success(vec![released("2.0.0", 5)]));
    registry.set_comfy_nodes(
        "a",
        "1.0.0",
        FetchOutcome::Success(vec![NodeMetadata::new("Alpha", Value::Null)]),
    );

    let first = builder(&registry, dir.path(), all_phases());
    first.run().await.unwrap();
    let before = first.snapshot();

    registry.clear_calls();
    let second = builder(&registry, dir.path(), all_phases());
    let stats = second.run().await.unwrap();

    assert_eq!(registry.call_count("versions:"), 0);
    assert_eq!(registry.call_count("comfy:"), 0);
    assert_eq!(stats.versions_skipped, 2);
    assert_eq!(second.snapshot(), before);
}

#[tokio::test]
async fn test_failed_metadata_is_retried_on_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ScriptedRegistry::with_nodes(vec![listing("a", "1.0.0", 1, 1)]));
    registry.set_versions("a", FetchOutcome::Success(vec![released("1.0.0", 1)]));
    registry.set_comfy_nodes(
        "a",
        "1.0.0",
        FetchOutcome::Failed(FetchError::Transient("timeout".into())),
    );

    let first = builder(&registry, dir.path(), all_phases());
    let stats = first.run().await.unwrap();
    assert_eq!(stats.metadata_failed, 1);
    assert!(!first.node("a").unwrap().versions_list[0].metadata_cached);

    registry.set_comfy_nodes(
        "a",
        "1.0.0",
        FetchOutcome::Success(vec![NodeMetadata::new("Alpha", Value::Null)]),
    );
    registry.clear_calls();
    let second = builder(&registry, dir.path(), all_phases());
    second.run().await.unwrap();

    assert_eq!(registry.calls(), vec!["list:1", "comfy:a@1.0.0"]);
    let node = second.node("a").unwrap();
    assert!(node.versions_list[0].metadata_cached);
    assert_eq!(node.metadata_count, 1);
}

#[tokio::test]
async fn test_popular_package_ranks_first_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ScriptedRegistry::with_nodes(vec![
        listing("pkg-b", "1.0.0", 500, 5),
        listing("pkg-a", "1.0.0", 10_000, 500),
    ]));
    for id in ["pkg-a", "pkg-b"] {
        registry.set_versions(id, FetchOutcome::Success(vec![released("1.0.0", 10)]));
        registry.set_comfy_nodes(
            id,
            "1.0.0",
            FetchOutcome::Success(vec![NodeMetadata::new("IntToFloat", Value::Null)]),
        );
    }

    let cache = builder(&registry, dir.path(), all_phases());
    cache.run().await.unwrap();
    let mapping = mapping_from(&cache);

    let entries = &mapping.mappings["IntToFloat::_"];
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].package_id, "pkg-a");
    assert_eq!(entries[0].rank, 1);
    assert_eq!(entries[1].package_id, "pkg-b");
    assert_eq!(entries[1].rank, 2);
    assert!(entries.iter().all(|e| e.source.is_none()));
}

#[tokio::test]
async fn test_deprecated_version_stays_in_catalog_only() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ScriptedRegistry::with_nodes(vec![listing("a", "2.0.0", 1, 1)]));
    registry.set_versions(
        "a",
        FetchOutcome::Success(vec![
            released("2.0.0", 1),
            VersionRecord {
                deprecated: true,
                ..released("1.0.0", 30)
            },
        ]),
    );
    registry.set_comfy_nodes(
        "a",
        "2.0.0",
        FetchOutcome::Success(vec![NodeMetadata::new("Current", Value::Null)]),
    );
    registry.set_comfy_nodes(
        "a",
        "1.0.0",
        FetchOutcome::Success(vec![NodeMetadata::new("Legacy", Value::Null)]),
    );

    let cache = builder(&registry, dir.path(), all_phases());
    cache.run().await.unwrap();
    let mapping = mapping_from(&cache);

    assert!(mapping.mappings.contains_key("Current::_"));
    assert!(!mapping.mappings.contains_key("Legacy::_"));
    assert!(mapping.packages["a"].versions["1.0.0"].deprecated);
}

#[tokio::test]
async fn test_community_map_fills_gaps_and_synthesizes_packages() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ScriptedRegistry::with_nodes(vec![listing("math", "1.0.0", 5000, 50)]));
    registry.set_versions("math", FetchOutcome::Success(vec![released("1.0.0", 3)]));
    registry.set_comfy_nodes(
        "math",
        "1.0.0",
        FetchOutcome::Success(vec![NodeMetadata::new(
            "IntToFloat",
            json!({"required": {"value": ["INT"]}}),
        )]),
    );

    let cache = builder(&registry, dir.path(), all_phases());
    cache.run().await.unwrap();
    let mut mapping = mapping_from(&cache);

    let community = CommunityMap::from_value(json!({
        "https://github.com/acme/math.git": [["IntToFloat", "FloatToInt"]],
        "https://github.com/x/y": [["Foo"], {"title_aux": "Y"}],
        "https://github.com/z/w": [["Foo"]],
    }))
    .unwrap();
    let stats = Augmenter::new(ScoringPolicy::default()).augment(&mut mapping, &community);

    // IntToFloat is already exposed under its typed signature.
    assert_eq!(stats.nodes_skipped_exists, 1);
    assert!(!mapping.mappings.contains_key("IntToFloat::_"));
    let float_to_int = &mapping.mappings["FloatToInt::_"];
    assert_eq!(float_to_int[0].package_id, "math");
    assert_eq!(float_to_int[0].source, Some(EntrySource::Manager));

    let foo = &mapping.mappings["Foo::_"];
    assert_eq!(foo.len(), 2);
    assert_eq!(foo[0].rank, 1);
    assert_eq!(foo[1].rank, 2);
    let y = &mapping.packages["manager_x_y"];
    assert_eq!(y.display_name, "Y");
    assert!(y.synthetic);
    assert!(mapping.packages.contains_key("manager_z_w"));

    let keys: Vec<&String> = mapping.mappings.keys().collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}
