//! Criterion benchmarks for nodemap-core.
//!
//! Everything here runs on in-memory data; no registry or network access.
//!
//! ## Benchmark groups
//!
//! 1. **signatures**: input descriptor normalization and key building.
//! 2. **urls**: repository URL canonicalization and synthetic ids.
//! 3. **versions**: version parsing and descending sort.
//! 4. **mapping_build**: full cache to mapping build at several cache sizes.
//! 5. **augment**: community merge over a built mapping.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/nodemap-core/Cargo.toml
//! cargo bench --manifest-path crates/nodemap-core/Cargo.toml -- mapping_build
//! ```

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Map, Value};

use _nodemap_core::community::CommunityMap;
use _nodemap_core::config::ScoringPolicy;
use _nodemap_core::mapping::signature::{node_key, normalize_input_signature};
use _nodemap_core::mapping::url::{generate_manager_package_id, normalize_repository_url};
use _nodemap_core::mapping::version::sort_descending;
use _nodemap_core::mapping::{Augmenter, MappingBuilder};
use _nodemap_core::models::{
    format_timestamp, CacheFile, CachedNode, NodeInfo, NodeMetadata, RefreshState, VersionRecord,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const INPUT_TYPES: [&str; 5] = ["IMAGE", "MASK", "LATENT", "INT", "FLOAT"];

fn input_types(width: usize) -> Value {
    let mut required = Map::new();
    for i in 0..width {
        required.insert(
            format!("input_{i}"),
            json!([INPUT_TYPES[i % INPUT_TYPES.len()]]),
        );
    }
    json!({ "required": required, "optional": { "strength": ["FLOAT", {"default": 1.0}] } })
}

/// A cache of `n_nodes` packages, each with a few versions exposing a few
/// nodes. Node names overlap across packages so ranking has work to do.
fn synthetic_cache(n_nodes: usize) -> CacheFile {
    let now = Utc::now();
    let nodes = (0..n_nodes)
        .map(|i| {
            let info = NodeInfo {
                id: format!("pkg-{i}"),
                name: format!("Package {i}"),
                repository: format!("https://github.com/owner{}/repo{i}", i % 37),
                downloads: (i as u64 * 7919) % 50_000,
                github_stars: (i as u64 * 104_729) % 3_000,
                ..NodeInfo::default()
            };
            let mut node = CachedNode::discovered(info, now);
            node.versions_list = (0..3)
                .map(|v| {
                    let created = format_timestamp(now - Duration::days((v * 40 + i % 300) as i64));
                    let mut record = VersionRecord::new(format!("1.{}.0", 2 - v), created);
                    record.comfy_nodes = Some(
                        (0..4)
                            .map(|k| {
                                NodeMetadata::new(
                                    format!("Node{}", (i + k) % (n_nodes / 2 + 1)),
                                    input_types(k + 1),
                                )
                            })
                            .collect(),
                    );
                    record.metadata_cached = true;
                    record
                })
                .collect();
            node.versions_cached = true;
            node.refresh = RefreshState::settled();
            node.recount_metadata();
            node
        })
        .collect();
    CacheFile::from_nodes(nodes, now)
}

fn synthetic_community(n_urls: usize) -> CommunityMap {
    let mut extensions = Map::new();
    for i in 0..n_urls {
        let url = if i % 2 == 0 {
            format!("https://github.com/owner{}/repo{i}.git", i % 37)
        } else {
            format!("https://github.com/community{i}/ext{i}")
        };
        extensions.insert(
            url,
            json!([[format!("Node{i}"), format!("Community{i}")], {"title_aux": format!("Ext {i}")}]),
        );
    }
    CommunityMap::from_value(Value::Object(extensions)).unwrap()
}

// ---------------------------------------------------------------------------
// Benchmark: Signatures
// ---------------------------------------------------------------------------

fn bench_signatures(c: &mut Criterion) {
    let mut group = c.benchmark_group("signatures");
    for &width in &[1usize, 4, 16] {
        let descriptor = input_types(width);
        group.bench_with_input(BenchmarkId::new("normalize", width), &descriptor, |b, d| {
            b.iter(|| normalize_input_signature(black_box(d)))
        });
    }
    let descriptor = input_types(4);
    group.bench_function("node_key", |b| {
        b.iter(|| node_key(black_box("ImageBlend"), black_box(&descriptor)))
    });
    group.bench_function("node_key_null", |b| {
        b.iter(|| node_key(black_box("ImageBlend"), black_box(&Value::Null)))
    });
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: URLs
// ---------------------------------------------------------------------------

fn bench_urls(c: &mut Criterion) {
    let mut group = c.benchmark_group("urls");
    let raw = [
        "https://github.com/Owner/Repo.git/",
        "http://www.github.com/owner/repo",
        "git@github.com:owner/repo.git",
        "https://gitlab.com/group/sub/project",
    ];
    group.bench_function("normalize", |b| {
        b.iter(|| {
            for url in &raw {
                black_box(normalize_repository_url(black_box(url)));
            }
        })
    });
    group.bench_function("manager_id", |b| {
        b.iter(|| generate_manager_package_id(black_box("https://github.com/owner/repo")))
    });
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Versions
// ---------------------------------------------------------------------------

fn bench_versions(c: &mut Criterion) {
    let versions: Vec<String> = (0..200)
        .map(|i| format!("{}.{}.{}", i % 4, (i * 7) % 13, (i * 11) % 17))
        .collect();
    c.bench_function("versions_sort_descending", |b| {
        b.iter_with_setup(
            || versions.clone(),
            |mut v| {
                sort_descending(&mut v, String::as_str);
                black_box(v);
            },
        )
    });
}

// ---------------------------------------------------------------------------
// Benchmark: Mapping build
// ---------------------------------------------------------------------------

fn bench_mapping_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("mapping_build");
    group.sample_size(20);
    for &n in &[100usize, 1_000, 5_000] {
        let cache = synthetic_cache(n);
        let builder = MappingBuilder::new(ScoringPolicy::default());
        group.bench_with_input(BenchmarkId::new("build", n), &cache, |b, cache| {
            b.iter(|| black_box(builder.build(cache)))
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Augment
// ---------------------------------------------------------------------------

fn bench_augment(c: &mut Criterion) {
    let mut group = c.benchmark_group("augment");
    group.sample_size(20);
    let mapping = MappingBuilder::new(ScoringPolicy::default()).build(&synthetic_cache(1_000));
    for &n in &[100usize, 1_000] {
        let community = synthetic_community(n);
        let augmenter = Augmenter::new(ScoringPolicy::default());
        group.bench_with_input(BenchmarkId::new("merge", n), &community, |b, community| {
            b.iter_with_setup(
                || mapping.clone(),
                |mut m| {
                    black_box(augmenter.augment(&mut m, community));
                },
            )
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_signatures,
    bench_urls,
    bench_versions,
    bench_mapping_build,
    bench_augment,
);
criterion_main!(benches);
