//! Global mapping build: registry cache in, ranked signature mapping and
//! package catalog out.
//!
//! Per-package extraction is pure and runs on a rayon pool; the merge into
//! the shared mapping runs sequentially in cache order so the output does not
//! depend on scheduling.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::ScoringPolicy;
use crate::errors::NodemapResult;
use crate::mapping::scoring::{package_score, rank_entries, ScoredEntry};
use crate::mapping::signature::node_key;
use crate::mapping::url::normalize_repository_url;
use crate::mapping::version::{compare_versions, sort_descending};
use crate::models::{
    format_timestamp, CacheFile, CachedNode, EntrySource, MappingEntry, MappingFile, MappingStats,
    PackageRecord, PackageVersion,
};
use crate::store::{read_json, write_json_atomic};

/// Date format of the mapping file's `version` field.
pub const MAPPING_VERSION_FORMAT: &str = "%Y.%m.%d";

/// What one cached package contributes to the build.
#[derive(Debug, Clone)]
pub struct PackageExtract {
    pub package_id: String,
    pub record: PackageRecord,
    /// `(signature key, version)` pairs from non-deprecated versions, in
    /// version-list order.
    pub pairs: Vec<(String, String)>,
}

/// Catalog record and signature pairs for one cached node.
pub fn extract_package(node: &CachedNode) -> PackageExtract {
    let info = &node.info;
    let display_name = if info.name.is_empty() {
        info.id.clone()
    } else {
        info.name.clone()
    };

    let mut versions: Vec<PackageVersion> = Vec::with_capacity(node.versions_list.len());
    let mut pairs = Vec::new();
    for version in &node.versions_list {
        versions.push(PackageVersion::from(version));
        if version.deprecated {
            continue;
        }
        for meta in version.comfy_nodes.iter().flatten() {
            if meta.comfy_node_name.is_empty() {
                continue;
            }
            pairs.push((
                node_key(&meta.comfy_node_name, &meta.input_types),
                version.version.clone(),
            ));
        }
    }
    sort_descending(&mut versions, |v| v.version.as_str());

    let mut catalog = IndexMap::with_capacity(versions.len());
    for version in versions {
        // First entry wins for a repeated version string.
        catalog.entry(version.version.clone()).or_insert(version);
    }

    PackageExtract {
        package_id: info.id.clone(),
        record: PackageRecord {
            display_name,
            author: info.author.clone(),
            description: info.description.clone(),
            repository: normalize_repository_url(&info.repository),
            downloads: info.downloads,
            github_stars: info.github_stars,
            rating: info.rating,
            license: info.license.clone(),
            category: info.category.clone(),
            icon: info.icon.clone(),
            tags: info.tags.clone(),
            status: info.status.clone(),
            created_at: info.created_at.clone(),
            versions: catalog,
            synthetic: false,
            source: None,
        },
        pairs,
    }
}

/// Upsert `(package, version)` under `key`.
pub(crate) fn upsert_entry(
    mappings: &mut IndexMap<String, Vec<MappingEntry>>,
    key: &str,
    package_id: &str,
    version: Option<&str>,
    source: Option<EntrySource>,
) -> bool {
    let entries = mappings.entry(key.to_string()).or_default();
    if let Some(existing) = entries.iter_mut().find(|e| e.package_id == package_id) {
        if let Some(version) = version {
            if !existing.versions.iter().any(|v| v == version) {
                existing.versions.push(version.to_string());
            }
        }
        return false;
    }
    entries.push(MappingEntry {
        package_id: package_id.to_string(),
        versions: version.map(|v| vec![v.to_string()]).unwrap_or_default(),
        rank: 0,
        source,
    });
    true
}

/// Re-rank the entries under `key` using per-package scores.
pub(crate) fn rerank(
    mappings: &mut IndexMap<String, Vec<MappingEntry>>,
    key: &str,
    scores: &HashMap<String, f64>,
    fallback: f64,
) {
    let Some(entries) = mappings.get_mut(key) else {
        return;
    };
    let scored = std::mem::take(entries)
        .into_iter()
        .map(|entry| {
            let score = scores.get(&entry.package_id).copied().unwrap_or(fallback);
            ScoredEntry::new(entry, score)
        })
        .collect();
    *entries = rank_entries(scored);
}

pub struct MappingBuilder {
    policy: ScoringPolicy,
    now: DateTime<Utc>,
    workers: usize,
}

impl MappingBuilder {
    pub fn new(policy: ScoringPolicy) -> Self {
        Self {
            policy,
            now: Utc::now(),
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }

    /// Fix the clock used for recency and output timestamps.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    fn extract_all(&self, nodes: &[CachedNode]) -> Vec<PackageExtract> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build();
        match pool {
            Ok(pool) => pool.install(|| nodes.par_iter().map(extract_package).collect()),
            Err(e) => {
                debug!("rayon pool unavailable ({e}), extracting sequentially");
                nodes.iter().map(extract_package).collect()
            }
        }
    }

    pub fn build(&self, cache: &CacheFile) -> MappingFile {
        let started = Instant::now();
        info!(
            "building mappings from {} cached nodes ({} metadata entries, cached at {})",
            cache.nodes.len(),
            cache.metadata_entries,
            if cache.cached_at.is_empty() {
                "unknown"
            } else {
                cache.cached_at.as_str()
            }
        );

        let extracts = self.extract_all(&cache.nodes);

        let mut packages: IndexMap<String, PackageRecord> = IndexMap::new();
        let mut mappings: IndexMap<String, Vec<MappingEntry>> = IndexMap::new();
        let mut total_nodes = 0usize;

        for extract in extracts {
            let PackageExtract {
                package_id,
                record,
                pairs,
            } = extract;
            match packages.get_mut(&package_id) {
                Some(existing) => {
                    // Catalog metadata is kept from the first occurrence.
                    for (version, data) in record.versions {
                        existing.versions.insert(version, data);
                    }
                    existing
                        .versions
                        .sort_by(|a, _, b, _| compare_versions(b, a));
                }
                None => {
                    packages.insert(package_id.clone(), record);
                }
            }
            for (key, version) in &pairs {
                upsert_entry(&mut mappings, key, &package_id, Some(version.as_str()), None);
            }
            total_nodes += pairs.len();
        }

        let scores: HashMap<String, f64> = packages
            .iter()
            .map(|(id, pkg)| (id.clone(), package_score(pkg, &self.policy, self.now)))
            .collect();
        let keys: Vec<String> = mappings.keys().cloned().collect();
        for key in &keys {
            rerank(&mut mappings, key, &scores, self.policy.min_score);
        }

        let stats = MappingStats {
            packages: packages.len(),
            signatures: mappings.len(),
            total_nodes,
            ..MappingStats::default()
        };
        info!(
            "mapping build done: {} packages, {} signatures, {} nodes in {:.1}s",
            stats.packages,
            stats.signatures,
            stats.total_nodes,
            started.elapsed().as_secs_f64()
        );

        MappingFile {
            version: self.now.format(MAPPING_VERSION_FORMAT).to_string(),
            generated_at: format_timestamp(self.now),
            stats,
            mappings,
            packages,
        }
    }

    /// Read a cache file, build, and write the mapping file atomically.
    pub fn build_file(&self, cache_path: &Path, output_path: &Path) -> NodemapResult<MappingStats> {
        let cache: CacheFile = read_json(cache_path)?;
        let mapping = self.build(&cache);
        write_json_atomic(output_path, &mapping)?;
        info!("wrote mappings to {}", output_path.display());
        Ok(mapping.stats)
    }
}
