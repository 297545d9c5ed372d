//! Reconcile the community extension map with a built mapping file.
//!
//! Community entries are matched to catalog packages by canonical repository
//! URL. Matched packages gain the node names they do not expose yet;
//! unmatched extensions become synthetic packages. Every touched signature is
//! re-ranked with the same scoring as the registry build.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::community::{parse_entry, CommunityEntry, CommunityMap};
use crate::config::ScoringPolicy;
use crate::errors::NodemapResult;
use crate::mapping::builder::{rerank, upsert_entry};
use crate::mapping::scoring::package_score;
use crate::mapping::signature::{key_node_name, wildcard_key};
use crate::mapping::url::{
    generate_manager_package_id, is_supported_repo_url, normalize_repository_url,
    repo_owner_and_name,
};
use crate::models::{format_timestamp, EntrySource, MappingFile, PackageRecord};
use crate::store::{read_json, write_json_atomic};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AugmentStats {
    /// Node names listed by well-formed, supported community entries.
    pub total_community_nodes: usize,
    pub nodes_added: usize,
    pub nodes_skipped_exists: usize,
    pub packages_augmented: usize,
    pub synthetic_packages_created: usize,
    pub unsupported_urls: usize,
    pub malformed_entries: usize,
}

impl AugmentStats {
    pub fn log_summary(&self) {
        info!("augmentation summary:");
        info!("  community nodes:        {}", self.total_community_nodes);
        info!("  nodes added:            {}", self.nodes_added);
        info!("  nodes skipped (exists): {}", self.nodes_skipped_exists);
        info!("  packages augmented:     {}", self.packages_augmented);
        info!("  synthetic packages:     {}", self.synthetic_packages_created);
        info!("  unsupported URLs:       {}", self.unsupported_urls);
        info!("  malformed entries:      {}", self.malformed_entries);
    }
}

/// Canonical repository URL -> package id, for packages on supported hosts.
/// When two packages share a repository the later one wins.
pub fn build_url_index(packages: &IndexMap<String, PackageRecord>) -> HashMap<String, String> {
    packages
        .iter()
        .filter(|(_, pkg)| !pkg.repository.is_empty() && is_supported_repo_url(&pkg.repository))
        .map(|(id, pkg)| (normalize_repository_url(&pkg.repository), id.clone()))
        .collect()
}

/// Synthetic catalog record for an extension only the community map knows.
pub fn synthetic_package(canonical_url: &str, package_id: &str, entry: &CommunityEntry) -> PackageRecord {
    let (owner, repo) = repo_owner_and_name(canonical_url);
    PackageRecord {
        display_name: entry
            .title
            .clone()
            .or(repo)
            .unwrap_or_else(|| package_id.to_string()),
        author: entry.author.clone().or(owner).unwrap_or_default(),
        description: entry.description.clone().unwrap_or_default(),
        repository: canonical_url.to_string(),
        synthetic: true,
        source: Some(EntrySource::Manager),
        ..PackageRecord::default()
    }
}

pub struct Augmenter {
    policy: ScoringPolicy,
    now: DateTime<Utc>,
}

impl Augmenter {
    pub fn new(policy: ScoringPolicy) -> Self {
        Self {
            policy,
            now: Utc::now(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn augment(&self, mapping: &mut MappingFile, community: &CommunityMap) -> AugmentStats {
        let mut stats = AugmentStats::default();
        let mut url_index = build_url_index(&mapping.packages);
        info!(
            "augmenting {} signatures / {} packages with {} community extensions ({} indexed repositories)",
            mapping.mappings.len(),
            mapping.packages.len(),
            community.len(),
            url_index.len()
        );

        // Node names each package already exposes, under any signature.
        let mut exposed: HashMap<String, HashSet<String>> = HashMap::new();
        for (key, entries) in &mapping.mappings {
            let name = key_node_name(key);
            for entry in entries {
                exposed
                    .entry(entry.package_id.clone())
                    .or_default()
                    .insert(name.to_string());
            }
        }

        let mut touched: Vec<String> = Vec::new();
        let mut touched_set: HashSet<String> = HashSet::new();
        let mut augmented: HashSet<String> = HashSet::new();

        for (url, raw) in &community.extensions {
            if !is_supported_repo_url(url) {
                stats.unsupported_urls += 1;
                debug!("unsupported repository host: {url}");
                continue;
            }
            let entry = match parse_entry(raw) {
                Ok(entry) => entry,
                Err(reason) => {
                    stats.malformed_entries += 1;
                    warn!("malformed community entry for {url}: {reason}");
                    continue;
                }
            };
            stats.total_community_nodes += entry.node_names.len();

            let canonical = normalize_repository_url(url);
            let (package_id, synthetic) = match url_index.get(&canonical) {
                Some(id) => (id.clone(), false),
                None => {
                    let id = generate_manager_package_id(&canonical);
                    if !mapping.packages.contains_key(&id) {
                        mapping
                            .packages
                            .insert(id.clone(), synthetic_package(&canonical, &id, &entry));
                        stats.synthetic_packages_created += 1;
                        debug!("created synthetic package {id}");
                    }
                    url_index.insert(canonical.clone(), id.clone());
                    (id, true)
                }
            };

            let names = exposed.entry(package_id.clone()).or_default();
            let mut added_here = 0usize;
            for name in &entry.node_names {
                if names.contains(name) {
                    stats.nodes_skipped_exists += 1;
                    continue;
                }
                let key = wildcard_key(name);
                upsert_entry(
                    &mut mapping.mappings,
                    &key,
                    &package_id,
                    None,
                    Some(EntrySource::Manager),
                );
                names.insert(name.clone());
                if touched_set.insert(key.clone()) {
                    touched.push(key);
                }
                added_here += 1;
            }
            stats.nodes_added += added_here;
            if added_here > 0 && !synthetic && augmented.insert(package_id.clone()) {
                debug!("augmented {package_id} with {added_here} node(s)");
            }
        }
        stats.packages_augmented = augmented.len();

        let scores: HashMap<String, f64> = mapping
            .packages
            .iter()
            .map(|(id, pkg)| (id.clone(), package_score(pkg, &self.policy, self.now)))
            .collect();
        for key in &touched {
            rerank(&mut mapping.mappings, key, &scores, self.policy.min_score);
        }
        mapping.mappings.sort_keys();

        let synthetic_total = mapping.packages.values().filter(|p| p.synthetic).count();
        let previously_added = mapping.stats.nodes_from_manager.unwrap_or(0);
        mapping.stats.packages = mapping.packages.len();
        mapping.stats.signatures = mapping.mappings.len();
        mapping.stats.augmented = Some(true);
        mapping.stats.augmentation_date = Some(format_timestamp(self.now));
        mapping.stats.nodes_from_manager = Some(previously_added + stats.nodes_added);
        mapping.stats.synthetic_packages = Some(synthetic_total);

        stats
    }

    /// Load both inputs, augment, and write the result atomically.
    pub fn augment_file(
        &self,
        mappings_path: &Path,
        community_path: &Path,
        output_path: &Path,
    ) -> NodemapResult<AugmentStats> {
        let mut mapping: MappingFile = read_json(mappings_path)?;
        let community = CommunityMap::load(community_path)?;
        let stats = self.augment(&mut mapping, &community);
        write_json_atomic(output_path, &mapping)?;
        info!("saved augmented mappings to {}", output_path.display());
        Ok(stats)
    }
}
