//! Cache builder state, checkpoints and the phase driver.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::BuilderConfig;
use crate::errors::NodemapResult;
use crate::indexer::batch::BatchReport;
use crate::models::CachedNode;
use crate::registry::RegistryClient;
use crate::store::cache::{CacheStore, CacheTotals};

/// Failed ids printed in the run summary.
const FAILED_IDS_SHOWN: usize = 10;

/// Counters collected over one build.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildStats {
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub nodes_listed: usize,
    pub nodes_new: usize,
    /// Listed nodes whose version list needs a refresh.
    pub nodes_flagged: usize,
    /// Nodes whose version list was refreshed.
    pub versions_refreshed: usize,
    /// Nodes the registry confirmed have no versions.
    pub versions_confirmed_empty: usize,
    /// Nodes left alone by the versions phase.
    pub versions_skipped: usize,
    pub versions_added: usize,
    pub deprecations_updated: usize,
    pub install_lookups: usize,
    pub metadata_nodes: usize,
    pub metadata_with_data: usize,
    pub metadata_confirmed_empty: usize,
    pub metadata_failed: usize,
    pub metadata_entries_fetched: usize,
    pub groups_timed_out: usize,
    pub failed_nodes: Vec<String>,
    pub elapsed_secs: f64,
    pub totals: CacheTotals,
}

impl BuildStats {
    pub(crate) fn record_failure(&mut self, node_id: &str) {
        if !self.failed_nodes.iter().any(|id| id == node_id) {
            self.failed_nodes.push(node_id.to_string());
        }
    }

    pub(crate) fn absorb_report(&mut self, report: BatchReport) {
        self.groups_timed_out += report.groups_timed_out;
        for id in &report.nodes_timed_out {
            self.record_failure(id);
        }
    }

    pub fn log_summary(&self) {
        info!("registry cache build finished in {:.1}s", self.elapsed_secs);
        info!(
            "  basic info: {} pages ({} failed), {} nodes listed, {} new, {} flagged",
            self.pages_fetched,
            self.pages_failed,
            self.nodes_listed,
            self.nodes_new,
            self.nodes_flagged
        );
        info!(
            "  versions: {} refreshed, {} without versions, {} unchanged, {} added, {} deprecation updates",
            self.versions_refreshed,
            self.versions_confirmed_empty,
            self.versions_skipped,
            self.versions_added,
            self.deprecations_updated
        );
        info!(
            "  metadata: {} nodes, {} versions with data, {} confirmed empty, {} failed",
            self.metadata_nodes,
            self.metadata_with_data,
            self.metadata_confirmed_empty,
            self.metadata_failed
        );
        info!(
            "  cache: {} nodes, {} versions, {} metadata entries",
            self.totals.node_count, self.totals.versions_processed, self.totals.metadata_entries
        );
        if self.groups_timed_out > 0 {
            warn!("  {} group(s) timed out", self.groups_timed_out);
        }
        if !self.failed_nodes.is_empty() {
            let shown: Vec<&str> = self
                .failed_nodes
                .iter()
                .take(FAILED_IDS_SHOWN)
                .map(String::as_str)
                .collect();
            let more = self.failed_nodes.len().saturating_sub(FAILED_IDS_SHOWN);
            if more > 0 {
                warn!(
                    "  {} failed node(s): {} (+{more} more)",
                    self.failed_nodes.len(),
                    shown.join(", ")
                );
            } else {
                warn!("  {} failed node(s): {}", self.failed_nodes.len(), shown.join(", "));
            }
        }
    }
}

/// Progressive registry cache builder.
///
/// Holds the node table in memory, keyed by package id in first-seen order.
/// The phases borrow `&self`; each in-flight task owns one node key and the
/// table lock is only taken between awaits.
pub struct CacheBuilder<C: RegistryClient + ?Sized> {
    pub(super) client: Arc<C>,
    pub(super) config: BuilderConfig,
    pub(super) store: CacheStore,
    pub(super) nodes: Mutex<IndexMap<String, CachedNode>>,
    pub(super) stats: Mutex<BuildStats>,
}

impl<C: RegistryClient + ?Sized> CacheBuilder<C> {
    pub fn new(client: Arc<C>, config: BuilderConfig, store: CacheStore) -> NodemapResult<Self> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            store,
            nodes: Mutex::new(IndexMap::new()),
            stats: Mutex::new(BuildStats::default()),
        })
    }

    /// Use the cache file on disk as the merge base. Returns the node count.
    pub fn resume(&self) -> NodemapResult<usize> {
        let loaded = self.store.load(Utc::now())?;
        let count = loaded.len();
        *self.nodes.lock() = loaded;
        Ok(count)
    }

    /// Seed the table directly, replacing whatever was loaded.
    pub fn with_nodes(self, nodes: impl IntoIterator<Item = CachedNode>) -> Self {
        {
            let mut table = self.nodes.lock();
            table.clear();
            for node in nodes {
                table.insert(node.info.id.clone(), node);
            }
        }
        self
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    pub fn node(&self, node_id: &str) -> Option<CachedNode> {
        self.nodes.lock().get(node_id).cloned()
    }

    /// Clone of the current table in insertion order.
    pub fn snapshot(&self) -> Vec<CachedNode> {
        self.nodes.lock().values().cloned().collect()
    }

    pub fn stats(&self) -> BuildStats {
        self.stats.lock().clone()
    }

    /// Atomically save the table with freshly computed aggregates.
    pub fn checkpoint(&self) -> NodemapResult<CacheTotals> {
        let nodes = self.nodes.lock();
        self.store.save(nodes.values(), Utc::now())
    }

    /// Run the configured phases in order and save the final cache.
    pub async fn run(&self) -> NodemapResult<BuildStats> {
        let started = Instant::now();
        let phases = self.config.phases;
        info!(
            "building registry cache at {} (phases: {}, {} nodes cached)",
            self.store.path().display(),
            phases.describe(),
            self.len()
        );

        if phases.nodes {
            self.fetch_basic_info().await?;
            self.checkpoint()?;
        }
        if phases.versions {
            self.fetch_versions().await?;
        }
        if phases.metadata {
            self.fetch_metadata().await?;
        }

        {
            let mut nodes = self.nodes.lock();
            for node in nodes.values_mut() {
                node.recount_metadata();
            }
        }
        let totals = self.checkpoint()?;

        let summary = {
            let mut stats = self.stats.lock();
            stats.totals = totals;
            stats.elapsed_secs = started.elapsed().as_secs_f64();
            stats.clone()
        };
        summary.log_summary();
        Ok(summary)
    }
}
