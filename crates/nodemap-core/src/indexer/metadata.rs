//! Phase 3: per-version node metadata.
//!
//! A failed lookup leaves the version untouched so the next run retries it.
//! A confirmed-empty answer is cached as an empty list.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::errors::NodemapResult;
use crate::indexer::batch::{pause, run_batches, BatchPlan};
use crate::indexer::pipeline::CacheBuilder;
use crate::models::{CachedNode, NodeMetadata};
use crate::registry::{FetchOutcome, RegistryClient};

impl<C: RegistryClient + ?Sized> CacheBuilder<C> {
    /// Versions of `node` that phase 3 should look up.
    pub(crate) fn metadata_candidates(&self, node: &CachedNode) -> Vec<String> {
        let limit = self.config.max_versions.unwrap_or(usize::MAX);
        node.versions_list
            .iter()
            .take(limit)
            .filter(|v| self.config.force_metadata_refresh || !v.metadata_cached)
            .map(|v| v.version.clone())
            .collect()
    }

    pub(crate) async fn fetch_metadata(&self) -> NodemapResult<()> {
        let targets: Option<HashSet<&str>> = self
            .config
            .metadata_targets
            .as_ref()
            .map(|ids| ids.iter().map(String::as_str).collect());

        let work: Vec<String> = {
            let nodes = self.nodes.lock();
            if let Some(targets) = &targets {
                for id in targets.iter().filter(|id| !nodes.contains_key(**id)) {
                    warn!("metadata target {id} is not in the cache");
                }
            }
            nodes
                .values()
                .filter(|n| targets.as_ref().map_or(true, |t| t.contains(n.id())))
                .filter(|n| !self.metadata_candidates(n).is_empty())
                .map(|n| n.info.id.clone())
                .collect()
        };

        let mode = if self.config.force_metadata_refresh {
            "force"
        } else {
            "incremental"
        };
        let depth = self
            .config
            .max_versions
            .map_or_else(|| "all".to_string(), |n| n.to_string());
        info!(
            "phase 3: {} nodes need metadata ({mode}, newest {depth} versions each)",
            work.len()
        );
        self.stats.lock().metadata_nodes += work.len();

        let report = run_batches(
            "metadata",
            &work,
            BatchPlan::from(&self.config),
            |node_id| self.refresh_metadata(node_id),
            || self.checkpoint().map(|_| ()),
        )
        .await?;
        self.stats.lock().absorb_report(report);

        self.checkpoint()?;
        info!("phase 3 done");
        Ok(())
    }

    async fn refresh_metadata(&self, node_id: String) {
        let versions = {
            let nodes = self.nodes.lock();
            match nodes.get(&node_id) {
                Some(node) => self.metadata_candidates(node),
                None => return,
            }
        };

        let mut failed = 0usize;
        for version in versions {
            let outcome = self.client.get_comfy_nodes(&node_id, &version).await;
            pause(self.config.metadata_delay).await;

            let entries = match outcome {
                FetchOutcome::Success(entries) => {
                    let mut stats = self.stats.lock();
                    stats.metadata_with_data += 1;
                    stats.metadata_entries_fetched += entries.len();
                    entries
                }
                FetchOutcome::ConfirmedEmpty => {
                    self.stats.lock().metadata_confirmed_empty += 1;
                    Vec::new()
                }
                FetchOutcome::Failed(err) => {
                    debug!("metadata for {node_id}@{version} failed: {err}");
                    self.stats.lock().metadata_failed += 1;
                    failed += 1;
                    continue;
                }
            };
            self.store_metadata(&node_id, &version, entries);
        }

        if failed > 0 {
            warn!("{node_id}: metadata failed for {failed} version(s), will retry next run");
            self.stats.lock().record_failure(&node_id);
        }
    }

    fn store_metadata(&self, node_id: &str, version: &str, entries: Vec<NodeMetadata>) {
        let mut nodes = self.nodes.lock();
        let Some(node) = nodes.get_mut(node_id) else {
            return;
        };
        if let Some(record) = node.versions_list.iter_mut().find(|v| v.version == version) {
            record.comfy_nodes = Some(entries);
            record.metadata_cached = true;
        }
        node.recount_metadata();
    }
}
