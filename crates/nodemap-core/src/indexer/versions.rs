//! Phase 2: version lists and install data for flagged nodes.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::NodemapResult;
use crate::indexer::batch::{pause, run_batches, BatchPlan};
use crate::indexer::pipeline::CacheBuilder;
use crate::models::{format_timestamp, sort_versions_by_date, RefreshState, VersionRecord};
use crate::registry::{FetchOutcome, RegistryClient};

impl<C: RegistryClient + ?Sized> CacheBuilder<C> {
    pub(crate) async fn fetch_versions(&self) -> NodemapResult<()> {
        let (work, total): (Vec<String>, usize) = {
            let nodes = self.nodes.lock();
            let work = nodes
                .values()
                .filter(|n| n.refresh.needs_version_refresh)
                .map(|n| n.info.id.clone())
                .collect();
            (work, nodes.len())
        };
        let skipped = total - work.len();
        self.stats.lock().versions_skipped += skipped;
        info!(
            "phase 2: {} of {total} nodes need a version refresh ({skipped} unchanged)",
            work.len()
        );

        let report = run_batches(
            "versions",
            &work,
            BatchPlan::from(&self.config),
            |node_id| self.refresh_versions(node_id),
            || self.checkpoint().map(|_| ()),
        )
        .await?;
        self.stats.lock().absorb_report(report);

        self.checkpoint()?;
        info!("phase 2 done");
        Ok(())
    }

    async fn refresh_versions(&self, node_id: String) {
        let fetched = self.client.get_node_versions(&node_id).await;
        pause(self.config.rate_limit_delay).await;

        let mut api_versions = match fetched {
            FetchOutcome::Success(list) => list,
            FetchOutcome::ConfirmedEmpty => {
                self.settle_without_versions(&node_id);
                return;
            }
            FetchOutcome::Failed(err) => {
                warn!("versions for {node_id} failed: {err}");
                self.stats.lock().record_failure(&node_id);
                return;
            }
        };
        sort_versions_by_date(&mut api_versions);

        let mut known: HashMap<String, bool> = {
            let nodes = self.nodes.lock();
            let Some(node) = nodes.get(&node_id) else {
                return;
            };
            node.versions_list
                .iter()
                .map(|v| (v.version.clone(), v.deprecated))
                .collect()
        };

        let stamp = format_timestamp(Utc::now());
        let mut deprecations: HashMap<String, bool> = HashMap::new();
        let mut fresh: Vec<VersionRecord> = Vec::new();

        for mut version in api_versions {
            match known.get(&version.version) {
                Some(&was) => {
                    if was != version.deprecated {
                        deprecations.insert(version.version.clone(), version.deprecated);
                    }
                }
                None => {
                    if version.api_download_url.trim().is_empty() {
                        self.fill_install_info(&node_id, &mut version).await;
                    } else {
                        version.download_url = version.api_download_url.clone();
                    }
                    version.metadata_cached = false;
                    version.first_seen = Some(stamp.clone());
                    known.insert(version.version.clone(), version.deprecated);
                    fresh.push(version);
                }
            }
        }

        let added = fresh.len();
        let deprecated = deprecations.len();
        {
            let mut nodes = self.nodes.lock();
            let Some(node) = nodes.get_mut(&node_id) else {
                return;
            };
            for version in &mut node.versions_list {
                if let Some(&flag) = deprecations.get(&version.version) {
                    version.deprecated = flag;
                }
            }
            node.versions_list.extend(fresh);
            sort_versions_by_date(&mut node.versions_list);
            node.versions_cached = true;
            node.last_checked = Some(stamp);
            node.refresh = RefreshState::settled();
        }

        let mut stats = self.stats.lock();
        stats.versions_refreshed += 1;
        stats.versions_added += added;
        stats.deprecations_updated += deprecated;
        if added > 0 || deprecated > 0 {
            debug!("{node_id}: {added} new version(s), {deprecated} deprecation change(s)");
        }
    }

    /// The registry has no versions for this node. Existing records stay.
    fn settle_without_versions(&self, node_id: &str) {
        {
            let mut nodes = self.nodes.lock();
            let Some(node) = nodes.get_mut(node_id) else {
                return;
            };
            node.versions_cached = true;
            node.last_checked = Some(format_timestamp(Utc::now()));
            node.refresh = RefreshState::settled();
        }
        self.stats.lock().versions_confirmed_empty += 1;
        debug!("{node_id}: registry lists no versions");
    }

    async fn fill_install_info(&self, node_id: &str, version: &mut VersionRecord) {
        let outcome = self.client.get_install_info(node_id, &version.version).await;
        self.stats.lock().install_lookups += 1;
        match outcome {
            FetchOutcome::Success(install) => {
                version.download_url = install.download_url;
                if !install.dependencies.is_empty() {
                    version.dependencies = install.dependencies;
                }
                if !install.install_type.is_empty() {
                    version.install_type = install.install_type;
                }
            }
            FetchOutcome::ConfirmedEmpty => {
                debug!("{node_id}@{}: no install info", version.version);
            }
            FetchOutcome::Failed(err) => {
                debug!("{node_id}@{}: install info unavailable: {err}", version.version);
            }
        }
        pause(self.config.install_delay).await;
    }
}
