//! Phase 1: paginate the registry listing and merge basic node info.
//!
//! This phase decides each node's refresh record but never touches
//! `last_checked`; only a successful versions refresh does.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::NodemapResult;
use crate::indexer::batch::pause;
use crate::indexer::pipeline::CacheBuilder;
use crate::models::{CachedNode, NodeInfo, RefreshState};
use crate::registry::{NodePage, RegistryClient};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageMerge {
    pub new: usize,
    pub updated: usize,
    pub flagged: usize,
    pub skipped: usize,
}

impl<C: RegistryClient + ?Sized> CacheBuilder<C> {
    pub(crate) async fn fetch_basic_info(&self) -> NodemapResult<()> {
        let per_page = self.config.nodes_per_page;
        let mut total_pages: Option<u32> = None;
        let mut page = 1u32;
        let mut failed_in_row = 0u32;
        let give_up_after = self.config.page_retries.max(1);

        info!("phase 1: fetching node listing ({per_page} per page)");
        loop {
            if self.config.max_pages.is_some_and(|max| page > max) {
                debug!("reached max_pages at page {page}");
                break;
            }
            if total_pages.is_some_and(|total| page > total) {
                break;
            }

            let Some(listing) = self.fetch_page(page).await else {
                self.stats.lock().pages_failed += 1;
                failed_in_row += 1;
                // Without a known page count only an empty page ends the loop.
                if total_pages.is_none() && failed_in_row >= give_up_after {
                    warn!("{failed_in_row} listing pages failed in a row with no page count, stopping");
                    break;
                }
                warn!("skipping listing page {page}");
                page += 1;
                continue;
            };
            failed_in_row = 0;

            if total_pages.is_none() {
                total_pages = listing.total_pages;
            }
            if listing.nodes.is_empty() {
                debug!("listing page {page} is empty, stopping");
                break;
            }

            let listed = listing.nodes.len();
            let merge = self.merge_page(listing.nodes);
            {
                let mut stats = self.stats.lock();
                stats.pages_fetched += 1;
                stats.nodes_listed += listed;
                stats.nodes_new += merge.new;
                stats.nodes_flagged += merge.flagged;
            }
            info!(
                "page {page}/{}: {listed} nodes ({} new, {} updated, {} need a version refresh)",
                total_pages.map_or_else(|| "?".to_string(), |t| t.to_string()),
                merge.new,
                merge.updated,
                merge.flagged
            );

            pause(self.config.page_delay).await;
            page += 1;
        }

        info!("phase 1 done: {} nodes cached", self.len());
        Ok(())
    }

    /// One listing page with retries. `None` once retries are exhausted or
    /// the registry rejects the request outright.
    async fn fetch_page(&self, page: u32) -> Option<NodePage> {
        let attempts = self.config.page_retries.max(1);
        let mut backoff = self.config.page_backoff;

        for attempt in 1..=attempts {
            match self.client.list_nodes(page, self.config.nodes_per_page).await {
                Ok(listing) => return Some(listing),
                Err(err) if !err.is_transient() => {
                    warn!("listing page {page} rejected, not retrying: {err}");
                    return None;
                }
                Err(err) if attempt == attempts => {
                    warn!("listing page {page} failed after {attempt} attempts: {err}");
                    return None;
                }
                Err(err) => {
                    debug!("listing page {page} attempt {attempt} failed: {err}; retrying in {backoff:?}");
                    pause(backoff).await;
                    backoff *= 3;
                }
            }
        }
        None
    }

    /// Merge one page into the table and decide refresh records.
    pub(crate) fn merge_page(&self, listing: Vec<NodeInfo>) -> PageMerge {
        let now = Utc::now();
        let mut merge = PageMerge::default();
        let mut nodes = self.nodes.lock();

        for info in listing {
            if info.id.is_empty() {
                merge.skipped += 1;
                continue;
            }
            match nodes.get_mut(&info.id) {
                Some(cached) => {
                    let decided = RefreshState::decide(
                        cached.info.latest_version_tag(),
                        info.latest_version_tag(),
                        cached.last_checked.as_deref(),
                        now,
                        self.config.refresh_after,
                    );
                    // A node still waiting on an earlier refresh stays flagged.
                    if !cached.refresh.needs_version_refresh {
                        cached.refresh = decided;
                    }
                    cached.info.absorb(info);
                    cached.basic_cached = true;
                    merge.updated += 1;
                    if cached.refresh.needs_version_refresh {
                        merge.flagged += 1;
                    }
                }
                None => {
                    let node = CachedNode::discovered(info, now);
                    nodes.insert(node.info.id.clone(), node);
                    merge.new += 1;
                    merge.flagged += 1;
                }
            }
        }

        if merge.skipped > 0 {
            warn!("skipped {} listed node(s) without an id", merge.skipped);
        }
        merge
    }
}
