//! In-memory registry with scripted answers, for replays and tests.
//!
//! Unknown nodes and versions answer `ConfirmedEmpty`. Every call is logged
//! as `list:<page>`, `versions:<id>`, `install:<id>@<v>` or `comfy:<id>@<v>`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::models::{NodeInfo, NodeMetadata, VersionRecord};
use crate::registry::{FetchError, FetchOutcome, InstallInfo, NodePage, RegistryClient};

type VersionKey = (String, String);

#[derive(Default)]
struct Script {
    nodes: Vec<NodeInfo>,
    listing_failures: HashMap<u32, VecDeque<FetchError>>,
    versions: HashMap<String, FetchOutcome<Vec<VersionRecord>>>,
    version_delays: HashMap<String, Duration>,
    install: HashMap<VersionKey, FetchOutcome<InstallInfo>>,
    comfy_nodes: HashMap<VersionKey, FetchOutcome<Vec<NodeMetadata>>>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedRegistry {
    script: Mutex<Script>,
}

impl ScriptedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: Vec<NodeInfo>) -> Self {
        let registry = Self::new();
        registry.set_nodes(nodes);
        registry
    }

    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        self.script.lock().nodes = nodes;
    }

    /// Make the next `times` requests for `page` fail with `error`.
    pub fn fail_listing_page(&self, page: u32, error: FetchError, times: usize) {
        let mut script = self.script.lock();
        let queue = script.listing_failures.entry(page).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    pub fn set_versions(&self, node_id: &str, outcome: FetchOutcome<Vec<VersionRecord>>) {
        self.script
            .lock()
            .versions
            .insert(node_id.to_string(), outcome);
    }

    /// Hold every versions call for `node_id` for `delay` before answering.
    pub fn delay_versions(&self, node_id: &str, delay: Duration) {
        self.script
            .lock()
            .version_delays
            .insert(node_id.to_string(), delay);
    }

    pub fn set_install(&self, node_id: &str, version: &str, outcome: FetchOutcome<InstallInfo>) {
        self.script
            .lock()
            .install
            .insert((node_id.to_string(), version.to_string()), outcome);
    }

    pub fn set_comfy_nodes(
        &self,
        node_id: &str,
        version: &str,
        outcome: FetchOutcome<Vec<NodeMetadata>>,
    ) {
        self.script
            .lock()
            .comfy_nodes
            .insert((node_id.to_string(), version.to_string()), outcome);
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().calls.clone()
    }

    /// Number of logged calls starting with `prefix`.
    pub fn call_count(&self, prefix: &str) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        self.script.lock().calls.clear();
    }

    fn record(&self, call: String) {
        self.script.lock().calls.push(call);
    }
}

#[async_trait]
impl RegistryClient for ScriptedRegistry {
    async fn list_nodes(&self, page: u32, page_size: u32) -> Result<NodePage, FetchError> {
        let mut script = self.script.lock();
        script.calls.push(format!("list:{page}"));
        if let Some(err) = script
            .listing_failures
            .get_mut(&page)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let size = page_size.max(1) as usize;
        let total_pages = script.nodes.len().div_ceil(size).max(1) as u32;
        let start = (page.saturating_sub(1) as usize).saturating_mul(size);
        let nodes = script.nodes.iter().skip(start).take(size).cloned().collect();
        Ok(NodePage {
            nodes,
            total_pages: Some(total_pages),
        })
    }

    async fn get_node_versions(&self, node_id: &str) -> FetchOutcome<Vec<VersionRecord>> {
        self.record(format!("versions:{node_id}"));
        let delay = self.script.lock().version_delays.get(node_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .versions
            .get(node_id)
            .cloned()
            .unwrap_or(FetchOutcome::ConfirmedEmpty)
    }

    async fn get_install_info(&self, node_id: &str, version: &str) -> FetchOutcome<InstallInfo> {
        self.record(format!("install:{node_id}@{version}"));
        self.script
            .lock()
            .install
            .get(&(node_id.to_string(), version.to_string()))
            .cloned()
            .unwrap_or(FetchOutcome::ConfirmedEmpty)
    }

    async fn get_comfy_nodes(
        &self,
        node_id: &str,
        version: &str,
    ) -> FetchOutcome<Vec<NodeMetadata>> {
        self.record(format!("comfy:{node_id}@{version}"));
        self.script
            .lock()
            .comfy_nodes
            .get(&(node_id.to_string(), version.to_string()))
            .cloned()
            .unwrap_or(FetchOutcome::ConfirmedEmpty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            ..NodeInfo::default()
        }
    }

    #[tokio::test]
    async fn test_listing_pages_and_failures() {
        let registry = ScriptedRegistry::with_nodes(vec![node("a"), node("b"), node("c")]);
        registry.fail_listing_page(2, FetchError::Transient("boom".into()), 1);

        let first = registry.list_nodes(1, 2).await.unwrap();
        assert_eq!(first.nodes.len(), 2);
        assert_eq!(first.total_pages, Some(2));

        assert!(registry.list_nodes(2, 2).await.is_err());
        let second = registry.list_nodes(2, 2).await.unwrap();
        assert_eq!(second.nodes[0].id, "c");
        assert_eq!(registry.call_count("list:"), 3);
    }

    #[tokio::test]
    async fn test_unknown_lookups_are_confirmed_empty() {
        let registry = ScriptedRegistry::new();
        assert_eq!(
            registry.get_node_versions("x").await,
            FetchOutcome::ConfirmedEmpty
        );
        assert_eq!(
            registry.get_comfy_nodes("x", "1.0").await,
            FetchOutcome::ConfirmedEmpty
        );
        assert_eq!(
            registry.calls(),
            vec!["versions:x".to_string(), "comfy:x@1.0".to_string()]
        );
    }
}
