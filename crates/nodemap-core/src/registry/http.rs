//! reqwest-backed registry client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::errors::NodemapResult;
use crate::models::{NodeInfo, NodeMetadata, VersionRecord};
use crate::registry::{FetchError, FetchOutcome, InstallInfo, NodePage, RegistryClient};

const USER_AGENT: &str = concat!("nodemap/", env!("CARGO_PKG_VERSION"));

/// Map an HTTP status to the fetch failure it represents, if any.
pub fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let message = status
        .canonical_reason()
        .unwrap_or("unexpected status")
        .to_string();
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Some(FetchError::Transient(format!("HTTP {}: {message}", status.as_u16())))
    } else {
        Some(FetchError::Permanent {
            status: status.as_u16(),
            message,
        })
    }
}

fn classify_transport(err: &reqwest::Error) -> FetchError {
    if err.is_decode() {
        FetchError::Malformed(err.to_string())
    } else {
        FetchError::Transient(err.to_string())
    }
}

/// Total page count under either of the keys the registry uses.
fn total_pages(body: &Value) -> Option<u32> {
    body.get("totalPages")
        .or_else(|| body.get("totalNumberOfPages"))
        .and_then(Value::as_u64)
        .map(|n| n.min(u32::MAX as u64) as u32)
}

/// Parse each element independently, dropping the ones that do not fit.
fn parse_items<T: serde::de::DeserializeOwned>(items: &[Value], what: &str) -> Vec<T> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<T>(item.clone()) {
            Ok(parsed) => out.push(parsed),
            Err(e) => debug!("skipping malformed {what}: {e}"),
        }
    }
    out
}

/// A non-empty list where nothing parses is a shape problem, not an empty
/// version list.
fn versions_outcome(node_id: &str, items: &[Value]) -> FetchOutcome<Vec<VersionRecord>> {
    let versions: Vec<VersionRecord> = parse_items(items, "version");
    if versions.is_empty() && !items.is_empty() {
        return FetchOutcome::Failed(FetchError::Malformed(format!(
            "none of the {} versions listed for {node_id} could be parsed",
            items.len()
        )));
    }
    FetchOutcome::from_list(versions)
}

#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    client: Client,
    config: ClientConfig,
}

impl HttpRegistryClient {
    pub fn new(config: ClientConfig) -> NodemapResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// GET a JSON document, retrying transient failures up to `retries`
    /// extra times with doubling backoff.
    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
        retries: u32,
    ) -> Result<Value, FetchError> {
        let url = self.url(path);
        let mut attempt = 0u32;
        loop {
            let result = self.try_get_json(&url, query).await;
            match result {
                Err(err) if err.is_transient() && attempt < retries => {
                    let wait = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    debug!("{url}: {err}; retrying in {wait:?}");
                    attempt += 1;
                    if wait > Duration::ZERO {
                        tokio::time::sleep(wait).await;
                    }
                }
                other => return other,
            }
        }
    }

    async fn try_get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| classify_transport(&e))
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn list_nodes(&self, page: u32, page_size: u32) -> Result<NodePage, FetchError> {
        // Listing pages are retried by the cache builder itself.
        let body = self
            .get_json(
                "/nodes",
                &[("page", page.to_string()), ("limit", page_size.to_string())],
                0,
            )
            .await?;
        let items = body
            .get("nodes")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let nodes: Vec<NodeInfo> = parse_items(items, "listing node");
        Ok(NodePage {
            nodes: nodes.into_iter().filter(|n| !n.id.is_empty()).collect(),
            total_pages: total_pages(&body),
        })
    }

    async fn get_node_versions(&self, node_id: &str) -> FetchOutcome<Vec<VersionRecord>> {
        let path = format!("/nodes/{node_id}/versions");
        match self.get_json(&path, &[], self.config.max_retries).await {
            Ok(Value::Array(items)) => versions_outcome(node_id, &items),
            Ok(other) => FetchOutcome::Failed(FetchError::Malformed(format!(
                "expected a version list for {node_id}, got {}",
                json_kind(&other)
            ))),
            Err(e) => FetchOutcome::Failed(e),
        }
    }

    async fn get_install_info(&self, node_id: &str, version: &str) -> FetchOutcome<InstallInfo> {
        let path = format!("/nodes/{node_id}/install");
        let query = [("version", version.to_string())];
        match self.get_json(&path, &query, self.config.max_retries).await {
            Ok(Value::Null) => FetchOutcome::ConfirmedEmpty,
            Ok(body) => match serde_json::from_value::<InstallInfo>(body) {
                Ok(info) if info.download_url.is_empty() => FetchOutcome::ConfirmedEmpty,
                Ok(info) => FetchOutcome::Success(info),
                Err(e) => FetchOutcome::Failed(FetchError::Malformed(e.to_string())),
            },
            Err(e) => FetchOutcome::Failed(e),
        }
    }

    async fn get_comfy_nodes(
        &self,
        node_id: &str,
        version: &str,
    ) -> FetchOutcome<Vec<NodeMetadata>> {
        let path = format!("/nodes/{node_id}/versions/{version}/comfy-nodes");
        let mut collected: Vec<NodeMetadata> = Vec::new();
        let mut page = 1u32;
        let mut total: Option<u32> = None;

        while page <= self.config.max_metadata_pages {
            let body = match self
                .get_json(&path, &[("page", page.to_string())], self.config.max_retries)
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    // A partial list would be cached as complete, so fail whole.
                    debug!("comfy-nodes page {page} for {node_id}@{version} failed: {e}");
                    return FetchOutcome::Failed(e);
                }
            };
            let items = body
                .get("comfy_nodes")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let batch: Vec<NodeMetadata> = parse_items(items, "comfy node");
            let page_was_empty = items.is_empty();
            collected.extend(batch);

            let last_page = *total.get_or_insert_with(|| total_pages(&body).unwrap_or(1));
            if page >= last_page || page_was_empty {
                break;
            }
            page += 1;
        }
        if page > self.config.max_metadata_pages {
            warn!(
                "{node_id}@{version}: stopped after {} metadata pages",
                self.config.max_metadata_pages
            );
        }
        FetchOutcome::from_list(collected)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
