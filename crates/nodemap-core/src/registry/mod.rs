//! Registry access seam.
//!
//! The cache builder only talks to [`RegistryClient`]; the HTTP
//! implementation lives in [`http`] and a scripted in-memory one in
//! [`memory`]. Per-version lookups return a tri-state [`FetchOutcome`] so a
//! confirmed-empty answer is never confused with a failed request.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{null_as_default, NodeInfo, NodeMetadata, VersionRecord};

pub use http::HttpRegistryClient;
pub use memory::ScriptedRegistry;

/// Why a registry call produced no usable answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Timeouts, connection failures, 429 and 5xx. Worth retrying later.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Any other non-success status. Not retried.
    #[error("rejected with status {status}: {message}")]
    Permanent { status: u16, message: String },
    /// The response arrived but did not have the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Result of a per-node or per-version lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    Failed(FetchError),
    ConfirmedEmpty,
    Success(T),
}

impl<T> FetchOutcome<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, FetchOutcome::Failed(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchOutcome<U> {
        match self {
            FetchOutcome::Failed(e) => FetchOutcome::Failed(e),
            FetchOutcome::ConfirmedEmpty => FetchOutcome::ConfirmedEmpty,
            FetchOutcome::Success(v) => FetchOutcome::Success(f(v)),
        }
    }
}

impl<T> FetchOutcome<Vec<T>> {
    /// `Success` for a non-empty list, `ConfirmedEmpty` otherwise.
    pub fn from_list(items: Vec<T>) -> Self {
        if items.is_empty() {
            FetchOutcome::ConfirmedEmpty
        } else {
            FetchOutcome::Success(items)
        }
    }
}

/// One page of the registry listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePage {
    pub nodes: Vec<NodeInfo>,
    /// Total page count reported by the registry, when present.
    pub total_pages: Option<u32>,
}

/// Install payload for one version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallInfo {
    #[serde(
        rename = "downloadUrl",
        alias = "download_url",
        default,
        deserialize_with = "null_as_default"
    )]
    pub download_url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub dependencies: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub install_type: String,
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn list_nodes(&self, page: u32, page_size: u32) -> Result<NodePage, FetchError>;

    async fn get_node_versions(&self, node_id: &str) -> FetchOutcome<Vec<VersionRecord>>;

    async fn get_install_info(&self, node_id: &str, version: &str) -> FetchOutcome<InstallInfo>;

    async fn get_comfy_nodes(&self, node_id: &str, version: &str)
        -> FetchOutcome<Vec<NodeMetadata>>;
}
