//! Community extension map: parsing, and the downloader that stores it
//! wrapped with fetch metadata.
//!
//! The map is `{repo_url: [[node_name, ...], {title_aux|title, author,
//! description}?]}`. A downloaded copy is written wrapped as
//! `{fetched_at, source, extension_count, extensions}`; both shapes load.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::{NodemapError, NodemapResult};
use crate::models::{format_timestamp, parse_timestamp};
use crate::store::{read_json, write_json_atomic};

/// A downloaded map younger than this is reused unless forced.
pub const COMMUNITY_MAX_AGE_HOURS: i64 = 6;

/// On-disk wrapper written by the downloader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedCommunityMap {
    pub fetched_at: String,
    pub source: String,
    pub extension_count: usize,
    pub extensions: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommunityMap {
    pub fetched_at: Option<String>,
    pub extensions: IndexMap<String, Value>,
}

impl CommunityMap {
    /// Accept the wrapped shape or a raw URL-keyed object.
    pub fn from_value(value: Value) -> NodemapResult<Self> {
        let Value::Object(mut object) = value else {
            return Err(NodemapError::InvalidData(
                "community map must be a JSON object".into(),
            ));
        };
        if let Some(Value::Object(_)) = object.get("extensions") {
            let fetched_at = object
                .get("fetched_at")
                .and_then(Value::as_str)
                .map(str::to_string);
            let extensions = match object.remove("extensions") {
                Some(Value::Object(map)) => map.into_iter().collect(),
                _ => IndexMap::new(),
            };
            return Ok(Self {
                fetched_at,
                extensions,
            });
        }
        Ok(Self {
            fetched_at: None,
            extensions: object.into_iter().collect(),
        })
    }

    pub fn load(path: &Path) -> NodemapResult<Self> {
        let map = Self::from_value(read_json(path)?)?;
        info!(
            "loaded {} community extensions (fetched: {})",
            map.len(),
            map.fetched_at.as_deref().unwrap_or("unknown")
        );
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

/// One well-formed community entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommunityEntry {
    pub node_names: Vec<String>,
    /// Elements of the name list that were not strings.
    pub skipped_names: usize,
    pub title: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
}

fn non_empty_str(meta: Option<&serde_json::Map<String, Value>>, key: &str) -> Option<String> {
    meta.and_then(|m| m.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse `[[names...], {meta}?]`. The error names what was wrong.
pub fn parse_entry(value: &Value) -> Result<CommunityEntry, String> {
    let Value::Array(parts) = value else {
        return Err("entry is not a list".into());
    };
    let Some(Value::Array(names)) = parts.first() else {
        return Err("first element is not a list of node names".into());
    };
    let meta = parts.get(1).and_then(Value::as_object);

    let mut entry = CommunityEntry {
        title: non_empty_str(meta, "title_aux").or_else(|| non_empty_str(meta, "title")),
        author: non_empty_str(meta, "author"),
        description: non_empty_str(meta, "description"),
        ..CommunityEntry::default()
    };
    for name in names {
        match name.as_str() {
            Some(s) if !s.is_empty() => entry.node_names.push(s.to_string()),
            _ => entry.skipped_names += 1,
        }
    }
    Ok(entry)
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CommunityMapSource: Send + Sync {
    /// Where the map comes from, recorded in the wrapper.
    fn origin(&self) -> String;

    async fn fetch(&self) -> NodemapResult<IndexMap<String, Value>>;
}

pub struct HttpCommunitySource {
    client: reqwest::Client,
    url: String,
}

impl HttpCommunitySource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> NodemapResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CommunityMapSource for HttpCommunitySource {
    fn origin(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> NodemapResult<IndexMap<String, Value>> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NodemapError::Fetch(format!(
                "community map request returned HTTP {status}"
            )));
        }
        // Raw GitHub content is served as text/plain.
        let text = response.text().await?;
        match serde_json::from_str::<Value>(&text)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(NodemapError::InvalidData(
                "community map must be a JSON object".into(),
            )),
        }
    }
}

/// Whether a wrapped map at `path` was fetched less than `max_age` ago.
pub fn is_fresh(path: &Path, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    let Ok(wrapped) = read_json::<WrappedCommunityMap>(path) else {
        return false;
    };
    parse_timestamp(&wrapped.fetched_at).is_some_and(|at| now - at < max_age)
}

/// Fetch the map and store it wrapped at `path`. Returns the extension count.
///
/// Without `force`, a fresh existing download is kept.
pub async fn download_community_map(
    source: &dyn CommunityMapSource,
    path: &Path,
    force: bool,
    now: DateTime<Utc>,
) -> NodemapResult<usize> {
    if !force && is_fresh(path, now, chrono::Duration::hours(COMMUNITY_MAX_AGE_HOURS)) {
        let existing = CommunityMap::load(path)?;
        info!("community map is recent, skipping download");
        return Ok(existing.len());
    }

    info!("fetching community map from {}", source.origin());
    let extensions = source.fetch().await?;
    if extensions.is_empty() {
        warn!("community map is empty");
    }
    let wrapped = WrappedCommunityMap {
        fetched_at: format_timestamp(now),
        source: source.origin(),
        extension_count: extensions.len(),
        extensions,
    };
    write_json_atomic(path, &wrapped)?;
    info!("stored {} community extensions", wrapped.extension_count);
    Ok(wrapped.extension_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticSource {
        data: Value,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommunityMapSource for StaticSource {
        fn origin(&self) -> String {
            "memory://community".into()
        }

        async fn fetch(&self) -> NodemapResult<IndexMap<String, Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.data.clone() {
                Value::Object(map) => Ok(map.into_iter().collect()),
                _ => Err(NodemapError::InvalidData("not an object".into())),
            }
        }
    }

    #[test]
    fn test_raw_and_wrapped_load_the_same() {
        let raw = json!({"https://github.com/x/y": [["Foo"], {"title_aux": "Y"}]});
        let wrapped = json!({
            "fetched_at": "2025-01-01T00:00:00Z",
            "source": "somewhere",
            "extension_count": 1,
            "extensions": raw.clone(),
        });
        let a = CommunityMap::from_value(raw).unwrap();
        let b = CommunityMap::from_value(wrapped).unwrap();
        assert_eq!(a.extensions, b.extensions);
        assert!(a.fetched_at.is_none());
        assert_eq!(b.fetched_at.as_deref(), Some("2025-01-01T00:00:00Z"));
        assert!(CommunityMap::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_parse_entry_shapes() {
        let entry = parse_entry(&json!([["A", 3, "B", ""], {"title": "T", "author": "me"}])).unwrap();
        assert_eq!(entry.node_names, vec!["A", "B"]);
        assert_eq!(entry.skipped_names, 2);
        assert_eq!(entry.title.as_deref(), Some("T"));
        assert_eq!(entry.author.as_deref(), Some("me"));

        let aux = parse_entry(&json!([["A"], {"title_aux": "Aux", "title": "Plain"}])).unwrap();
        assert_eq!(aux.title.as_deref(), Some("Aux"));

        let bare = parse_entry(&json!([["A"]])).unwrap();
        assert!(bare.title.is_none());

        assert!(parse_entry(&json!({"nodes": ["A"]})).is_err());
        assert!(parse_entry(&json!([])).is_err());
        assert!(parse_entry(&json!(["A", "B"])).is_err());
    }

    #[tokio::test]
    async fn test_download_wraps_and_respects_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("community.json");
        let source = StaticSource {
            data: json!({"https://github.com/x/y": [["Foo"]]}),
            calls: AtomicUsize::new(0),
        };
        let now = Utc::now();

        assert_eq!(download_community_map(&source, &path, false, now).await.unwrap(), 1);
        let stored: WrappedCommunityMap = read_json(&path).unwrap();
        assert_eq!(stored.source, "memory://community");
        assert_eq!(stored.extension_count, 1);

        download_community_map(&source, &path, false, now).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        download_community_map(&source, &path, true, now).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
