//! Runtime configuration for the cache builder, registry client, scoring and
//! the update orchestrator.
//!
//! Every struct has a `Default` carrying the production values. `from_env`
//! overlays `NODEMAP_*` environment variables on top of those defaults; the
//! CLI applies its own flags last.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{NodemapError, NodemapResult};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_REGISTRY_URL: &str = "https://api.comfy.org";
pub const DEFAULT_COMMUNITY_MAP_URL: &str =
    "https://raw.githubusercontent.com/ltdrdata/ComfyUI-Manager/main/extension-node-map.json";

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 20;
pub const DEFAULT_NODES_PER_PAGE: u32 = 100;
pub const DEFAULT_PAGE_RETRIES: u32 = 5;
pub const DEFAULT_CLIENT_RETRIES: u32 = 3;

/// Hours after which an unchanged node is re-checked anyway.
pub const DEFAULT_REFRESH_AFTER_HOURS: i64 = 24;

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

pub(crate) fn optional_env(key: &str) -> NodemapResult<Option<String>> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(NodemapError::Config(format!("failed to read {key}: {e}"))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> NodemapResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.trim().parse().map_err(|e| NodemapError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

fn env_flag(key: &str, default: bool) -> NodemapResult<bool> {
    match optional_env(key)? {
        Some(val) => {
            let v = val.trim().to_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(NodemapError::InvalidValue {
                    key: key.to_string(),
                    message: format!("expected a boolean, got {val:?}"),
                }),
            }
        }
        None => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> NodemapResult<Duration> {
    let ms = parse_optional_env::<u64>(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn env_secs(key: &str, default: Duration) -> NodemapResult<Duration> {
    let secs = parse_optional_env::<u64>(key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}

// ---------------------------------------------------------------------------
// Cache builder
// ---------------------------------------------------------------------------

/// Which of the three cache-building phases run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSelection {
    pub nodes: bool,
    pub versions: bool,
    pub metadata: bool,
}

impl Default for PhaseSelection {
    fn default() -> Self {
        Self {
            nodes: true,
            versions: true,
            metadata: true,
        }
    }
}

impl PhaseSelection {
    pub fn describe(&self) -> String {
        let mut active = Vec::new();
        if self.nodes {
            active.push("basic info");
        }
        if self.versions {
            active.push("versions");
        }
        if self.metadata {
            active.push("metadata");
        }
        if active.is_empty() {
            "none".to_string()
        } else {
            active.join(", ")
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Width of each fan-out group in phases 2 and 3.
    pub concurrency: usize,
    /// Nodes per batch; the cache is saved after every batch.
    pub checkpoint_interval: usize,
    pub node_timeout: Duration,
    pub batch_timeout: Duration,
    /// Newest versions per node that get metadata. `None` means all.
    pub max_versions: Option<usize>,
    pub nodes_per_page: u32,
    pub max_pages: Option<u32>,
    /// Delay after each versions call.
    pub rate_limit_delay: Duration,
    /// Delay after each install-info call.
    pub install_delay: Duration,
    /// Delay after each per-version metadata call.
    pub metadata_delay: Duration,
    /// Delay after each successfully fetched listing page.
    pub page_delay: Duration,
    pub page_retries: u32,
    /// First backoff step for listing pages; each retry multiplies it by 3.
    pub page_backoff: Duration,
    pub refresh_after: chrono::Duration,
    pub force_metadata_refresh: bool,
    /// Restrict phase 3 to these node ids.
    pub metadata_targets: Option<Vec<String>>,
    pub phases: PhaseSelection,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            node_timeout: Duration::from_secs(300),
            batch_timeout: Duration::from_secs(600),
            max_versions: None,
            nodes_per_page: DEFAULT_NODES_PER_PAGE,
            max_pages: None,
            rate_limit_delay: Duration::from_millis(100),
            install_delay: Duration::from_millis(20),
            metadata_delay: Duration::from_millis(50),
            page_delay: Duration::from_secs(2),
            page_retries: DEFAULT_PAGE_RETRIES,
            page_backoff: Duration::from_secs(3),
            refresh_after: chrono::Duration::hours(DEFAULT_REFRESH_AFTER_HOURS),
            force_metadata_refresh: false,
            metadata_targets: None,
            phases: PhaseSelection::default(),
        }
    }
}

impl BuilderConfig {
    pub fn from_env() -> NodemapResult<Self> {
        let d = Self::default();
        let max_versions = parse_optional_env::<i64>("NODEMAP_MAX_VERSIONS", -1)?;
        let max_pages = parse_optional_env::<u32>("NODEMAP_MAX_PAGES", 0)?;
        let refresh_hours =
            parse_optional_env::<i64>("NODEMAP_REFRESH_AFTER_HOURS", DEFAULT_REFRESH_AFTER_HOURS)?;

        let config = Self {
            concurrency: parse_optional_env("NODEMAP_CONCURRENCY", d.concurrency)?,
            checkpoint_interval: parse_optional_env(
                "NODEMAP_CHECKPOINT_INTERVAL",
                d.checkpoint_interval,
            )?,
            node_timeout: env_secs("NODEMAP_NODE_TIMEOUT_SECS", d.node_timeout)?,
            batch_timeout: env_secs("NODEMAP_BATCH_TIMEOUT_SECS", d.batch_timeout)?,
            max_versions: (max_versions > 0).then_some(max_versions as usize),
            nodes_per_page: parse_optional_env("NODEMAP_NODES_PER_PAGE", d.nodes_per_page)?,
            max_pages: (max_pages > 0).then_some(max_pages),
            rate_limit_delay: env_millis("NODEMAP_RATE_LIMIT_DELAY_MS", d.rate_limit_delay)?,
            install_delay: env_millis("NODEMAP_INSTALL_DELAY_MS", d.install_delay)?,
            metadata_delay: env_millis("NODEMAP_METADATA_DELAY_MS", d.metadata_delay)?,
            page_delay: env_millis("NODEMAP_PAGE_DELAY_MS", d.page_delay)?,
            page_retries: parse_optional_env("NODEMAP_PAGE_RETRIES", d.page_retries)?,
            page_backoff: env_millis("NODEMAP_PAGE_BACKOFF_MS", d.page_backoff)?,
            refresh_after: chrono::Duration::hours(refresh_hours),
            force_metadata_refresh: env_flag("NODEMAP_FORCE_METADATA_REFRESH", false)?,
            metadata_targets: None,
            phases: PhaseSelection::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NodemapResult<()> {
        if self.concurrency == 0 {
            return Err(NodemapError::Config("concurrency must be at least 1".into()));
        }
        if self.checkpoint_interval == 0 {
            return Err(NodemapError::Config(
                "checkpoint_interval must be at least 1".into(),
            ));
        }
        if self.nodes_per_page == 0 {
            return Err(NodemapError::Config("nodes_per_page must be at least 1".into()));
        }
        if self.page_retries == 0 {
            return Err(NodemapError::Config("page_retries must be at least 1".into()));
        }
        Ok(())
    }

    /// Config with every delay zeroed, for tests and local replays.
    pub fn without_delays(mut self) -> Self {
        self.rate_limit_delay = Duration::ZERO;
        self.install_delay = Duration::ZERO;
        self.metadata_delay = Duration::ZERO;
        self.page_delay = Duration::ZERO;
        self.page_backoff = Duration::ZERO;
        self
    }
}

// ---------------------------------------------------------------------------
// Registry client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Upper bound on comfy-nodes pages fetched for a single version.
    pub max_metadata_pages: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REGISTRY_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retries: DEFAULT_CLIENT_RETRIES,
            retry_backoff: Duration::from_secs(1),
            max_metadata_pages: 100,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> NodemapResult<Self> {
        let d = Self::default();
        Ok(Self {
            base_url: optional_env("NODEMAP_REGISTRY_URL")?.unwrap_or(d.base_url),
            request_timeout: env_secs("NODEMAP_REQUEST_TIMEOUT_SECS", d.request_timeout)?,
            connect_timeout: env_secs("NODEMAP_CONNECT_TIMEOUT_SECS", d.connect_timeout)?,
            max_retries: parse_optional_env("NODEMAP_MAX_RETRIES", d.max_retries)?,
            retry_backoff: env_millis("NODEMAP_RETRY_BACKOFF_MS", d.retry_backoff)?,
            max_metadata_pages: d.max_metadata_pages,
        })
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Popularity weights and recency steps used for ranking.
///
/// `recency_steps` is read in order: the first step whose day bound is
/// strictly greater than the package age wins, otherwise `stale_multiplier`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringPolicy {
    pub download_divisor: f64,
    pub star_weight: f64,
    pub min_score: f64,
    pub recency_steps: Vec<(i64, f64)>,
    pub stale_multiplier: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            download_divisor: 10.0,
            star_weight: 2.0,
            min_score: 0.1,
            recency_steps: vec![(90, 1.0), (180, 0.95), (365, 0.85), (730, 0.70)],
            stale_multiplier: 0.50,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub data_dir: PathBuf,
    pub incremental: bool,
    pub community_map_url: String,
    pub community_timeout: Duration,
    pub builder: BuilderConfig,
    pub client: ClientConfig,
    pub scoring: ScoringPolicy,
}

impl OrchestratorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let builder = BuilderConfig {
            concurrency: 5,
            checkpoint_interval: 3000,
            max_versions: Some(10),
            nodes_per_page: 200,
            ..BuilderConfig::default()
        };
        Self {
            data_dir: data_dir.into(),
            incremental: true,
            community_map_url: DEFAULT_COMMUNITY_MAP_URL.to_string(),
            community_timeout: Duration::from_secs(30),
            builder,
            client: ClientConfig::default(),
            scoring: ScoringPolicy::default(),
        }
    }

    pub fn cache_file(&self) -> PathBuf {
        self.data_dir.join("full_registry_cache.json")
    }

    pub fn mappings_file(&self) -> PathBuf {
        self.data_dir.join("node_mappings.json")
    }

    pub fn community_file(&self) -> PathBuf {
        self.data_dir.join(".temp_extension-node-map.json")
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join(".update_state.json")
    }
}

#[cfg(test)]
pub(crate) static ENV_MUTEX: parking_lot::Mutex<()> = parking_lot::const_mutex(());
