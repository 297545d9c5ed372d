//! End-to-end update over a data directory.
//!
//! Order: registry cache, community map download, mapping build,
//! augmentation, run-state file. The downloaded community map and stray
//! temp files are removed whether the run succeeds or not.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::community::{download_community_map, CommunityMapSource, HttpCommunitySource};
use crate::config::OrchestratorConfig;
use crate::errors::{NodemapError, NodemapResult};
use crate::indexer::CacheBuilder;
use crate::mapping::{AugmentStats, Augmenter, MappingBuilder};
use crate::models::format_timestamp;
use crate::registry::{HttpRegistryClient, RegistryClient};
use crate::store::{file_sha256, remove_temp_files, write_json_atomic, CacheStore};

/// Counters and timings of one update run, written to the state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateStats {
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub incremental: bool,
    pub cache_duration_secs: f64,
    pub cache_size_mb: f64,
    pub total_packages: usize,
    pub total_versions: usize,
    pub total_metadata: usize,
    pub failed_nodes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_extensions: Option<usize>,
    #[serde(default)]
    pub community_fetch_failed: bool,
    pub mappings_duration_secs: f64,
    pub mappings_size_mb: f64,
    pub total_signatures: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub augmentation_duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes_added_from_community: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_packages_created: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_mappings_size_mb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDigest {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

/// Contents of `.update_state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateState {
    pub last_update: UpdateStats,
    pub files: IndexMap<String, ArtifactDigest>,
}

fn size_mb(path: &Path) -> f64 {
    let bytes = std::fs::metadata(path).map_or(0, |m| m.len());
    (bytes as f64 / 1024.0 / 1024.0 * 100.0).round() / 100.0
}

fn digest(path: &Path) -> NodemapResult<ArtifactDigest> {
    Ok(ArtifactDigest {
        path: path.display().to_string(),
        bytes: std::fs::metadata(path)?.len(),
        sha256: file_sha256(path)?,
    })
}

pub struct Orchestrator<C: RegistryClient + ?Sized> {
    config: OrchestratorConfig,
    client: Arc<C>,
    community: Arc<dyn CommunityMapSource>,
}

impl Orchestrator<HttpRegistryClient> {
    /// Production wiring: HTTP registry client and HTTP community source.
    pub fn from_config(config: OrchestratorConfig) -> NodemapResult<Self> {
        let client = Arc::new(HttpRegistryClient::new(config.client.clone())?);
        let community = Arc::new(HttpCommunitySource::new(
            config.community_map_url.clone(),
            config.community_timeout,
        )?);
        Ok(Self::new(config, client, community))
    }
}

impl<C: RegistryClient + ?Sized> Orchestrator<C> {
    pub fn new(
        config: OrchestratorConfig,
        client: Arc<C>,
        community: Arc<dyn CommunityMapSource>,
    ) -> Self {
        Self {
            config,
            client,
            community,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn run_update(&self) -> NodemapResult<UpdateStats> {
        info!("starting registry update in {}", self.config.data_dir.display());
        info!("incremental mode: {}", self.config.incremental);
        std::fs::create_dir_all(&self.config.data_dir)?;

        let mut stats = UpdateStats {
            started_at: format_timestamp(Utc::now()),
            incremental: self.config.incremental,
            ..UpdateStats::default()
        };
        let result = self.run_steps(&mut stats).await;
        self.cleanup();

        match result {
            Ok(()) => {
                info!("registry update completed");
                Ok(stats)
            }
            Err(e) => {
                error!("registry update failed: {e}");
                Err(e)
            }
        }
    }

    async fn run_steps(&self, stats: &mut UpdateStats) -> NodemapResult<()> {
        self.update_cache(stats).await?;
        let community_ready = self.fetch_community(stats).await;
        self.build_mappings(stats)?;
        if community_ready {
            self.augment(stats)?;
        } else {
            warn!("community map unavailable, skipping augmentation");
        }
        self.save_state(stats)
    }

    async fn update_cache(&self, stats: &mut UpdateStats) -> NodemapResult<()> {
        info!("updating registry cache");
        let started = Instant::now();
        let cache_path = self.config.cache_file();
        let builder = CacheBuilder::new(
            self.client.clone(),
            self.config.builder.clone(),
            CacheStore::new(&cache_path),
        )?;
        if self.config.incremental {
            let loaded = builder.resume()?;
            info!("incremental update from {loaded} cached nodes");
        }
        let build = builder.run().await?;

        stats.cache_duration_secs = started.elapsed().as_secs_f64();
        stats.cache_size_mb = size_mb(&cache_path);
        stats.total_packages = build.totals.node_count;
        stats.total_versions = build.totals.versions_processed;
        stats.total_metadata = build.totals.metadata_entries;
        stats.failed_nodes = build.failed_nodes.len();
        Ok(())
    }

    /// Download the community map. A failure is logged, not propagated.
    async fn fetch_community(&self, stats: &mut UpdateStats) -> bool {
        info!("fetching community extension map");
        let path = self.config.community_file();
        match download_community_map(self.community.as_ref(), &path, true, Utc::now()).await {
            Ok(count) => {
                stats.community_extensions = Some(count);
                true
            }
            Err(e) => {
                warn!("could not fetch community map: {e}");
                stats.community_fetch_failed = true;
                false
            }
        }
    }

    fn build_mappings(&self, stats: &mut UpdateStats) -> NodemapResult<()> {
        info!("generating node mappings");
        let cache_path = self.config.cache_file();
        if !cache_path.exists() {
            return Err(NodemapError::MissingInput(cache_path));
        }
        let started = Instant::now();
        let mappings_path = self.config.mappings_file();
        let built = MappingBuilder::new(self.config.scoring.clone())
            .build_file(&cache_path, &mappings_path)?;

        stats.mappings_duration_secs = started.elapsed().as_secs_f64();
        stats.mappings_size_mb = size_mb(&mappings_path);
        stats.total_signatures = built.signatures;
        Ok(())
    }

    fn augment(&self, stats: &mut UpdateStats) -> NodemapResult<AugmentStats> {
        info!("augmenting mappings with community data");
        let started = Instant::now();
        let mappings_path = self.config.mappings_file();
        let augmented = Augmenter::new(self.config.scoring.clone()).augment_file(
            &mappings_path,
            &self.config.community_file(),
            &mappings_path,
        )?;
        augmented.log_summary();

        stats.augmentation_duration_secs = Some(started.elapsed().as_secs_f64());
        stats.nodes_added_from_community = Some(augmented.nodes_added);
        stats.synthetic_packages_created = Some(augmented.synthetic_packages_created);
        stats.final_mappings_size_mb = Some(size_mb(&mappings_path));
        Ok(augmented)
    }

    fn save_state(&self, stats: &mut UpdateStats) -> NodemapResult<()> {
        stats.completed_at = Some(format_timestamp(Utc::now()));

        let mut files = IndexMap::new();
        files.insert("cache".to_string(), digest(&self.config.cache_file())?);
        files.insert("mappings".to_string(), digest(&self.config.mappings_file())?);
        let state = UpdateState {
            last_update: stats.clone(),
            files,
        };
        let path = self.config.state_file();
        write_json_atomic(&path, &state)?;
        info!("state saved to {}", path.display());
        Ok(())
    }

    fn cleanup(&self) {
        let community = self.config.community_file();
        if community.exists() {
            match std::fs::remove_file(&community) {
                Ok(()) => info!("removed downloaded community map"),
                Err(e) => warn!("failed to remove {}: {e}", community.display()),
            }
        }
        let swept = remove_temp_files(&self.config.data_dir);
        if swept > 0 {
            info!("removed {swept} stray temp file(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeInfo, NodeMetadata, VersionRecord};
    use crate::registry::{FetchOutcome, ScriptedRegistry};
    use crate::store::read_json;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct FixedCommunity(Option<Value>);

    #[async_trait]
    impl CommunityMapSource for FixedCommunity {
        fn origin(&self) -> String {
            "memory://community".into()
        }

        async fn fetch(&self) -> NodemapResult<IndexMap<String, Value>> {
            match &self.0 {
                Some(Value::Object(map)) => Ok(map.clone().into_iter().collect()),
                _ => Err(NodemapError::Fetch("offline".into())),
            }
        }
    }

    fn registry() -> Arc<ScriptedRegistry> {
        let registry = ScriptedRegistry::with_nodes(vec![NodeInfo {
            id: "math-pack".into(),
            name: "Math Pack".into(),
            repository: "https://github.com/acme/math-pack".into(),
            downloads: 1000,
            github_stars: 10,
            latest_version: Some(json!({"version": "1.0.0"})),
            ..NodeInfo::default()
        }]);
        registry.set_versions(
            "math-pack",
            FetchOutcome::Success(vec![VersionRecord {
                api_download_url: "https://cdn/math-1.zip".into(),
                ..VersionRecord::new("1.0.0", "2025-05-01T00:00:00Z")
            }]),
        );
        registry.set_comfy_nodes(
            "math-pack",
            "1.0.0",
            FetchOutcome::Success(vec![NodeMetadata::new("IntToFloat", Value::Null)]),
        );
        Arc::new(registry)
    }

    fn config(dir: &Path) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new(dir);
        config.builder = config.builder.without_delays();
        config
    }

    #[tokio::test]
    async fn test_full_update_writes_artifacts_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let community = Arc::new(FixedCommunity(Some(json!({
            "https://github.com/acme/math-pack": [["IntToFloat", "FloatToInt"]],
            "https://github.com/x/y": [["Foo"], {"title_aux": "Y"}],
        }))));
        let orchestrator = Orchestrator::new(config(dir.path()), registry(), community);
        let stats = orchestrator.run_update().await.unwrap();

        assert_eq!(stats.total_packages, 1);
        assert_eq!(stats.community_extensions, Some(2));
        assert_eq!(stats.nodes_added_from_community, Some(2));
        assert_eq!(stats.synthetic_packages_created, Some(1));
        assert!(stats.completed_at.is_some());

        let cfg = orchestrator.config();
        assert!(!cfg.community_file().exists());
        let state: UpdateState = read_json(&cfg.state_file()).unwrap();
        assert_eq!(state.files["cache"].sha256, file_sha256(&cfg.cache_file()).unwrap());
        assert_eq!(
            state.files["mappings"].sha256,
            file_sha256(&cfg.mappings_file()).unwrap()
        );

        let mapping: Value = read_json(&cfg.mappings_file()).unwrap();
        assert_eq!(mapping["mappings"]["FloatToInt::_"][0]["source"], "manager");
        assert_eq!(mapping["mappings"]["Foo::_"][0]["package_id"], "manager_x_y");
        assert!(mapping["mappings"]["IntToFloat::_"][0].get("source").is_none());
    }

    #[tokio::test]
    async fn test_community_failure_skips_augmentation() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            config(dir.path()),
            registry(),
            Arc::new(FixedCommunity(None)),
        );
        let stats = orchestrator.run_update().await.unwrap();

        assert!(stats.community_fetch_failed);
        assert!(stats.augmentation_duration_secs.is_none());
        let mapping: Value = read_json(&orchestrator.config().mappings_file()).unwrap();
        assert!(mapping["stats"].get("augmented").is_none());
    }

    #[tokio::test]
    async fn test_incremental_rerun_skips_unchanged_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let community = Arc::new(FixedCommunity(None));
        let orchestrator = Orchestrator::new(config(dir.path()), registry.clone(), community);

        orchestrator.run_update().await.unwrap();
        registry.clear_calls();
        orchestrator.run_update().await.unwrap();

        assert_eq!(registry.call_count("list:"), 1);
        assert_eq!(registry.call_count("versions:"), 0);
        assert_eq!(registry.call_count("comfy:"), 0);
    }

    #[tokio::test]
    async fn test_failure_still_removes_community_and_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.builder.concurrency = 0;
        std::fs::write(cfg.community_file(), "{}").unwrap();
        std::fs::write(dir.path().join("leftover.tmp"), "x").unwrap();

        let orchestrator = Orchestrator::new(
            cfg,
            registry(),
            Arc::new(FixedCommunity(None)),
        );
        assert!(orchestrator.run_update().await.is_err());
        assert!(!orchestrator.config().community_file().exists());
        assert!(!dir.path().join("leftover.tmp").exists());
    }
}
