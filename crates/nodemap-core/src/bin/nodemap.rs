//! `nodemap` command line: build, augment, validate and query the node index.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use _nodemap_core::community::{download_community_map, HttpCommunitySource};
use _nodemap_core::config::{
    BuilderConfig, ClientConfig, OrchestratorConfig, PhaseSelection, ScoringPolicy,
    DEFAULT_COMMUNITY_MAP_URL,
};
use _nodemap_core::indexer::CacheBuilder;
use _nodemap_core::mapping::{Augmenter, MappingBuilder};
use _nodemap_core::models::MappingFile;
use _nodemap_core::orchestrator::Orchestrator;
use _nodemap_core::registry::HttpRegistryClient;
use _nodemap_core::store::{read_json, CacheStore};
use _nodemap_core::validate::validate_files;

#[derive(Parser, Debug)]
#[command(name = "nodemap")]
#[command(about = "Registry cache and node-type mapping index", version)]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the whole pipeline over a data directory
    Update {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Rebuild the cache from scratch instead of merging into it
        #[arg(long)]
        full: bool,
        #[arg(long, env = "NODEMAP_COMMUNITY_MAP_URL", default_value = DEFAULT_COMMUNITY_MAP_URL)]
        community_url: String,
        #[command(flatten)]
        builder: BuilderArgs,
    },
    /// Build or refresh the registry cache
    BuildCache {
        #[arg(long, default_value = "full_registry_cache.json")]
        output: PathBuf,
        /// Cache to merge into; defaults to the existing output file
        #[arg(long)]
        input: Option<PathBuf>,
        /// Ignore any existing cache
        #[arg(long)]
        fresh: bool,
        #[arg(long)]
        skip_nodes: bool,
        #[arg(long)]
        skip_versions: bool,
        #[arg(long)]
        skip_metadata: bool,
        /// Re-fetch metadata for versions that already have it
        #[arg(long)]
        force_metadata: bool,
        /// Only fetch metadata for these node ids
        #[arg(long, value_delimiter = ',')]
        targets: Vec<String>,
        #[command(flatten)]
        builder: BuilderArgs,
    },
    /// Build the signature mapping from a cache file
    BuildMappings {
        #[arg(long, default_value = "full_registry_cache.json")]
        cache: PathBuf,
        #[arg(long, default_value = "node_mappings.json")]
        output: PathBuf,
    },
    /// Merge a downloaded community map into a mapping file
    Augment {
        #[arg(long, default_value = "node_mappings.json")]
        mappings: PathBuf,
        #[arg(long)]
        community: PathBuf,
        /// Defaults to overwriting the input mapping
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Download the community extension map
    FetchCommunity {
        #[arg(long, default_value = ".temp_extension-node-map.json")]
        output: PathBuf,
        #[arg(long, env = "NODEMAP_COMMUNITY_MAP_URL", default_value = DEFAULT_COMMUNITY_MAP_URL)]
        url: String,
        /// Download even when the existing copy is recent
        #[arg(long)]
        force: bool,
    },
    /// Check cache and mapping integrity
    Validate {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long)]
        mappings: Option<PathBuf>,
    },
    /// Show the ranked packages providing a node
    Lookup {
        #[arg(long, default_value = "node_mappings.json")]
        mappings: PathBuf,
        node: String,
        /// Input type descriptor as JSON
        #[arg(long)]
        inputs: Option<String>,
    },
}

/// Cache builder overrides on top of the environment.
#[derive(Args, Debug, Default)]
struct BuilderArgs {
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    checkpoint_interval: Option<usize>,
    /// Newest versions per node to fetch metadata for; -1 for all
    #[arg(long, allow_negative_numbers = true)]
    max_versions: Option<i64>,
    #[arg(long)]
    nodes_per_page: Option<u32>,
    #[arg(long)]
    max_pages: Option<u32>,
    #[arg(long)]
    rate_limit_delay_ms: Option<u64>,
    #[arg(long)]
    node_timeout_secs: Option<u64>,
    #[arg(long)]
    batch_timeout_secs: Option<u64>,
}

impl BuilderArgs {
    fn apply(&self, config: &mut BuilderConfig) {
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if let Some(n) = self.checkpoint_interval {
            config.checkpoint_interval = n;
        }
        if let Some(n) = self.max_versions {
            config.max_versions = (n > 0).then_some(n as usize);
        }
        if let Some(n) = self.nodes_per_page {
            config.nodes_per_page = n;
        }
        if let Some(n) = self.max_pages {
            config.max_pages = (n > 0).then_some(n);
        }
        if let Some(ms) = self.rate_limit_delay_ms {
            config.rate_limit_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = self.node_timeout_secs {
            config.node_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.batch_timeout_secs {
            config.batch_timeout = Duration::from_secs(secs);
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Update {
            data_dir,
            full,
            community_url,
            builder,
        } => {
            let mut config = OrchestratorConfig::new(data_dir);
            config.incremental = !full;
            config.community_map_url = community_url;
            config.client = ClientConfig::from_env()?;
            builder.apply(&mut config.builder);

            let orchestrator = Orchestrator::from_config(config)?;
            let stats = orchestrator.run_update().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Command::BuildCache {
            output,
            input,
            fresh,
            skip_nodes,
            skip_versions,
            skip_metadata,
            force_metadata,
            targets,
            builder,
        } => {
            let mut config = BuilderConfig::from_env()?;
            builder.apply(&mut config);
            config.phases = PhaseSelection {
                nodes: !skip_nodes,
                versions: !skip_versions,
                metadata: !skip_metadata,
            };
            config.force_metadata_refresh |= force_metadata;
            if !targets.is_empty() {
                config.metadata_targets = Some(targets);
            }

            let client = Arc::new(HttpRegistryClient::new(ClientConfig::from_env()?)?);
            let mut cache = CacheBuilder::new(client, config, CacheStore::new(&output))?;
            if let Some(input) = input {
                let nodes = CacheStore::new(&input)
                    .load(Utc::now())
                    .with_context(|| format!("loading {}", input.display()))?;
                info!("merging into {} nodes from {}", nodes.len(), input.display());
                cache = cache.with_nodes(nodes.into_values());
            } else if !fresh {
                cache.resume()?;
            }
            cache.run().await?;
        }

        Command::BuildMappings { cache, output } => {
            let stats = MappingBuilder::new(ScoringPolicy::default()).build_file(&cache, &output)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Command::Augment {
            mappings,
            community,
            output,
        } => {
            let output = output.unwrap_or_else(|| mappings.clone());
            let stats = Augmenter::new(ScoringPolicy::default())
                .augment_file(&mappings, &community, &output)?;
            stats.log_summary();
        }

        Command::FetchCommunity { output, url, force } => {
            let source = HttpCommunitySource::new(url, Duration::from_secs(30))?;
            let count = download_community_map(&source, &output, force, Utc::now()).await?;
            info!("{count} community extensions available at {}", output.display());
        }

        Command::Validate {
            data_dir,
            cache,
            mappings,
        } => {
            let cache = cache.unwrap_or_else(|| data_dir.join("full_registry_cache.json"));
            let mappings = mappings.unwrap_or_else(|| data_dir.join("node_mappings.json"));
            let report = validate_files(&cache, &mappings);
            report.log();
            if !report.is_ok() {
                return Ok(ExitCode::FAILURE);
            }
        }

        Command::Lookup {
            mappings,
            node,
            inputs,
        } => {
            let mapping: MappingFile = read_json(&mappings)?;
            let inputs: Value = match inputs {
                Some(raw) => serde_json::from_str(&raw).context("--inputs is not valid JSON")?,
                None => Value::Null,
            };
            let Some(found) = mapping.resolve(&node, &inputs) else {
                println!("no package provides {node}");
                return Ok(ExitCode::FAILURE);
            };
            let kind = if found.exact { "exact" } else { "wildcard" };
            println!("{} ({kind})", found.key);
            for entry in found.entries {
                let name = mapping
                    .packages
                    .get(&entry.package_id)
                    .map_or("", |p| p.display_name.as_str());
                let source = if entry.source.is_some() { " [community]" } else { "" };
                println!("  {}. {} {name}{source}", entry.rank, entry.package_id);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
