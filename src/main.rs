//! slotcache operator CLI
//!
//! Inspects and maintains the cache regions written by slotcache clients.
//!
//! ```text
//! slotcache --config client.yaml regions
//! slotcache --config client.yaml query Catalog 'item(u64)' --page 2
//! slotcache --config client.yaml clear Catalog 'item(u64)'
//! slotcache --nodes 10.0.0.1:7000,10.0.0.2:7000 get user:42
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use slotcache::cache::{CacheKey, ManagedCache, ProducerId, RefreshRegistry};
use slotcache::cluster::hash_slot;
use slotcache::{connect_tcp, ClientConfig, Mode};

// =============================================================================
// CLI Arguments
// =============================================================================

/// slotcache - cluster-aware cache maintenance
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Client configuration file (YAML)
    #[arg(long, short, env = "SLOTCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the deployment mode (cluster, standalone, sentinel)
    #[arg(long, env = "SLOTCACHE_MODE")]
    mode: Option<Mode>,

    /// Override cluster seed nodes (host:port, comma separated)
    #[arg(long, env = "SLOTCACHE_NODES", value_delimiter = ',')]
    nodes: Vec<String>,

    /// Override the key namespace
    #[arg(long, env = "SLOTCACHE_NAMESPACE")]
    namespace: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List catalogued regions with their size
    Regions,
    /// Page through the keys of a region, soonest expiry first
    Query {
        class: String,
        method: String,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 5)]
        page_size: usize,
    },
    /// Delete every key of a region
    Clear { class: String, method: String },
    /// Keys of a region expiring within a window
    Due {
        class: String,
        method: String,
        /// Window in seconds (defaults to region.refreshThresholdSecs)
        #[arg(long)]
        within: Option<u64>,
    },
    /// Print a cached value
    Get {
        key: String,
        #[arg(long)]
        field: Option<String>,
    },
    /// Delete a cached value and its index entry
    Del {
        key: String,
        #[arg(long)]
        field: Option<String>,
    },
    /// Print the hash slot of each key
    Slot {
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    if let Cmd::Slot { keys } = &args.command {
        for key in keys {
            println!("{}\t{}", hash_slot(key.as_bytes()), key);
        }
        return Ok(());
    }

    let config = load_config(&args)?;
    debug!("Connecting in {} mode", config.mode);
    let store = connect_tcp(&config)
        .await
        .with_context(|| format!("connecting to {} store", config.mode))?;
    let cache = ManagedCache::new(store.clone(), &config, Arc::new(RefreshRegistry::new()));

    let outcome = execute(&cache, &config, args.command).await;
    store.close().await;
    outcome
}

fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if !args.nodes.is_empty() {
        config.cluster.nodes = args.nodes.clone();
    }
    if let Some(namespace) = &args.namespace {
        config.region.namespace = namespace.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn execute(cache: &Arc<ManagedCache>, config: &ClientConfig, command: Cmd) -> anyhow::Result<()> {
    match command {
        Cmd::Regions => {
            for region in cache.list_regions().await? {
                let size = cache.index().cardinality(&region.producer).await?;
                println!(
                    "{}\trefresh={}\tttl={}s\tkeys={}",
                    region.region_key, region.refresh, region.ttl_seconds, size
                );
            }
        }
        Cmd::Query {
            class,
            method,
            page,
            page_size,
        } => {
            let result = cache
                .query(&ProducerId::new(class, method), page, page_size)
                .await?;
            println!(
                "page {} ({} per page, {} total)",
                result.page, result.page_size, result.total
            );
            for key in result.keys {
                println!("{}", key.full_key());
            }
        }
        Cmd::Clear { class, method } => {
            let report = cache.clear_region(&ProducerId::new(class, method)).await?;
            println!("{}", serde_json::to_string(&report)?);
            if report.failed + report.timed_out > 0 {
                bail!("{} keys could not be deleted", report.failed + report.timed_out);
            }
        }
        Cmd::Due {
            class,
            method,
            within,
        } => {
            let window = within.unwrap_or(config.region.refresh_threshold_secs);
            let due = cache
                .index()
                .scan_due_for_refresh(&ProducerId::new(class, method), window)
                .await?;
            for key in due {
                println!("{}", key.full_key());
            }
        }
        Cmd::Get { key, field } => {
            let key = cache_key(cache, key, field);
            match cache.get::<Value>(&key).await? {
                Some(envelope) => println!("{}", serde_json::to_string_pretty(&envelope)?),
                None => bail!("{} is not cached", key),
            }
        }
        Cmd::Del { key, field } => {
            let key = cache_key(cache, key, field);
            let removed = cache.del(&key).await?;
            println!("{}", if removed { "deleted" } else { "absent" });
        }
        Cmd::Slot { .. } => {}
    }
    Ok(())
}

fn cache_key(cache: &ManagedCache, key: String, field: Option<String>) -> CacheKey {
    match field {
        Some(field) => cache.field_key(key, field),
        None => cache.key(key),
    }
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
