//! Client configuration
//!
//! Loaded from YAML (every field has a default) and validated before any
//! connection is opened. CLI flags may override individual values.
//!
//! ```yaml
//! mode: cluster
//! cluster:
//!   nodes: ["10.0.0.1:7000", "10.0.0.2:7000"]
//!   maxRedirections: 5
//! connection:
//!   quiet: true
//! region:
//!   namespace: shop
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::compression::{CompressionAlgorithm, CompressionConfig};
use crate::cluster::{Endpoint, PoolConfig};
use crate::error::{Error, Result};

// =============================================================================
// Deployment Mode
// =============================================================================

/// Which store implementation to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Cluster,
    Standalone,
    Sentinel,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Cluster => write!(f, "cluster"),
            Mode::Standalone => write!(f, "standalone"),
            Mode::Sentinel => write!(f, "sentinel"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cluster" => Ok(Mode::Cluster),
            "standalone" | "single" => Ok(Mode::Standalone),
            "sentinel" => Ok(Mode::Sentinel),
            other => Err(Error::Config(format!("unknown mode '{}'", other))),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Connection pool settings (shared by every node pool)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSettings {
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,
    /// Longest a caller waits for a free connection
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_true")]
    pub test_on_borrow: bool,
    #[serde(default)]
    pub test_on_return: bool,
    #[serde(default = "default_min_evictable_idle_ms")]
    pub min_evictable_idle_ms: u64,
    /// 0 disables the background evictor
    #[serde(default = "default_eviction_interval_ms")]
    pub eviction_interval_ms: u64,
}

fn default_max_total() -> usize {
    500
}
fn default_max_idle() -> usize {
    20
}
fn default_min_idle() -> usize {
    2
}
fn default_max_wait_ms() -> u64 {
    50
}
fn default_true() -> bool {
    true
}
fn default_min_evictable_idle_ms() -> u64 {
    10_000
}
fn default_eviction_interval_ms() -> u64 {
    30_000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_total: default_max_total(),
            max_idle: default_max_idle(),
            min_idle: default_min_idle(),
            max_wait_ms: default_max_wait_ms(),
            test_on_borrow: true,
            test_on_return: false,
            min_evictable_idle_ms: default_min_evictable_idle_ms(),
            eviction_interval_ms: default_eviction_interval_ms(),
        }
    }
}

/// Socket level settings for every mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default)]
    pub password: Option<String>,
    /// Logical database (standalone and sentinel only)
    #[serde(default)]
    pub database: u32,
    /// Log and swallow delivery failures instead of returning them
    #[serde(default)]
    pub quiet: bool,
    /// Commands slower than this are logged at warn level
    #[serde(default = "default_slow_command_ms")]
    pub slow_command_ms: u64,
}

fn default_timeout_ms() -> u64 {
    2000
}
fn default_slow_command_ms() -> u64 {
    50
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_timeout_ms(),
            socket_timeout_ms: default_timeout_ms(),
            password: None,
            database: 0,
            quiet: false,
            slow_command_ms: default_slow_command_ms(),
        }
    }
}

/// Cluster mode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSettings {
    /// Seed nodes as `host:port`
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_max_redirections")]
    pub max_redirections: usize,
}

fn default_max_redirections() -> usize {
    5
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            max_redirections: default_max_redirections(),
        }
    }
}

/// Standalone mode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandaloneSettings {
    #[serde(default = "default_standalone_address")]
    pub address: String,
}

fn default_standalone_address() -> String {
    "127.0.0.1:6379".to_string()
}

impl Default for StandaloneSettings {
    fn default() -> Self {
        Self {
            address: default_standalone_address(),
        }
    }
}

/// Sentinel mode settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentinelSettings {
    #[serde(default)]
    pub master_name: String,
    #[serde(default)]
    pub sentinels: Vec<String>,
}

/// Region index and refresh settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionSettings {
    /// Prefix for every key written by this client
    #[serde(default)]
    pub namespace: String,
    /// Entries expiring within this window are refreshed
    #[serde(default = "default_refresh_threshold_secs")]
    pub refresh_threshold_secs: u64,
    /// Per-task wait when batch work is fanned out
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Upper bound on the page size of region queries
    #[serde(default = "default_page_size_cap")]
    pub page_size_cap: usize,
    /// Keys deleted per pass when clearing a region
    #[serde(default = "default_clear_batch")]
    pub clear_batch: usize,
    /// Extra lifetime of a side record beyond its value's TTL
    #[serde(default = "default_side_record_padding_secs")]
    pub side_record_padding_secs: u64,
    /// Interval of the background refresher
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Worker fan-out for clear/refresh batches; unset runs inline
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Await fanned-out batch items before returning
    #[serde(default = "default_wait_for_tasks")]
    pub wait_for_tasks: bool,
}

fn default_refresh_threshold_secs() -> u64 {
    12
}
fn default_wait_timeout_secs() -> u64 {
    60
}
fn default_page_size_cap() -> usize {
    5
}
fn default_clear_batch() -> usize {
    6000
}
fn default_side_record_padding_secs() -> u64 {
    120
}
fn default_refresh_interval_secs() -> u64 {
    10
}
fn default_wait_for_tasks() -> bool {
    true
}

impl Default for RegionSettings {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            refresh_threshold_secs: default_refresh_threshold_secs(),
            wait_timeout_secs: default_wait_timeout_secs(),
            page_size_cap: default_page_size_cap(),
            clear_batch: default_clear_batch(),
            side_record_padding_secs: default_side_record_padding_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            concurrency: None,
            wait_for_tasks: default_wait_for_tasks(),
        }
    }
}

impl RegionSettings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

/// Value compression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionSettings {
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,
    #[serde(default = "default_threshold_bytes")]
    pub threshold_bytes: usize,
    #[serde(default = "default_level")]
    pub level: u32,
}

/// Stored values are compressed strictly above this size
pub const COMPRESSION_THRESHOLD: usize = 1024;

fn default_threshold_bytes() -> usize {
    COMPRESSION_THRESHOLD
}
fn default_level() -> u32 {
    6
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::default(),
            threshold_bytes: default_threshold_bytes(),
            level: default_level(),
        }
    }
}

impl CompressionSettings {
    pub fn to_config(&self) -> CompressionConfig {
        CompressionConfig {
            algorithm: self.algorithm,
            threshold_bytes: self.threshold_bytes,
            level: self.level,
        }
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Complete client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub standalone: StandaloneSettings,
    #[serde(default)]
    pub sentinel: SentinelSettings,
    #[serde(default)]
    pub region: RegionSettings,
    #[serde(default)]
    pub compression: CompressionSettings,
}

impl ClientConfig {
    /// Parse and validate YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_total == 0 {
            return Err(Error::Config("pool.maxTotal must be > 0".into()));
        }
        if self.pool.max_idle > self.pool.max_total {
            return Err(Error::Config("pool.maxIdle must be <= pool.maxTotal".into()));
        }
        if self.pool.min_idle > self.pool.max_idle {
            return Err(Error::Config("pool.minIdle must be <= pool.maxIdle".into()));
        }
        if self.cluster.max_redirections == 0 {
            return Err(Error::Config("cluster.maxRedirections must be > 0".into()));
        }
        if self.region.page_size_cap == 0 {
            return Err(Error::Config("region.pageSizeCap must be > 0".into()));
        }
        if self.region.clear_batch == 0 {
            return Err(Error::Config("region.clearBatch must be > 0".into()));
        }
        if self.region.concurrency == Some(0) {
            return Err(Error::Config("region.concurrency must be > 0 when set".into()));
        }
        if self.compression.threshold_bytes != COMPRESSION_THRESHOLD {
            return Err(Error::Config(format!(
                "compression.thresholdBytes is fixed at {}",
                COMPRESSION_THRESHOLD
            )));
        }

        match self.mode {
            Mode::Cluster => {
                if self.seed_endpoints()?.is_empty() {
                    return Err(Error::Config("cluster.nodes must not be empty".into()));
                }
            }
            Mode::Standalone => {
                self.standalone.address.parse::<Endpoint>()?;
            }
            Mode::Sentinel => {
                if self.sentinel.master_name.is_empty() {
                    return Err(Error::Config("sentinel.masterName must be set".into()));
                }
                if self.sentinel_endpoints()?.is_empty() {
                    return Err(Error::Config("sentinel.sentinels must not be empty".into()));
                }
            }
        }
        Ok(())
    }

    pub fn seed_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.cluster.nodes.iter().map(|n| n.parse()).collect()
    }

    pub fn sentinel_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.sentinel.sentinels.iter().map(|n| n.parse()).collect()
    }

    /// Attempt budget: the configured redirection limit, capped by the seed count
    pub fn max_attempts(&self) -> usize {
        let nodes = self.cluster.nodes.len().max(1);
        self.cluster.max_redirections.min(nodes).max(1)
    }

    pub fn pool_config(&self) -> PoolConfig {
        let p = &self.pool;
        PoolConfig {
            max_total: p.max_total,
            max_idle: p.max_idle,
            min_idle: p.min_idle,
            max_wait: Duration::from_millis(p.max_wait_ms),
            test_on_borrow: p.test_on_borrow,
            test_on_return: p.test_on_return,
            min_evictable_idle: Duration::from_millis(p.min_evictable_idle_ms),
            eviction_interval: (p.eviction_interval_ms > 0)
                .then(|| Duration::from_millis(p.eviction_interval_ms)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.connect_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.socket_timeout_ms)
    }

    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.connection.slow_command_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.mode, Mode::Cluster);
        assert_eq!(config.pool.max_total, 500);
        assert_eq!(config.pool.max_idle, 20);
        assert_eq!(config.pool.min_idle, 2);
        assert_eq!(config.pool.max_wait_ms, 50);
        assert!(config.pool.test_on_borrow);
        assert_eq!(config.cluster.max_redirections, 5);
        assert_eq!(config.region.refresh_threshold_secs, 12);
        assert_eq!(config.region.page_size_cap, 5);
        assert_eq!(config.compression.threshold_bytes, 1024);
        assert_eq!(config.compression.algorithm, CompressionAlgorithm::Deflate);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
mode: cluster
cluster:
  nodes: ["10.0.0.1:7000", "10.0.0.2:7000", "10.0.0.3:7000"]
  maxRedirections: 2
connection:
  quiet: true
  slowCommandMs: 10
pool:
  maxTotal: 8
  maxIdle: 4
region:
  namespace: shop
  concurrency: 4
  waitForTasks: false
compression:
  algorithm: lz4
"#;
        let config = ClientConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.seed_endpoints().unwrap().len(), 3);
        assert_eq!(config.max_attempts(), 2);
        assert!(config.connection.quiet);
        assert_eq!(config.slow_threshold(), Duration::from_millis(10));
        assert_eq!(config.pool_config().max_total, 8);
        assert_eq!(config.pool_config().min_idle, 2);
        assert_eq!(config.region.namespace, "shop");
        assert_eq!(config.region.concurrency, Some(4));
        assert!(!config.region.wait_for_tasks);
        assert!(ClientConfig::default().region.wait_for_tasks);
        assert_eq!(config.compression.algorithm, CompressionAlgorithm::Lz4);
    }

    #[test]
    fn test_attempts_capped_by_node_count() {
        let mut config = ClientConfig::default();
        config.cluster.nodes = vec!["a:1".into(), "b:2".into()];
        assert_eq!(config.max_attempts(), 2);
        config.cluster.nodes.clear();
        assert_eq!(config.max_attempts(), 1);
    }

    #[test]
    fn test_validation() {
        let config = ClientConfig::default();
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let yaml = "mode: standalone\nstandalone:\n  address: localhost:6379\n";
        assert!(ClientConfig::from_yaml_str(yaml).is_ok());

        let yaml = "mode: sentinel\nsentinel:\n  sentinels: [\"s1:26379\"]\n";
        assert!(ClientConfig::from_yaml_str(yaml).is_err());

        let yaml = "mode: standalone\npool:\n  maxTotal: 2\n  maxIdle: 3\n";
        assert!(ClientConfig::from_yaml_str(yaml).is_err());

        let yaml = "cluster:\n  nodes: [\"nonsense\"]\n";
        assert!(ClientConfig::from_yaml_str(yaml).is_err());

        let yaml = "mode: standalone\ncompression:\n  thresholdBytes: 10\n";
        assert!(ClientConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_eviction_interval_zero_disables() {
        let mut config = ClientConfig::default();
        config.pool.eviction_interval_ms = 0;
        assert_eq!(config.pool_config().eviction_interval, None);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Sentinel".parse::<Mode>().unwrap(), Mode::Sentinel);
        assert!("bogus".parse::<Mode>().is_err());
        assert_eq!(Mode::Standalone.to_string(), "standalone");
    }
}
