use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{PoolError, PoolResult};

/// Per-chunk remote selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    #[default]
    LeastUsed,
    RoundRobin,
    Weighted,
    Random,
    RoundRobinLeastUsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RedundancyMode {
    #[default]
    None,
    Replication,
    Parity,
    Hybrid,
}

impl RedundancyMode {
    pub fn uses_parity(&self) -> bool {
        matches!(self, RedundancyMode::Parity | RedundancyMode::Hybrid)
    }

    pub fn uses_replication(&self) -> bool {
        matches!(self, RedundancyMode::Replication | RedundancyMode::Hybrid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    None,
    Basic,
    ApiKey,
    Bearer,
}

/// A frontend user account. Passwords are stored as SHA-256 hex digests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    #[serde(default)]
    pub password_sha256: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Backend settings for one remote. Remotes without an entry fall back to
/// the in-memory client (useful for demos and tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteBackendConfig {
    S3 {
        endpoint: String,
        #[serde(default = "default_region")]
        region: String,
        bucket: String,
        access_key_id: String,
        secret_access_key: String,
        #[serde(default)]
        root: Option<String>,
        /// Declared capacity for balancing (backends rarely report quotas).
        #[serde(default)]
        capacity_bytes: Option<u64>,
    },
    Fs {
        root: PathBuf,
        #[serde(default)]
        capacity_bytes: Option<u64>,
    },
}

fn default_region() -> String {
    "us-east-1".into()
}

/// Retry policy for transient remote failures:
/// `delay_i = min(base * factor^i, max)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            factor: 2.0,
        }
    }
}

/// Top-level pool configuration (rpool.toml or config.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Ordered list of remote identifiers.
    pub remotes: Vec<String>,
    /// Fixed chunk size in bytes (default 100 MiB).
    pub chunk_size: u64,
    pub data_prefix: String,
    pub manifest_prefix: String,
    /// Scratch space for streamed uploads (RAM-backed path preferred).
    pub temp_dir: PathBuf,
    /// Persistent manifest cache location (default ~/.cache/rpool).
    pub cache_dir: Option<PathBuf>,
    /// LRU chunk cache directory (RAM-backed path preferred).
    pub chunk_cache_dir: PathBuf,
    pub chunk_cache_max_mb: u64,
    pub parallel_uploads: bool,
    pub parallel_downloads: bool,
    pub max_parallel_workers: usize,
    pub balancing_strategy: BalancingStrategy,
    pub remote_weights: HashMap<String, f64>,
    pub remote_priorities: HashMap<String, i64>,
    pub redundancy_mode: RedundancyMode,
    pub replication_factor: usize,
    pub parity_data_shards: usize,
    pub parity_shards: usize,
    /// Utilization spread (percentage points) above which the pool counts
    /// as unbalanced.
    pub rebalance_threshold: f64,
    pub enable_compression: bool,
    /// 0 = unlimited.
    pub bandwidth_limit_upload_mbps: f64,
    pub bandwidth_limit_download_mbps: f64,
    pub webdav_host: String,
    pub webdav_port: u16,
    pub api_server_host: String,
    pub api_server_port: u16,
    pub webdav_auth_method: AuthMethod,
    /// Prometheus metrics / health endpoint (None disables it).
    pub metrics_addr: Option<String>,
    pub users: Vec<UserConfig>,
    pub remote_backends: HashMap<String, RemoteBackendConfig>,
    /// Per-primitive remote I/O timeout.
    pub io_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            remotes: Vec::new(),
            chunk_size: 100 * 1024 * 1024,
            data_prefix: "rclonepool_data".into(),
            manifest_prefix: "rclonepool_manifests".into(),
            temp_dir: PathBuf::from("/dev/shm/rpool"),
            cache_dir: None,
            chunk_cache_dir: PathBuf::from("/dev/shm/rpool_cache"),
            chunk_cache_max_mb: 500,
            parallel_uploads: false,
            parallel_downloads: false,
            max_parallel_workers: 4,
            balancing_strategy: BalancingStrategy::default(),
            remote_weights: HashMap::new(),
            remote_priorities: HashMap::new(),
            redundancy_mode: RedundancyMode::default(),
            replication_factor: 1,
            parity_data_shards: 3,
            parity_shards: 1,
            rebalance_threshold: 10.0,
            enable_compression: false,
            bandwidth_limit_upload_mbps: 0.0,
            bandwidth_limit_download_mbps: 0.0,
            webdav_host: "0.0.0.0".into(),
            webdav_port: 8080,
            api_server_host: "0.0.0.0".into(),
            api_server_port: 8081,
            webdav_auth_method: AuthMethod::default(),
            metrics_addr: Some("127.0.0.1:9100".into()),
            users: Vec::new(),
            remote_backends: HashMap::new(),
            io_timeout_secs: 600,
            retry: RetryConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Load from a TOML or JSON file (decided by extension). A missing file
    /// logs a warning and yields defaults.
    pub fn load(path: &Path) -> PoolResult<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: PoolConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)
                .map_err(|e| PoolError::Policy(format!("parsing {}: {e}", path.display())))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast policy checks, applied once at configuration time.
    pub fn validate(&self) -> PoolResult<()> {
        if self.chunk_size == 0 {
            return Err(PoolError::Policy("chunk_size must be > 0".into()));
        }
        if self.replication_factor < 1 {
            return Err(PoolError::Policy(
                "replication_factor must be >= 1".into(),
            ));
        }
        if !self.remotes.is_empty() && self.replication_factor > self.remotes.len() {
            return Err(PoolError::Policy(format!(
                "replication_factor {} exceeds {} configured remotes",
                self.replication_factor,
                self.remotes.len()
            )));
        }
        if self.redundancy_mode.uses_parity() {
            if self.parity_data_shards == 0 || self.parity_shards == 0 {
                return Err(PoolError::Policy(
                    "parity_data_shards and parity_shards must be >= 1".into(),
                ));
            }
            if self.remotes.len() < 2 && !self.remotes.is_empty() {
                return Err(PoolError::Policy(
                    "parity redundancy needs at least 2 remotes".into(),
                ));
            }
        }
        if self.max_parallel_workers == 0 {
            return Err(PoolError::Policy(
                "max_parallel_workers must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub fn manifest_cache_file(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".cache/rpool")
            })
            .join("manifest_cache.json")
    }

    pub fn chunk_cache_max_bytes(&self) -> u64 {
        self.chunk_cache_max_mb * 1024 * 1024
    }
}
