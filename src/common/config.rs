//! Configuration for relaykv nodes

use crate::common::utils::parse_size;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix (`RELAYKV_ROLE`, `RELAYKV_DATA_DIR`, ...)
pub const ENV_PREFIX: &str = "RELAYKV";

/// Role of a node. Fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Replica,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Replica => write!(f, "replica"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "master" => Ok(NodeRole::Master),
            "replica" => Ok(NodeRole::Replica),
            other => Err(Error::InvalidConfig(format!(
                "unknown instance role ({})",
                other
            ))),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID, also used as the replica id when reporting offsets
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Role (master or replica)
    #[serde(default = "default_role")]
    pub role: NodeRole,

    /// Root data directory (wal/, state/, engine/<name>/)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Storage engine name, resolved through the engine registry
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Bind address for the HTTP API
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Master HTTP base URL (replicas only)
    #[serde(default)]
    pub master_url: Option<String>,

    /// WAL size that triggers trimming, e.g. "1GB"
    #[serde(default = "default_max_wal_size")]
    pub max_wal_size: String,

    /// WAL entries applied per apply-loop iteration
    #[serde(default = "default_apply_batch_size")]
    pub apply_batch_size: usize,

    /// Replica poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often replicas report their applied offset to the master
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,

    /// How often the master checks the WAL size
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,

    /// Background reaper interval
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,

    /// Expired records removed per reaper batch
    #[serde(default = "default_reaper_batch_size")]
    pub reaper_batch_size: usize,

    /// A replica that has not reported for this long no longer holds back trimming
    #[serde(default = "default_replica_ttl_secs")]
    pub replica_ttl_secs: u64,

    /// Timeout for every request to the master
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Consecutive failures tolerated before a background task gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial retry delay, doubled after each failure
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// fsync engine writes before the applied offset is committed
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}
fn default_role() -> NodeRole {
    NodeRole::Master
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./relaykv-data")
}
fn default_engine() -> String {
    "sled".to_string()
}
fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6380))
}
fn default_max_wal_size() -> String {
    "1GB".to_string()
}
fn default_apply_batch_size() -> usize {
    128
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_report_interval_secs() -> u64 {
    30
}
fn default_retention_interval_secs() -> u64 {
    60
}
fn default_reaper_interval_secs() -> u64 {
    300
}
fn default_reaper_batch_size() -> usize {
    1000
}
fn default_replica_ttl_secs() -> u64 {
    600
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_max_retries() -> usize {
    8
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_sync_writes() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            role: default_role(),
            data_dir: default_data_dir(),
            engine: default_engine(),
            http_addr: default_http_addr(),
            master_url: None,
            max_wal_size: default_max_wal_size(),
            apply_batch_size: default_apply_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            report_interval_secs: default_report_interval_secs(),
            retention_interval_secs: default_retention_interval_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            reaper_batch_size: default_reaper_batch_size(),
            replica_ttl_secs: default_replica_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            sync_writes: default_sync_writes(),
            log_level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from an optional TOML file, then `RELAYKV_*`
    /// environment variables. Later sources win.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        let cfg: NodeConfig = settings.try_deserialize()?;
        Ok(cfg)
    }

    /// Reject configurations the node cannot start with
    pub fn validate(&self, known_engines: &[String]) -> Result<()> {
        if !known_engines.iter().any(|e| e == &self.engine) {
            return Err(Error::UnknownEngine(self.engine.clone()));
        }
        if self.role == NodeRole::Replica
            && self.master_url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(Error::InvalidConfig(
                "empty master specified, replicas require master_url".into(),
            ));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("data_dir cannot be empty".into()));
        }
        self.max_wal_size_bytes()?;
        if self.apply_batch_size == 0 || self.reaper_batch_size == 0 {
            return Err(Error::InvalidConfig("batch sizes must be positive".into()));
        }
        if self.poll_interval_ms == 0
            || self.report_interval_secs == 0
            || self.retention_interval_secs == 0
            || self.reaper_interval_secs == 0
            || self.request_timeout_secs == 0
        {
            return Err(Error::InvalidConfig("intervals must be positive".into()));
        }
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig("max_retries must be positive".into()));
        }
        Ok(())
    }

    /// Parsed WAL size ceiling in bytes
    pub fn max_wal_size_bytes(&self) -> Result<u64> {
        parse_size(&self.max_wal_size)
    }

    /// `<data_dir>/<elem>`
    pub fn data_path(&self, elem: &str) -> PathBuf {
        self.data_dir.join(elem)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_path("wal")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_path("state")
    }

    pub fn engine_path(&self) -> PathBuf {
        self.data_dir.join("engine").join(&self.engine)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn replica_ttl(&self) -> Duration {
        Duration::from_secs(self.replica_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
