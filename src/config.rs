//! Node configuration
//!
//! Loaded from JSON; every field has a default so partial files work.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::TAG_LEN;
use crate::network::RetryPolicy;
use crate::selection::SelectionWeights;

/// Room a chunk frame needs beyond the ciphertext: message envelope,
/// relay route and bincode length fields.
pub const FRAME_OVERHEAD: u64 = 64 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Durations as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stable name the peer id is derived from
    pub node_name: String,
    pub listen_addr: SocketAddr,
    pub bootstrap_peers: Vec<SocketAddr>,

    /// Bytes this node offers for hosting other peers' chunks
    pub storage_limit: u64,
    pub chunk_size: u64,
    pub redundancy_enabled: bool,
    pub replication_target: u32,
    pub encryption_enabled: bool,

    /// Whether this node forwards traffic for peers that cannot reach each other
    pub relay_capable: bool,
    pub relay_fallback: bool,

    /// Concurrent chunk transfers per node
    pub max_concurrent_transfers: usize,
    /// Largest wire frame sent or accepted; must fit one sealed chunk
    pub max_message_size: usize,
    /// Upload cap in bytes per second (0 = unlimited)
    pub upload_limit_bps: u32,

    pub directory_replication: usize,
    #[serde(with = "duration_ms")]
    pub directory_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub maintenance_interval: Duration,
    #[serde(with = "duration_ms")]
    pub peer_timeout: Duration,

    pub retry: RetryPolicy,
    pub selection: SelectionWeights,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: format!("node-{}", uuid::Uuid::new_v4()),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7400)),
            bootstrap_peers: Vec::new(),
            storage_limit: 10 * 1024 * 1024 * 1024,
            chunk_size: 50 * 1024 * 1024,
            redundancy_enabled: true,
            replication_target: 3,
            encryption_enabled: true,
            relay_capable: false,
            relay_fallback: true,
            max_concurrent_transfers: 8,
            max_message_size: 256 * 1024 * 1024,
            upload_limit_bps: 0,
            directory_replication: 5,
            directory_timeout: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(90),
            retry: RetryPolicy::default(),
            selection: SelectionWeights::default(),
        }
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> ConfigResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Replicas each chunk should reach. Redundancy off means one copy.
    pub fn effective_replication_target(&self) -> u32 {
        if self.redundancy_enabled {
            self.replication_target
        } else {
            1
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be > 0".into()));
        }
        if self.max_message_size as u64 > u32::MAX as u64 {
            return Err(ConfigError::Invalid(format!(
                "max_message_size {} exceeds the 4 GiB frame limit",
                self.max_message_size
            )));
        }
        let frame = self
            .chunk_size
            .saturating_add(TAG_LEN as u64)
            .saturating_add(FRAME_OVERHEAD);
        if frame > self.max_message_size as u64 {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} needs frames of {frame} bytes, max_message_size is {}",
                self.chunk_size, self.max_message_size
            )));
        }
        if self.replication_target == 0 {
            return Err(ConfigError::Invalid("replication_target must be > 0".into()));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_transfers must be > 0".into(),
            ));
        }
        if self.directory_replication == 0 {
            return Err(ConfigError::Invalid(
                "directory_replication must be > 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if self.maintenance_interval.is_zero() || self.peer_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "maintenance_interval and peer_timeout must be > 0".into(),
            ));
        }
        self.selection.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}
