//! Fabric configuration for a node.
//!
//! The fabric consumes configuration but never decides where it comes from;
//! the embedding process builds a [`FabricConfig`] (or loads one from JSON)
//! and hands it to [`FabricNode::new`](crate::FabricNode::new).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_FRAME_SIZE};
use crate::error::FabricError;
use crate::identity::Role;

/// Exponential backoff parameters for connect attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the second attempt.
    #[serde(with = "duration_ms")]
    pub initial: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "duration_ms")]
    pub max: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Connect attempts before `register` gives up.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 8,
        }
    }
}

/// Configuration for a single fabric node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Logical address of this node.
    pub address: String,

    /// Role advertised when registering with a parent.
    pub role: Role,

    /// Address to accept child connections on. `None` for leaf nodes.
    #[serde(with = "socket_addr_opt")]
    pub listen_addr: Option<SocketAddr>,

    /// Transport address of the parent, if this node has one.
    pub parent_addr: Option<String>,

    /// Interval between heartbeats on every link.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Silent intervals before a link is considered to be missing heartbeats.
    pub heartbeat_miss_limit: u32,

    /// Further silent intervals before the link is declared disconnected.
    pub heartbeat_grace: u32,

    /// Connect/reconnect backoff.
    pub backoff: BackoffConfig,

    /// How long to wait for the parent's registration reply.
    #[serde(with = "duration_ms")]
    pub registration_timeout: Duration,

    /// How long an acknowledged send waits before retransmitting.
    #[serde(with = "duration_ms")]
    pub ack_timeout: Duration,

    /// Retransmissions after the first attempt before `DeliveryFailed`.
    pub max_retries: u32,

    /// Envelopes held per link while it is disconnected.
    pub outbound_buffer: usize,

    /// Blob bytes at which payloads are LZ4-compressed.
    pub compression_threshold: usize,

    /// Largest encoded envelope accepted or produced.
    pub max_frame_size: usize,

    /// Workers executing subscription handlers.
    pub handler_workers: usize,

    /// Queued handler invocations above which ephemeral envelopes are shed.
    pub handler_queue_limit: usize,

    /// Inactivity after which a stream session ends.
    #[serde(with = "duration_ms")]
    pub stream_idle_timeout: Duration,

    /// Events queued per stream reader before chunks are shed.
    pub stream_receiver_capacity: usize,

    /// Ephemeral frames queued per connection before new ones are shed.
    /// Control traffic and acknowledged sends are never shed.
    pub send_queue_limit: usize,

    /// How long a disconnected child keeps its registry entry, routes and
    /// buffer before it is forgotten.
    #[serde(with = "duration_ms")]
    pub child_retention: Duration,

    /// Recently seen `(sender, id)` pairs remembered per link.
    pub dedup_window: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            address: "coordinator".to_string(),
            role: Role::Coordinator,
            listen_addr: None,
            parent_addr: None,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_miss_limit: 3,
            heartbeat_grace: 2,
            backoff: BackoffConfig::default(),
            registration_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(2),
            max_retries: 3,
            outbound_buffer: 1024,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handler_workers: 4,
            handler_queue_limit: 4096,
            stream_idle_timeout: Duration::from_secs(30),
            stream_receiver_capacity: 256,
            send_queue_limit: crate::transport::DEFAULT_DROPPABLE_LIMIT,
            child_retention: Duration::from_secs(300),
            dedup_window: 1024,
        }
    }
}

impl FabricConfig {
    /// Defaults with the given address and role.
    pub fn new(address: impl Into<String>, role: Role) -> Self {
        Self {
            address: address.into(),
            role,
            ..Self::default()
        }
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_addr = Some(parent.into());
        self
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<(), FabricError> {
        if self.address.is_empty() {
            return Err(FabricError::Config("address must not be empty".into()));
        }
        if self.address.starts_with(crate::message::CONTROL_PREFIX) {
            return Err(FabricError::Config(format!(
                "address '{}' uses the reserved control prefix",
                self.address
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(FabricError::Config("heartbeat_interval must be non-zero".into()));
        }
        if self.heartbeat_miss_limit == 0 {
            return Err(FabricError::Config("heartbeat_miss_limit must be at least 1".into()));
        }
        if self.ack_timeout.is_zero() {
            return Err(FabricError::Config("ack_timeout must be non-zero".into()));
        }
        if self.backoff.max_attempts == 0 {
            return Err(FabricError::Config("backoff.max_attempts must be at least 1".into()));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(FabricError::Config("backoff.multiplier must be >= 1.0".into()));
        }
        if self.handler_workers == 0 {
            return Err(FabricError::Config("handler_workers must be at least 1".into()));
        }
        if self.outbound_buffer == 0 {
            return Err(FabricError::Config("outbound_buffer must be at least 1".into()));
        }
        if self.stream_receiver_capacity == 0 {
            return Err(FabricError::Config("stream_receiver_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), FabricError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, FabricError> {
        let data = std::fs::read_to_string(path)?;
        let config: FabricConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unusable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Unusable config file {}, using defaults: {e}", path.display());
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &Option<SocketAddr>, s: S) -> Result<S::Ok, S::Error> {
        match addr {
            Some(addr) => s.serialize_some(&addr.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SocketAddr>, D::Error> {
        let s = Option::<String>::deserialize(d)?;
        s.map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FabricConfig::default();
        assert_eq!(config.role, Role::Coordinator);
        assert!(config.listen_addr.is_none());
        assert!(config.parent_addr.is_none());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let config = FabricConfig::new("worker-a", Role::Worker)
            .with_listen_addr("127.0.0.1:9500".parse().unwrap())
            .with_parent("127.0.0.1:9400");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"heartbeat_interval\":1000"));

        let back: FabricConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.address, "worker-a");
        assert_eq!(back.role, Role::Worker);
        assert_eq!(back.listen_addr, config.listen_addr);
        assert_eq!(back.parent_addr.as_deref(), Some("127.0.0.1:9400"));
        assert_eq!(back.backoff, config.backoff);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"address":"sub-7","role":"sub_worker","ack_timeout":250}"#;
        let config: FabricConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.address, "sub-7");
        assert_eq!(config.role, Role::SubWorker);
        assert_eq!(config.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.max_retries, FabricConfig::default().max_retries);
        assert_eq!(config.child_retention, Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = FabricConfig::default();
        config.address.clear();
        assert!(matches!(config.validate(), Err(FabricError::Config(_))));

        let mut config = FabricConfig::default();
        config.address = "_fabric/sneaky".into();
        assert!(config.validate().is_err());

        let mut config = FabricConfig::default();
        config.heartbeat_miss_limit = 0;
        assert!(config.validate().is_err());

        let mut config = FabricConfig::default();
        config.backoff.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = FabricConfig::default();
        config.handler_workers = 0;
        assert!(config.validate().is_err());

        let mut config = FabricConfig::default();
        config.stream_receiver_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fabric.json");

        let mut original = FabricConfig::new("worker-b", Role::Worker);
        original.max_retries = 9;
        original.outbound_buffer = 64;
        original.save_to_file(&path).unwrap();

        let loaded = FabricConfig::load_or_default(&path);
        assert_eq!(loaded.address, "worker-b");
        assert_eq!(loaded.max_retries, 9);
        assert_eq!(loaded.outbound_buffer, 64);
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let config = FabricConfig::load_or_default(&path);
        assert_eq!(config.address, "coordinator");
        assert!(FabricConfig::load(&path).is_err());
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fabric.json");
        std::fs::write(&path, "{ not json").unwrap();
        let config = FabricConfig::load_or_default(&path);
        assert_eq!(config.max_retries, 3);
    }
}
