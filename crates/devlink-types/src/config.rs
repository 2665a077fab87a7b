//! Configuration structures, deserialized from `config.toml`.
//!
//! Every section is `#[serde(default)]` so a partial file (or none at all)
//! yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Maximum single frame size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevlinkConfig {
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Transport settings.
    pub link: LinkConfig,
    /// Caller-side timeouts.
    pub proxy: ProxyConfig,
    /// Which optional sub-objects are physically present.
    pub presence: PresenceConfig,
}

impl Default for DevlinkConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            link: LinkConfig::default(),
            proxy: ProxyConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

/// Transport link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Address the host listens on.
    pub listen_addr: String,
    /// Address a client connects to.
    pub connect_addr: String,
    /// This node's unique ID.
    pub node_id: String,
    /// Human-readable node name.
    pub node_name: String,
    /// Pre-shared key for the HMAC handshake. TCP links refuse to start
    /// without it.
    pub shared_secret: String,
    /// Largest accepted frame body in bytes.
    pub max_frame_size: u32,
    /// Wait for the peer's half of the handshake.
    pub handshake_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7420".to_string(),
            connect_addr: "127.0.0.1:7420".to_string(),
            node_id: uuid::Uuid::new_v4().to_string(),
            node_name: "devlink-node".to_string(),
            shared_secret: String::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout_ms: 5000,
        }
    }
}

impl LinkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Proxy-side call settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Default wait for a query reply.
    pub query_timeout_ms: u64,
    /// Wait for an Init acknowledgement.
    pub init_timeout_ms: u64,
    /// Channel new proxies are placed on.
    pub default_channel: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 3000,
            init_timeout_ms: 3000,
            default_channel: 0,
        }
    }
}

impl ProxyConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

/// Presence manifest: which numbered sub-objects exist per type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// When false every object is treated as present.
    pub enforce: bool,
    /// Type name -> present ids, e.g. `Relay = [1, 2]`.
    pub units: BTreeMap<String, Vec<u32>>,
}
