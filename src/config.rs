//! Kernel configuration.
//!
//! Loaded from a TOML file. Every field has a default, so an empty file (or no file at all)
//! yields a working single-host setup.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dialogue::DialoguePolicy;
use crate::error::ConfigError;
use crate::frame::{EndpointRegistry, DEFAULT_MAX_FRAME_LEN};

/// Default broker address.
pub const DEFAULT_BROKER_ADDRESS: &str = "tcp://127.0.0.1:5005";

/// Default local socket name when the broker runs over IPC.
///
/// On Unix this is a filesystem-backed socket in `/tmp` so separate processes can discover it.
#[cfg(unix)]
pub const DEFAULT_LOCAL_SOCKET: &str = "/tmp/hri_broker.sock";

#[cfg(not(unix))]
pub const DEFAULT_LOCAL_SOCKET: &str = "hri_broker";

/// Where the broker listens and clients connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BrokerAddr {
    /// `tcp://host:port`
    Tcp(String),
    /// `local:<name>`, an interprocess local socket.
    Local(String),
}

impl Default for BrokerAddr {
    fn default() -> Self {
        Self::Tcp(DEFAULT_BROKER_ADDRESS.trim_start_matches("tcp://").to_string())
    }
}

impl FromStr for BrokerAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        if let Some(name) = s.strip_prefix("local:") {
            return if name.is_empty() {
                Err(ConfigError::Address(s.to_string()))
            } else {
                Ok(Self::Local(name.to_string()))
            };
        }
        let host_port = s.strip_prefix("tcp://").unwrap_or(s);
        match host_port.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(host_port.to_string()))
            }
            _ => Err(ConfigError::Address(s.to_string())),
        }
    }
}

impl TryFrom<String> for BrokerAddr {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, ConfigError> {
        value.parse()
    }
}

impl From<BrokerAddr> for String {
    fn from(addr: BrokerAddr) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Local(name) => write!(f, "local:{name}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub address: BrokerAddr,
    pub handshake_timeout_ms: u64,
    /// Frames buffered per connection before the router starts dropping.
    pub outbound_capacity: usize,
    pub route_queue_capacity: usize,
    pub max_frame_len: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: BrokerAddr::default(),
            handshake_timeout_ms: 5_000,
            outbound_capacity: 64,
            route_queue_capacity: 256,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl BrokerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Names accepted in addition to the built-in four.
    pub extra: Vec<String>,
    /// Alternate name -> registered name.
    pub aliases: BTreeMap<String, String>,
}

impl EndpointsConfig {
    pub fn registry(&self) -> EndpointRegistry {
        let mut registry = EndpointRegistry::default();
        for name in &self.extra {
            registry.register(name.clone());
        }
        for (alias, canonical) in &self.aliases {
            registry.alias(alias.clone(), canonical.clone());
        }
        registry
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Semicolon-delimited source file.
    pub path: Option<PathBuf>,
    /// Sled store mirroring the catalog.
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    /// JSON-lines trajectory feed. Standard input when absent.
    pub feed: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub broker: BrokerConfig,
    pub endpoints: EndpointsConfig,
    pub catalog: CatalogConfig,
    pub dialogue: DialoguePolicy,
    pub trajectory: TrajectoryConfig,
}

impl KernelConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}
