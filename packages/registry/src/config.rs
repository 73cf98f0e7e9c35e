//! Registry-wide settings and the per-kind configuration scripts pass.

use capbridge_core::{Error, Result};
use capbridge_net::{HttpClientConfig, SocketConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::kind::CapabilityKind;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_PIPE_CAPACITY: usize = 99;
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Settings fixed when the registry is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub default_queue_capacity: usize,
    pub pipe_capacity: usize,
    pub subscriber_capacity: usize,
    pub database_pool_size: usize,
    /// Background sweep for caches. `None` keeps expiry lazy only.
    pub cache_sweep_interval_ms: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            database_pool_size: capbridge_db::DEFAULT_POOL_SIZE,
            cache_sweep_interval_ms: None,
        }
    }
}

/// A named queue. Capacity only matters the first time the name is seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub capacity: Option<usize>,
}

/// Pipes, locks, caches and buses are identified by name alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedConfig {
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_name() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub driver: String,
    pub connection: String,
    #[serde(default)]
    pub pool_size: Option<usize>,
}

pub(crate) fn parse<T: DeserializeOwned>(kind: CapabilityKind, config: &serde_json::Value) -> Result<T> {
    serde_json::from_value(config.clone())
        .map_err(|e| Error::illegal_state(format!("invalid {} configuration: {}", kind, e)))
}

/// Typed configuration for one capability request.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityConfig {
    Queue(QueueConfig),
    Pipe(NamedConfig),
    Lock(NamedConfig),
    Cache(NamedConfig),
    EventBus(NamedConfig),
    Database(DatabaseConfig),
    HttpClient(HttpClientConfig),
    Socket(SocketConfig),
}

impl CapabilityConfig {
    /// Read the JSON configuration a script passed for `kind`.
    pub fn parse(kind: CapabilityKind, config: &serde_json::Value) -> Result<Self> {
        Ok(match kind {
            CapabilityKind::Queue => Self::Queue(parse(kind, config)?),
            CapabilityKind::Pipe => Self::Pipe(parse(kind, config)?),
            CapabilityKind::Lock => Self::Lock(parse(kind, config)?),
            CapabilityKind::Cache => Self::Cache(parse(kind, config)?),
            CapabilityKind::EventBus => Self::EventBus(parse(kind, config)?),
            CapabilityKind::Database => Self::Database(parse(kind, config)?),
            CapabilityKind::HttpClient => Self::HttpClient(parse(kind, config)?),
            CapabilityKind::Socket => Self::Socket(parse(kind, config)?),
        })
    }

    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Queue(_) => CapabilityKind::Queue,
            Self::Pipe(_) => CapabilityKind::Pipe,
            Self::Lock(_) => CapabilityKind::Lock,
            Self::Cache(_) => CapabilityKind::Cache,
            Self::EventBus(_) => CapabilityKind::EventBus,
            Self::Database(_) => CapabilityKind::Database,
            Self::HttpClient(_) => CapabilityKind::HttpClient,
            Self::Socket(_) => CapabilityKind::Socket,
        }
    }
}
