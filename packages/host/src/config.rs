//! Host settings, loadable from JSON.

use std::path::Path;

use capbridge_registry::RegistryConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_SERVICE_TIMEOUT_MS: i64 = 60_000;
pub const DEFAULT_ROUTE_PREFIX: &str = "/service/";

/// One routed service: requests whose path matches `pattern` run the
/// handler registered under `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    pub pattern: String,
    /// `None` accepts any method.
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Handlers allowed to run at once. Further requests queue for a slot.
    pub workers: usize,
    /// Request-wide deadline given to every context. Negative disables it.
    pub service_timeout_ms: i64,
    /// Stripped from request paths before routing.
    pub route_prefix: String,
    pub routes: Vec<RouteConfig>,
    pub registry: RegistryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            service_timeout_ms: DEFAULT_SERVICE_TIMEOUT_MS,
            route_prefix: DEFAULT_ROUTE_PREFIX.to_string(),
            routes: Vec::new(),
            registry: RegistryConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
