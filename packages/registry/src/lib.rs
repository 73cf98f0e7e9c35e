//! # capbridge-registry
//!
//! Scripts never build shared resources themselves. They ask a
//! [`CapabilityRegistry`] for one by kind and configuration:
//!
//! ```rust
//! use capbridge_registry::{CapabilityKind, CapabilityRegistry};
//! use serde_json::json;
//!
//! let registry = CapabilityRegistry::default();
//! let a = registry.resolve(CapabilityKind::Pipe, &json!({"name": "jobs"})).unwrap();
//! let b = registry.resolve(CapabilityKind::Pipe, &json!({"name": "jobs"})).unwrap();
//! assert!(a.same_resource(&b));
//! ```
//!
//! The registry is built once at startup and passed by reference to every
//! request. There are no global tables.

pub mod capability;
pub mod config;
pub mod kind;
pub mod registry;

pub use capability::Capability;
pub use config::{
    CapabilityConfig, DatabaseConfig, NamedConfig, QueueConfig, RegistryConfig, DEFAULT_PIPE_CAPACITY,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_SUBSCRIBER_CAPACITY,
};
pub use kind::{CapabilityKey, CapabilityKind};
pub use registry::{CapabilityRegistry, DEFAULT_DIAL_TIMEOUT};
