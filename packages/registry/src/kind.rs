//! Capability kinds and the keys resources are shared under.

use std::fmt;
use std::str::FromStr;

use capbridge_core::Error;
use serde::{Deserialize, Serialize};

/// The kinds of capability a script can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityKind {
    Queue,
    Lock,
    Cache,
    EventBus,
    Pipe,
    Database,
    HttpClient,
    Socket,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 8] = [
        CapabilityKind::Queue,
        CapabilityKind::Lock,
        CapabilityKind::Cache,
        CapabilityKind::EventBus,
        CapabilityKind::Pipe,
        CapabilityKind::Database,
        CapabilityKind::HttpClient,
        CapabilityKind::Socket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Queue => "queue",
            CapabilityKind::Lock => "lock",
            CapabilityKind::Cache => "cache",
            CapabilityKind::EventBus => "event-bus",
            CapabilityKind::Pipe => "pipe",
            CapabilityKind::Database => "database",
            CapabilityKind::HttpClient => "http-client",
            CapabilityKind::Socket => "socket",
        }
    }
}

impl FromStr for CapabilityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::illegal_state(format!("unknown capability kind {:?}", s)))
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a shared resource: equal keys always resolve to the same
/// instance for the life of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityKey {
    pub kind: CapabilityKind,
    pub signature: String,
}

impl CapabilityKey {
    pub fn new(kind: CapabilityKind, signature: impl Into<String>) -> Self {
        Self {
            kind,
            signature: signature.into(),
        }
    }
}

impl fmt::Display for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.signature)
    }
}
