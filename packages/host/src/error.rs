//! Error types for the host runtime.

use thiserror::Error;

/// Errors raised by the host outside of a handler's own failures.
#[derive(Debug, Error)]
pub enum HostError {
    /// No route matched the request path, or no handler is registered for
    /// the route name.
    #[error("route not found: {0}")]
    RouteNotFound(String),

    /// The path matched a route registered for another method.
    #[error("method {method} not allowed for route {route}")]
    MethodNotAllowed { route: String, method: String },

    /// A route pattern did not compile.
    #[error("invalid route pattern {pattern:?}")]
    InvalidRoute {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The worker pool was shut down.
    #[error("worker pool closed")]
    WorkerPoolClosed,

    /// A dispatch task panicked or was cancelled by the executor.
    #[error("invocation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A capability or stream operation failed outside a handler.
    #[error(transparent)]
    Capability(#[from] capbridge_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for host operations.
pub type Result<T> = std::result::Result<T, HostError>;
