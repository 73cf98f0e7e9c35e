//! Error types shared by every capability.

use std::fmt;

/// Boxed error from an external store or service.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by capability operations.
///
/// A script-facing layer reports these as a single failure value made of
/// [`Error::kind`] and the display message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A blocking bound was exceeded. Nothing was changed.
    #[error("timed out waiting to {operation}")]
    Timeout { operation: String },

    /// Protocol misuse: double upgrade, unlock without holding, use after close.
    #[error("illegal state: {message}")]
    IllegalState { message: String },

    /// The backing store cannot provide the requested isolation level.
    #[error("unsupported isolation level: {level}")]
    UnsupportedIsolation { level: String },

    /// The request can never be satisfied (zero capacity, empty pool).
    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    /// Failure reported by an external store or service.
    #[error("{context}: {source}")]
    Upstream {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl Error {
    pub fn timeout(operation: impl Into<String>) -> Self {
        Error::Timeout {
            operation: operation.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState {
            message: message.into(),
        }
    }

    pub fn unsupported_isolation(level: impl fmt::Display) -> Self {
        Error::UnsupportedIsolation {
            level: level.to_string(),
        }
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Error::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Wrap a failure from an external collaborator.
    pub fn upstream(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Upstream {
            context: context.into(),
            source: source.into(),
        }
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::IllegalState { .. } => ErrorKind::IllegalState,
            Error::UnsupportedIsolation { .. } => ErrorKind::UnsupportedIsolation,
            Error::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Error::Upstream { .. } => ErrorKind::Upstream,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Error::timeout("complete i/o")
            }
            _ => Error::upstream("i/o failure", e),
        }
    }
}

/// Stable category names for [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    IllegalState,
    UnsupportedIsolation,
    ResourceExhausted,
    Upstream,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::IllegalState => "illegal_state",
            ErrorKind::UnsupportedIsolation => "unsupported_isolation",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Upstream => "upstream",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for capability operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn timeout_display() {
        let e = Error::timeout("put into queue");
        assert_eq!(format!("{}", e), "timed out waiting to put into queue");
        assert_eq!(e.kind(), ErrorKind::Timeout);
        assert!(e.is_timeout());
    }

    #[test]
    fn illegal_state_display() {
        let e = Error::illegal_state("lock \"x\" is not held by caller");
        let display = format!("{}", e);
        assert!(display.contains("illegal state"));
        assert!(display.contains("\"x\""));
    }

    #[test]
    fn upstream_keeps_source() {
        let io = std::io::Error::other("disk on fire");
        let e = Error::upstream("sqlite open", io);
        assert_eq!(e.kind(), ErrorKind::Upstream);
        assert!(format!("{}", e).contains("disk on fire"));
        assert!(StdError::source(&e).is_some());
    }

    #[test]
    fn timed_out_io_maps_to_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow peer");
        let e: Error = io.into();
        assert!(e.is_timeout());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "gone");
        let e: Error = io.into();
        assert_eq!(e.kind(), ErrorKind::Upstream);
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(ErrorKind::Timeout.as_str(), "timeout");
        assert_eq!(ErrorKind::IllegalState.to_string(), "illegal_state");
        assert_eq!(
            Error::unsupported_isolation("Linearizable").kind().as_str(),
            "unsupported_isolation"
        );
        assert_eq!(
            Error::exhausted("zero capacity").kind().as_str(),
            "resource_exhausted"
        );
    }
}
