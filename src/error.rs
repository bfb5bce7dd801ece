//! Error types for the ring

use std::fmt;

/// Result type alias for ring operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ring coordination, routing and replication
#[derive(Debug)]
pub enum Error {
    /// CAS retries exhausted while other writers kept changing the key
    CoordinationConflict { key: String, attempts: u32 },
    /// Coordination store could not be reached
    StoreUnavailable(String),
    /// Stored descriptor could not be decoded
    DecodeCorruption(String),
    /// Not enough replicas acknowledged an operation
    QuorumFailure {
        required: usize,
        succeeded: usize,
        failures: Vec<ReplicaFailure>,
    },
    /// Ring has no tokens to route against
    EmptyRing,
    /// Operation is not valid in the current lifecycle state
    InvalidState(String),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Object store errors outside the CAS path (builders, listing)
    ObjectStore(object_store::Error),
    /// Timeout
    Timeout,
    /// Internal error
    Internal(String),
}

/// Per-replica detail carried by [`Error::QuorumFailure`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaFailure {
    /// Ingester identity
    pub ingester: String,
    /// Address the operation was sent to
    pub addr: String,
    /// Rendered error returned by the replica (or the timeout)
    pub reason: String,
}

impl Error {
    /// Whether retrying the whole operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::CoordinationConflict { .. } | Error::StoreUnavailable(_) | Error::Timeout
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStore(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CoordinationConflict { key, attempts } => write!(
                f,
                "Coordination conflict on {}: CAS failed after {} attempts",
                key, attempts
            ),
            Error::StoreUnavailable(msg) => write!(f, "Coordination store unavailable: {}", msg),
            Error::DecodeCorruption(msg) => write!(f, "Corrupt ring descriptor: {}", msg),
            Error::QuorumFailure {
                required,
                succeeded,
                failures,
            } => {
                write!(
                    f,
                    "Quorum not reached: need {}, got {}",
                    required, succeeded
                )?;
                for failure in failures {
                    write!(
                        f,
                        "; {} ({}): {}",
                        failure.ingester, failure.addr, failure.reason
                    )?;
                }
                Ok(())
            }
            Error::EmptyRing => write!(f, "Ring is empty"),
            Error::InvalidState(msg) => write!(f, "Invalid lifecycle state: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
