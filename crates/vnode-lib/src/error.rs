//! Error types for the virtual node controller

use thiserror::Error;

/// Failure of a single publish, subscribe or unsubscribe call.
///
/// These are recoverable: the controller logs them and retries on its next tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The result was not known before the deadline
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The broker refused the request (e.g. a SUBACK failure code)
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// The connection dropped while the operation was in flight
    #[error("connection lost before acknowledgement")]
    Disconnected,

    /// The client could not queue the request
    #[error("client error: {0}")]
    Client(String),
}

/// Main error type for controller operations
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// Messaging connection or TLS material could not be established
    #[error("connection error: {0}")]
    Connection(String),

    /// Cluster API unreachable, unauthenticated or misconfigured
    #[error("cluster access error: {0}")]
    ClusterAccess(String),

    /// A transport operation failed
    #[error("transport operation failed: {0}")]
    Transport(#[from] TransportError),

    /// An inbound payload could not be decoded
    #[error("malformed message on {topic}: {reason}")]
    MalformedMessage { topic: String, reason: String },

    /// Liveness probes failed too many times in a row
    #[error("heartbeat lost after {0} consecutive failures")]
    HeartbeatLost(u32),

    /// `run` was called on a controller that is already running or finished
    #[error("controller already started")]
    AlreadyStarted,

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a connection error with the given message
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a cluster access error with the given message
    pub fn cluster_access(msg: impl Into<String>) -> Self {
        Self::ClusterAccess(msg.into())
    }

    /// Create a malformed message error
    pub fn malformed(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error ends the controller's run loop
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Transport(_) | Error::MalformedMessage { .. })
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::ClusterAccess(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
