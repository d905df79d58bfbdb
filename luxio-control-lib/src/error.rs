use thiserror::Error;

/// Errors raised while starting or running a discovery strategy.
///
/// These never reach the consumer: the discovery service logs them and
/// carries on with whatever the other strategies found.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The scanning transport could not be brought up (permissions, sandbox,
    /// no multicast-capable interface).
    #[error("discovery transport unavailable: {0}")]
    Init(String),

    #[error("discovery transport failed: {0}")]
    Transport(String),
}

/// A discovery record or wire payload that is missing or has malformed fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn missing(field: &'static str) -> Self {
        ValidationError {
            field,
            reason: "missing".to_string(),
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError {
            field,
            reason: reason.into(),
        }
    }
}

/// A per-device transport failure.
///
/// Cloneable so that every caller waiting on the same connection attempt can
/// receive the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("request to {host} failed: {message}")]
    Request { host: String, message: String },

    #[error("{host} answered with status {status}")]
    Status { host: String, status: u16 },

    #[error("could not decode response from {host}: {message}")]
    Decode { host: String, message: String },

    #[error("event stream closed: {0}")]
    StreamClosed(String),

    #[error("device does not provide an event stream")]
    PushUnsupported,

    #[error("connection was shut down")]
    Cancelled,
}

/// A failed write. The optimistic local state is left as it was.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command {method} could not be sent: {message}")]
    Transport { method: String, message: String },

    #[error("command {method} was rejected with status {status}")]
    Rejected { method: String, status: u16 },

    #[error("{0}")]
    Unsupported(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("command queue for this device is closed")]
    Closed,
}

impl CommandError {
    pub fn transport(method: &str, err: impl std::fmt::Display) -> Self {
        CommandError::Transport {
            method: method.to_string(),
            message: err.to_string(),
        }
    }
}
