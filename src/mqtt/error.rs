//! Error taxonomy for the bus connectivity layer

use thiserror::Error;

/// Failure to bring a connector up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// Socket, TLS or authentication failure on a direct broker connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// The host-managed broker proxy is missing or not reachable
    #[error("Upstream broker proxy unavailable: {0}")]
    UpstreamUnavailable(String),
}

/// Failure to publish or subscribe on the bus.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The connector has no live session
    #[error("Not connected")]
    NotConnected,

    /// The bus client refused the request
    #[error("Rejected by bus client: {0}")]
    Rejected(String),
}

/// A payload that cannot be read as a meter reading. Always skipped, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Malformed payload on {topic}: {reason}")]
    Malformed { topic: String, reason: String },
}
