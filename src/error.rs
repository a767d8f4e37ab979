//! Error types for the proxy.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while answering queries.
///
/// None of these cross the UDP loop: per-query failures are logged and the
/// requester simply sees a DNS timeout.
#[derive(Debug, Error)]
pub enum Error {
    /// Query too short or its question name could not be parsed.
    #[error("malformed DNS packet: {0}")]
    MalformedPacket(String),

    /// Address text is not a usable dotted quad.
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    /// HTTP request to the lookup service failed or timed out.
    #[error("tunnel request failed: {0}")]
    Tunnel(#[from] reqwest::Error),

    /// Lookup service answered, but without an address.
    #[error("tunnel could not resolve {0}")]
    TunnelRejected(String),

    /// Durable store failure.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Stored record could not be encoded or decoded.
    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Invalid startup configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
