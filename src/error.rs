//! Error types for the UE-Bot bridge

use thiserror::Error;

use crate::protocol::FrameError;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection could not be opened or was lost
    #[error("transport error: {0}")]
    Transport(String),

    /// Peer violated the session protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Registration handshake did not complete
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Malformed binary audio frame
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Correlated upstream request failed
    #[error("gateway request failed: {0}")]
    Request(#[from] RequestError),

    /// Link is not in a state that allows the operation
    #[error("link unavailable: {0}")]
    Unavailable(String),

    /// Audio source or encoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Outcome of a correlated request that did not produce a response
///
/// Cloneable so one connection loss can reject every pending request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Deadline passed before a response arrived
    #[error("request timed out")]
    Timeout,

    /// Connection dropped while the request was in flight
    #[error("connection lost")]
    ConnectionLost,

    /// No upstream connection at send time
    #[error("not connected")]
    NotConnected,

    /// Client was closed intentionally
    #[error("client closed")]
    Closed,

    /// Gateway answered with an error
    #[error("remote error: {0}")]
    Remote(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
