//! Client error types
//!
//! Errors are `Clone` so a single transport failure can be handed to every
//! request that was waiting on it and to the `error` listeners at once.

/// Client result type
pub type Result<T> = std::result::Result<T, Error>;

/// Client errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Request timed out: {event}")]
    RequestTimeout { event: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Player not found: {identifier}")]
    PlayerNotFound { identifier: String },

    #[error("Client closed")]
    ClientClosed,

    /// The hub answered a request with `status: "failure"`
    #[error("Request rejected ({event}): {message}")]
    Rejected { event: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether the error came from the connection going away rather than
    /// from the request itself
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::NotConnected | Error::ClientClosed
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(format!("Invalid JSON: {}", e))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Connection(e.to_string())
    }
}
