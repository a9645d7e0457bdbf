//! Client engine errors.
//!
//! Categories drive recovery: transient network problems are retried by the
//! owning component, protocol problems drop the offending message, auth and
//! capacity problems surface to the application as events and stop there.

/// Reason the server refused authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailReason {
    /// No server address configured
    NoUrl,
    /// Server rejected the credentials
    BadCredentials,
    /// No credentials supplied and the server requires them
    NoCredentials,
}

/// Client engine error
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Authentication failed with the given reason
    #[error("authentication failed: {0:?}")]
    Auth(AuthFailReason),

    /// Operation is invalid in the current controller state
    #[error("invalid state: expected {expected}, currently {actual}")]
    InvalidState { expected: &'static str, actual: &'static str },

    /// Conference cannot be joined
    #[error("conference join refused: {reason}")]
    ConferenceRefused { reason: String },

    /// Signalling transport failure
    #[error("signalling error: {0}")]
    Signaling(String),

    /// Media plane failure
    #[error(transparent)]
    Media(#[from] confero_media_core::Error),

    /// Transport layer failure
    #[error(transparent)]
    Transport(#[from] confero_transport_core::Error),

    /// Protocol decode failure
    #[error(transparent)]
    Protocol(#[from] confero_proto_core::Error),

    /// Recorder failure
    #[error("recorder error: {0}")]
    Recorder(String),

    /// File or socket I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
