//! Signalling protocol errors.

/// Protocol decode/encode error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Message is not valid JSON
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    /// Message does not carry the expected command key
    #[error("message is not a '{0}' command")]
    WrongCommand(&'static str),

    /// Message is not a one-key command object
    #[error("message is not a command envelope")]
    NotACommand,
}

/// Result alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;
