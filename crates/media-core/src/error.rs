//! Media pipeline errors.

/// Media layer error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Audio codec failure
    #[error("opus codec error: {0}")]
    Opus(#[from] opus::Error),

    /// Video codec failure with the libvpx detail string
    #[error("vp8 codec error: {0}")]
    Vp8(String),

    /// Component used before `start()`
    #[error("component not started")]
    NotStarted,

    /// Payload cannot be processed in its current shape
    #[error("invalid media payload: {0}")]
    InvalidPayload(&'static str),

    /// Decryption produced no plaintext (bad key or corrupted packet)
    #[error("payload decryption failed")]
    DecryptFailed,
}

/// Result alias for media operations
pub type Result<T> = std::result::Result<T, Error>;
