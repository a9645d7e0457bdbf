//! Error types for the transport layer.

use std::io;

/// Transport layer error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Packet bytes did not form a valid RTP/RTCP packet
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// Buffer too small for the requested operation
    #[error("buffer too small: required {required}, available {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// Host name did not resolve to a usable address
    #[error("cannot resolve address {0}")]
    AddressResolution(String),

    /// A tunnel frame violated the framing contract
    #[error("invalid tunnel frame: {0}")]
    InvalidTunnelFrame(&'static str),

    /// Packet exceeds what the transport can carry
    #[error("packet too large for transport: {size} bytes")]
    PacketTooLarge { size: usize },

    /// Socket is not running
    #[error("socket not started")]
    NotStarted,

    /// Underlying socket I/O failure
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),

    /// WebSocket failure on the WSM path
    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// Result alias used throughout the transport layer
pub type Result<T> = std::result::Result<T, Error>;
