//! Media transport layer for the Confero conferencing client.
//!
//! This crate owns everything below the codecs: socket addressing, the
//! RTP/RTCP wire codec with the engine's CRC extension convention, the UDP
//! media socket, the TCP tunnel fallback and the WebSocket media (WSM)
//! fallback. Upper layers talk to every transport through the same
//! [`PacketSink`] contract, so a capture pipeline does not care whether its
//! packets leave over UDP, a TCP tunnel pipe or the signalling WebSocket.

pub mod address;
pub mod error;
pub mod packet;
pub mod socket;
pub mod tunnel;
pub mod udp;
pub mod wsm;

pub use address::Address;
pub use error::{Error, Result};
pub use packet::rtcp::{AppMessageType, RemoteControlAction, RtcpBody, RtcpPacket};
pub use packet::{RtpHeader, RtpPacket, RtpPayloadType};
pub use socket::{Packet, PacketSink, SharedSink};
pub use tunnel::{TunnelClient, TunnelServer};
pub use udp::UdpSocket;
pub use wsm::WsmSocket;

/// Largest datagram the engine sends or receives.
pub const MAX_DATAGRAM_SIZE: usize = 65535;
