//! The uniform sink contract every transport and pipeline stage presents.
//!
//! Pipelines are forward chains of [`PacketSink`]s: encoder → splitter →
//! encryptor → socket on the send side, socket → decryptor → collector →
//! decoder → jitter buffer on the receive side. Receivers are installed as an
//! independently nullable (rtp, rtcp) pair and packets are dispatched on
//! parse success.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::address::Address;
use crate::packet::rtcp::RtcpPacket;
use crate::packet::RtpPacket;

/// A tagged media-plane packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rtp(RtpPacket),
    Rtcp(RtcpPacket),
}

impl Packet {
    pub fn serialize(&self) -> bytes::Bytes {
        match self {
            Packet::Rtp(p) => p.serialize(),
            Packet::Rtcp(p) => p.serialize(),
        }
    }
}

impl From<RtpPacket> for Packet {
    fn from(packet: RtpPacket) -> Self {
        Packet::Rtp(packet)
    }
}

impl From<RtcpPacket> for Packet {
    fn from(packet: RtcpPacket) -> Self {
        Packet::Rtcp(packet)
    }
}

/// One stage in a media pipeline. Implementations must not block: transports
/// queue writes internally and processing stages hand off synchronously.
pub trait PacketSink: Send + Sync {
    /// Deliver one packet. `addr` names the peer it came from (receive path)
    /// or overrides the destination (send path); `None` uses the default.
    fn send_packet(&self, packet: Packet, addr: Option<&Address>);
}

/// Shared handle to a pipeline stage.
pub type SharedSink = Arc<dyn PacketSink>;

/// The independently nullable (rtp, rtcp) receiver pair a transport
/// dispatches into.
#[derive(Default)]
pub struct ReceiverPair {
    inner: RwLock<(Option<SharedSink>, Option<SharedSink>)>,
}

impl ReceiverPair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, rtp: Option<SharedSink>, rtcp: Option<SharedSink>) {
        *self.inner.write() = (rtp, rtcp);
    }

    pub fn dispatch_rtp(&self, packet: RtpPacket, addr: &Address) {
        if let Some(sink) = self.inner.read().0.clone() {
            sink.send_packet(Packet::Rtp(packet), Some(addr));
        }
    }

    pub fn dispatch_rtcp(&self, packet: RtcpPacket, addr: &Address) {
        if let Some(sink) = self.inner.read().1.clone() {
            sink.send_packet(Packet::Rtcp(packet), Some(addr));
        }
    }
}

/// Function adapter so closures can terminate a pipeline in tests and small
/// wiring spots.
pub struct FnSink<F: Fn(Packet, Option<&Address>) + Send + Sync>(pub F);

impl<F: Fn(Packet, Option<&Address>) + Send + Sync> PacketSink for FnSink<F> {
    fn send_packet(&self, packet: Packet, addr: Option<&Address>) {
        (self.0)(packet, addr)
    }
}
