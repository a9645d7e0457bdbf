//! Two-way packet tee.
//!
//! Capture pipelines fork the encoded stream to a local renderer, receive
//! pipelines fork the decrypted stream to the recorder. Either leg can be
//! absent or swapped at runtime (muting swaps the decoder leg out).

use parking_lot::RwLock;

use confero_transport_core::socket::{Packet, PacketSink, SharedSink};
use confero_transport_core::Address;

/// Forwards every packet to up to two receivers.
#[derive(Default)]
pub struct Tee {
    receivers: RwLock<(Option<SharedSink>, Option<SharedSink>)>,
}

impl Tee {
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary leg (the main pipeline).
    pub fn set_receiver0(&self, receiver: Option<SharedSink>) {
        self.receivers.write().0 = receiver;
    }

    /// Secondary leg (local renderer or recorder).
    pub fn set_receiver1(&self, receiver: Option<SharedSink>) {
        self.receivers.write().1 = receiver;
    }
}

impl PacketSink for Tee {
    fn send_packet(&self, packet: Packet, addr: Option<&Address>) {
        let (first, second) = {
            let receivers = self.receivers.read();
            (receivers.0.clone(), receivers.1.clone())
        };
        if let Some(receiver) = first {
            receiver.send_packet(packet.clone(), addr);
        }
        if let Some(receiver) = second {
            receiver.send_packet(packet, addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use confero_transport_core::socket::FnSink;
    use confero_transport_core::{RtpHeader, RtpPacket};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn both_legs_receive_and_either_can_be_absent() {
        let tee = Tee::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let count = first.clone();
        tee.set_receiver0(Some(Arc::new(FnSink(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
        }))));
        let count = second.clone();
        tee.set_receiver1(Some(Arc::new(FnSink(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
        }))));

        let packet = Packet::Rtp(RtpPacket::new(RtpHeader::default(), Bytes::new()));
        tee.send_packet(packet.clone(), None);
        tee.set_receiver1(None);
        tee.send_packet(packet, None);

        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
