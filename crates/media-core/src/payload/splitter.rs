//! Send-side frame fragmenter.

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use confero_transport_core::socket::{Packet, PacketSink, SharedSink};
use confero_transport_core::{Address, RtpPacket};

use super::{DESCRIPTOR_S_FLAG, SPLITTED_PACKET_SIZE};
use crate::payload_crc32;

struct SplitterState {
    receiver: Option<SharedSink>,
    last_seq: u16,
}

/// Splits one encoded VP8 frame into descriptor-prefixed RTP fragments.
/// Fragment sequence numbers come from the splitter's own counter; the
/// frame's original sequence travels in extension word 1.
pub struct VideoSplitter {
    state: Mutex<SplitterState>,
}

impl VideoSplitter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SplitterState { receiver: None, last_seq: 0 }),
        }
    }

    pub fn set_receiver(&self, receiver: Option<SharedSink>) {
        self.state.lock().receiver = receiver;
    }

    pub fn reset(&self) {
        self.state.lock().last_seq = 0;
    }

    fn split(&self, packet: RtpPacket) {
        let receiver = {
            let state = self.state.lock();
            state.receiver.clone()
        };
        let Some(receiver) = receiver else { return };

        let crc = payload_crc32(&packet.payload);
        let mut descriptor = DESCRIPTOR_S_FLAG;

        let mut pos = 0usize;
        while pos != packet.payload.len() {
            let size = (packet.payload.len() - pos).min(SPLITTED_PACKET_SIZE);

            let mut header = packet.header;
            header.seq = {
                let mut state = self.state.lock();
                state.last_seq = state.last_seq.wrapping_add(1);
                state.last_seq
            };
            header.extension = true;
            header.extension_len = 2;
            header.ext[0] = crc;
            header.ext[1] = packet.header.seq as u32;

            let mut payload = BytesMut::with_capacity(size + 1);
            payload.put_u8(descriptor);
            payload.put_slice(&packet.payload[pos..pos + size]);

            receiver.send_packet(Packet::Rtp(RtpPacket::new(header, payload.freeze())), None);

            // Yield between fragments to soften the burst.
            std::thread::yield_now();

            pos += size;
            descriptor = 0;
        }
    }
}

impl Default for VideoSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSink for VideoSplitter {
    fn send_packet(&self, packet: Packet, _addr: Option<&Address>) {
        if let Packet::Rtp(packet) = packet {
            if !packet.payload.is_empty() {
                self.split(packet);
            }
        }
    }
}
