//! Receive-side frame reassembler.

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{trace, warn};

use confero_transport_core::socket::{Packet, PacketSink, SharedSink};
use confero_transport_core::{Address, RtpHeader, RtpPacket};

use super::{payload_descriptor_size, DESCRIPTOR_S_FLAG, SPLITTED_PACKET_SIZE};
use crate::payload_crc32;

const REASSEMBLY_BUFFER_SIZE: usize = 1024 * 1024;

struct CollectorState {
    receiver: Option<SharedSink>,
    buffer: Vec<u8>,
    size: usize,
    header: RtpHeader,
    last_packet_seq: u16,
    first_frame_packet_seq: u16,
    current_frame_seq: u32,
    last_crc: u32,
}

/// Rebuilds frames from splitter fragments. A frame is delivered only when
/// the next frame's first fragment arrives and the CRC over the rebuilt
/// bytes matches the CRC stamped by the sender.
pub struct VideoCollector {
    state: Mutex<CollectorState>,
}

impl VideoCollector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CollectorState {
                receiver: None,
                buffer: vec![0u8; REASSEMBLY_BUFFER_SIZE],
                size: 0,
                header: RtpHeader::default(),
                last_packet_seq: 0,
                first_frame_packet_seq: 0,
                current_frame_seq: 0,
                last_crc: 0,
            }),
        }
    }

    pub fn set_receiver(&self, receiver: Option<SharedSink>) {
        self.state.lock().receiver = receiver;
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.size = 0;
        state.header = RtpHeader::default();
        state.last_packet_seq = 0;
        state.first_frame_packet_seq = 0;
        state.current_frame_seq = 0;
        state.last_crc = 0;
    }

    fn process(&self, packet: RtpPacket) {
        let mut state = self.state.lock();

        if packet.payload.is_empty()
            || (state.last_packet_seq != 0 && state.last_packet_seq == packet.header.seq)
        {
            return; // empty packets and duplicates
        }
        state.last_packet_seq = packet.header.seq;

        let octet0 = packet.payload[0];
        let octet1 = if packet.payload.len() > 1 { packet.payload[1] } else { 0 };
        let descriptor_size = payload_descriptor_size(octet0, octet1);

        if octet0 & DESCRIPTOR_S_FLAG != 0 {
            // First fragment of a new frame: the previous frame is complete
            // now (or never will be) and leaves iff its CRC holds.
            state.first_frame_packet_seq = packet.header.seq;
            state.current_frame_seq = packet.header.ext[1];

            if state.size != 0 && state.last_crc == payload_crc32(&state.buffer[..state.size]) {
                self.deliver(&mut state);
            } else if state.size != 0 {
                trace!(
                    "VideoCollector :: dropped frame, seq: {}, size: {}",
                    state.header.ext[1],
                    state.size
                );
            }

            state.last_crc = packet.header.ext[0];
            state.header = packet.header;
            state.size = 0;
        }

        if packet.header.ext[1] == state.current_frame_seq
            && packet.payload.len() > descriptor_size
        {
            let data_size = packet.payload.len() - descriptor_size;
            let pos = packet.header.seq.wrapping_sub(state.first_frame_packet_seq) as usize
                * SPLITTED_PACKET_SIZE;

            if pos + data_size <= REASSEMBLY_BUFFER_SIZE {
                state.buffer[pos..pos + data_size]
                    .copy_from_slice(&packet.payload[descriptor_size..]);
                state.size += data_size;
            } else {
                warn!("VideoCollector :: reassembly buffer overflow, fragment dropped");
            }
        }
    }

    fn deliver(&self, state: &mut CollectorState) {
        let Some(receiver) = state.receiver.clone() else { return };

        let mut header = state.header;
        header.seq = header.ext[1] as u16;

        let frame = Bytes::copy_from_slice(&state.buffer[..state.size]);
        receiver.send_packet(Packet::Rtp(RtpPacket::new(header, frame)), None);
    }
}

impl Default for VideoCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSink for VideoCollector {
    fn send_packet(&self, packet: Packet, _addr: Option<&Address>) {
        if let Packet::Rtp(packet) = packet {
            self.process(packet);
        }
    }
}
