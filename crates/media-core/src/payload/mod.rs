//! VP8 frame fragmentation over RTP.
//!
//! The splitter cuts one encoded frame into MTU-sized fragments, each with a
//! one-octet VP8 payload descriptor, and stamps every fragment's extension
//! block with the CRC-32 of the whole pre-split frame (word 0) and the
//! original frame sequence number (word 1). The collector reassembles by
//! fragment sequence offsets and only delivers a frame once the CRC over the
//! rebuilt buffer matches, deferring delivery to the next frame boundary so
//! a lost final fragment cannot produce a truncated frame.

mod collector;
mod splitter;

pub use collector::VideoCollector;
pub use splitter::VideoSplitter;

/// Fragment payload size. Fixed to the deployment's path MTU; there is no
/// negotiation with the peer.
pub const SPLITTED_PACKET_SIZE: usize = 1200;

/// S flag of the one-octet payload descriptor (first fragment of a frame).
pub(crate) const DESCRIPTOR_S_FLAG: u8 = 1 << 3;

/// Descriptor size derived from its first two octets. Bit positions follow
/// the deployed wire convention: X on octet 0, then I/L/T/K on octet 1.
pub(crate) fn payload_descriptor_size(octet0: u8, octet1: u8) -> usize {
    let mut size = 1;
    if octet0 & 0x01 != 0 {
        // X: extension octet present
        size += 1;
        if octet1 & 0x02 != 0 {
            size += 1; // PictureID
        }
        if octet1 & 0x04 != 0 {
            size += 1; // TL0PICIDX
        }
        if octet1 & 0x08 != 0 || octet1 & 0x10 != 0 {
            size += 1; // TID / KEYIDX
        }
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;

    use confero_transport_core::socket::{FnSink, Packet, PacketSink, SharedSink};
    use confero_transport_core::{RtpHeader, RtpPacket, RtpPayloadType};

    use crate::payload_crc32;

    fn frame_packet(seq: u16, payload: &[u8]) -> RtpPacket {
        let header = RtpHeader {
            payload_type: RtpPayloadType::Vp8 as u8,
            seq,
            ts: seq as u32 * 3600,
            ssrc: 7,
            ..RtpHeader::default()
        };
        RtpPacket::new(header, Bytes::copy_from_slice(payload))
    }

    fn capture() -> (SharedSink, Arc<Mutex<Vec<RtpPacket>>>) {
        let store = Arc::new(Mutex::new(Vec::new()));
        let sink_store = store.clone();
        let sink: SharedSink = Arc::new(FnSink(move |packet, _| {
            if let Packet::Rtp(p) = packet {
                sink_store.lock().push(p);
            }
        }));
        (sink, store)
    }

    fn wire_pair() -> (VideoSplitter, Arc<VideoCollector>, Arc<Mutex<Vec<RtpPacket>>>) {
        let collector = Arc::new(VideoCollector::new());
        let (frames_sink, frames) = capture();
        collector.set_receiver(Some(frames_sink));

        let splitter = VideoSplitter::new();
        splitter.set_receiver(Some(collector.clone() as SharedSink));
        (splitter, collector, frames)
    }

    fn payload_of_len(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn lossless_channel_reproduces_exact_payloads() {
        let (splitter, _collector, frames) = wire_pair();

        let sizes = [1usize, 100, SPLITTED_PACKET_SIZE, SPLITTED_PACKET_SIZE + 1, 5000, 40_000];
        for (i, &len) in sizes.iter().enumerate() {
            let payload = payload_of_len(len, i as u8);
            splitter.send_packet(Packet::Rtp(frame_packet(100 + i as u16, &payload)), None);
        }

        // Each frame is delivered when the next frame's first fragment
        // arrives, so all but the last are out.
        let frames = frames.lock();
        assert_eq!(frames.len(), sizes.len() - 1);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.payload, Bytes::from(payload_of_len(sizes[i], i as u8)));
            assert_eq!(frame.header.seq, 100 + i as u16);
        }
    }

    #[test]
    fn fragments_carry_crc_and_original_seq() {
        let splitter = VideoSplitter::new();
        let (fragments_sink, fragments) = capture();
        splitter.set_receiver(Some(fragments_sink));

        let payload = payload_of_len(3000, 1);
        splitter.send_packet(Packet::Rtp(frame_packet(500, &payload)), None);

        let fragments = fragments.lock();
        assert_eq!(fragments.len(), 3);
        let crc = payload_crc32(&payload);
        for (i, fragment) in fragments.iter().enumerate() {
            assert!(fragment.header.extension);
            assert_eq!(fragment.header.extension_len, 2);
            assert_eq!(fragment.header.ext[0], crc);
            assert_eq!(fragment.header.ext[1], 500);
            let s_set = fragment.payload[0] & DESCRIPTOR_S_FLAG != 0;
            assert_eq!(s_set, i == 0);
        }
        // Fragment sequences are the splitter's own monotone counter.
        assert_eq!(fragments[0].header.seq + 1, fragments[1].header.seq);
    }

    #[test]
    fn corrupted_fragment_suppresses_the_frame() {
        let collector = Arc::new(VideoCollector::new());
        let (frames_sink, frames) = capture();
        collector.set_receiver(Some(frames_sink));

        let splitter = VideoSplitter::new();
        let (fragments_sink, fragments) = capture();
        splitter.set_receiver(Some(fragments_sink));

        splitter.send_packet(Packet::Rtp(frame_packet(1, &payload_of_len(3000, 9))), None);
        splitter.send_packet(Packet::Rtp(frame_packet(2, &payload_of_len(100, 10))), None);
        splitter.send_packet(Packet::Rtp(frame_packet(3, &payload_of_len(100, 11))), None);

        let mut wire: Vec<RtpPacket> = fragments.lock().clone();
        // Flip one byte inside the first frame's middle fragment.
        let mut corrupted = wire[1].payload.to_vec();
        corrupted[10] ^= 0xff;
        wire[1] = RtpPacket::new(wire[1].header, Bytes::from(corrupted));

        for packet in wire {
            collector.send_packet(Packet::Rtp(packet), None);
        }

        // Frame 1 fails its CRC gate; frame 2 survives.
        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.seq, 2);
    }

    #[test]
    fn reorder_within_a_frame_is_tolerated() {
        let collector = Arc::new(VideoCollector::new());
        let (frames_sink, frames) = capture();
        collector.set_receiver(Some(frames_sink));

        let splitter = VideoSplitter::new();
        let (fragments_sink, fragments) = capture();
        splitter.set_receiver(Some(fragments_sink));

        let payload = payload_of_len(4000, 3);
        splitter.send_packet(Packet::Rtp(frame_packet(11, &payload)), None);
        splitter.send_packet(Packet::Rtp(frame_packet(12, &payload_of_len(10, 4))), None);

        let mut wire: Vec<RtpPacket> = fragments.lock().clone();
        // Swap two non-first fragments of frame 11.
        wire.swap(1, 2);

        for packet in wire {
            collector.send_packet(Packet::Rtp(packet), None);
        }

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, Bytes::from(payload));
    }

    #[test]
    fn duplicate_fragments_are_dropped() {
        let (splitter, collector, frames) = wire_pair();

        let splitter_fragments = {
            let (sink, store) = capture();
            splitter.set_receiver(Some(sink));
            splitter.send_packet(Packet::Rtp(frame_packet(21, &payload_of_len(2000, 5))), None);
            splitter.send_packet(Packet::Rtp(frame_packet(22, &payload_of_len(10, 6))), None);
            store
        };

        for packet in splitter_fragments.lock().iter() {
            collector.send_packet(Packet::Rtp(packet.clone()), None);
            // Duplicate every fragment; reassembly must be unaffected.
            collector.send_packet(Packet::Rtp(packet.clone()), None);
        }

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, Bytes::from(payload_of_len(2000, 5)));
    }
}
