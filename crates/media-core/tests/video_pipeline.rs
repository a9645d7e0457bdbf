//! End-to-end video path: encoder -> splitter -> lossy link -> collector ->
//! decoder, with the force-keyframe back-channel closed onto the encoder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use confero_media_core::codec::{VideoDecoder, VideoEncoder};
use confero_media_core::{ColorSpace, Resolution, TimeMeter, VideoCollector, VideoSplitter};
use confero_transport_core::socket::{FnSink, Packet, PacketSink, SharedSink};
use confero_transport_core::{RtpHeader, RtpPacket};

fn i420_frame(resolution: Resolution, shade: u8) -> Bytes {
    Bytes::from(vec![shade; resolution.i420_size()])
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

#[test]
fn lossy_channel_recovers_with_forced_key_frames() {
    let resolution = Resolution::QVGA;
    let total_frames: u16 = 100;
    // Every 10th frame vanishes on the link (all of its fragments).
    let lost = |seq: u16| seq % 10 == 5;

    let encoder = Arc::new(VideoEncoder::new());
    encoder.set_resolution(resolution);
    let (encoded_sink, encoded) = capture();
    encoder.set_receiver(Some(encoded_sink));
    encoder.start().unwrap();

    let splitter = VideoSplitter::new();
    let (fragment_sink, fragments) = capture();
    splitter.set_receiver(Some(fragment_sink));

    let collector = Arc::new(VideoCollector::new());
    let (frame_sink, assembled) = capture();
    collector.set_receiver(Some(frame_sink));

    let decoder = Arc::new(VideoDecoder::new(TimeMeter::new()));
    decoder.set_resolution(resolution);
    let (decoded_sink, decoded) = capture();
    decoder.set_receiver(Some(decoded_sink));

    // Close the loop: a decoder gap asks the encoder for a keyframe.
    let force_requests = Arc::new(AtomicUsize::new(0));
    let requests = force_requests.clone();
    let upstream = encoder.clone();
    decoder.set_key_frame_request(Some(Arc::new(move |_| {
        requests.fetch_add(1, Ordering::SeqCst);
        upstream.force_key_frame();
    })));
    decoder.start(ColorSpace::I420).unwrap();

    for seq in 1..=total_frames {
        // Encode one frame, fragment it, maybe lose it, feed the rest.
        let header = RtpHeader { seq, ssrc: 12, ..RtpHeader::default() };
        encoder.send_packet(
            Packet::Rtp(RtpPacket::new(header, i420_frame(resolution, 40 + (seq % 100) as u8))),
            None,
        );
        for packet in encoded.lock().drain(..) {
            splitter.send_packet(Packet::Rtp(packet), None);
        }
        for fragment in fragments.lock().drain(..) {
            if !lost(seq) {
                collector.send_packet(Packet::Rtp(fragment), None);
            }
        }
        for frame in assembled.lock().drain(..) {
            decoder.send_packet(Packet::Rtp(frame), None);
        }
        if lost(seq) {
            // Let the keyframe-request throttle open up again.
            std::thread::sleep(std::time::Duration::from_millis(210));
        }
    }

    let decoded = decoded.lock();
    // Ten frames vanished on the link; a few more are rejected while each
    // forced keyframe is in flight. The bulk of the call survives.
    assert!(decoded.len() >= 66, "decoded only {} frames", decoded.len());
    assert!(
        force_requests.load(Ordering::SeqCst) >= 1,
        "no force-keyframe request was raised"
    );
    // The stream is healthy again at the end.
    assert!(decoded.iter().rev().take(3).all(|f| f.payload.len() == resolution.i420_size()));
}
