//! End-to-end audio path over a UDP loopback: encoder -> encryptor ->
//! socket -> socket -> decryptor -> decoder -> jitter buffer, pulled the way
//! the mixer pulls a renderer input.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use confero_media_core::codec::{AudioDecoder, AudioEncoder};
use confero_media_core::{Decryptor, Encryptor, JitterBuffer, JitterMode, TimeMeter};
use confero_transport_core::socket::{Packet, PacketSink};
use confero_transport_core::{Address, RtpHeader, RtpPacket, UdpSocket};

const FRAME_SAMPLES: usize = 1920; // 40 ms at 48 kHz mono

fn pcm_frame(seq: u16) -> RtpPacket {
    let header = RtpHeader { seq, ssrc: 21, ..RtpHeader::default() };
    let payload: Vec<u8> = (0..FRAME_SAMPLES)
        .flat_map(|i| {
            let sample = (2000.0
                * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin())
                as i16;
            sample.to_le_bytes()
        })
        .collect();
    RtpPacket::new(header, Bytes::from(payload))
}

#[test]
fn udp_loopback_call_delivers_every_pcm_frame() {
    let secure_key = "conference-key";
    let frames: u16 = 25; // one second of audio

    // Receive side, bottom-up.
    let jitter = Arc::new(JitterBuffer::new(TimeMeter::new()));
    jitter.start(JitterMode::Sound, "e2e");

    let decoder = Arc::new(AudioDecoder::new());
    decoder.set_receiver(Some(jitter.clone()));
    decoder.start().unwrap();

    let decryptor = Arc::new(Decryptor::new());
    decryptor.set_receiver(Some(decoder.clone()));
    decryptor.start(secure_key);

    let receiver_socket = UdpSocket::new();
    receiver_socket.start(false, 0).unwrap();
    receiver_socket.set_receivers(Some(decryptor), None);

    // Send side.
    let sender_socket = Arc::new(UdpSocket::new());
    sender_socket.start(false, 0).unwrap();
    sender_socket
        .set_default_address(Address::resolve("127.0.0.1", receiver_socket.bound_port()).unwrap());

    let encryptor = Arc::new(Encryptor::new());
    encryptor.set_receiver(Some(sender_socket.clone()));
    encryptor.start(secure_key);

    let encoder = AudioEncoder::new();
    encoder.set_receiver(Some(encryptor));
    encoder.start().unwrap();

    for seq in 1..=frames {
        encoder.send_packet(Packet::Rtp(pcm_frame(seq)), None);
    }

    // Let the datagrams land, then pull the way the mixer does.
    std::thread::sleep(Duration::from_millis(300));
    let mut pcm_bytes = 0usize;
    let mut emitted = 0u32;
    for _ in 0..frames + 10 {
        if let Some(frame) = jitter.get_frame() {
            pcm_bytes += frame.payload.len();
            emitted += 1;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    // Every frame makes it through, give or take the one the buffer may
    // still be holding for accumulation.
    let expected = frames as usize * FRAME_SAMPLES * 2;
    let frame_bytes = FRAME_SAMPLES * 2;
    assert!(
        pcm_bytes + frame_bytes >= expected && pcm_bytes <= expected,
        "delivered {pcm_bytes} of {expected} PCM bytes ({emitted} frames)"
    );

    receiver_socket.stop();
    sender_socket.stop();
}
