//! Opus audio codec stages.

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{error, trace};

use confero_transport_core::socket::{Packet, PacketSink, SharedSink};
use confero_transport_core::{Address, RtpPacket, RtpPayloadType};

use crate::error::Result;
use crate::payload_crc32;

const ENCODE_BUFFER_SIZE: usize = 1024 * 10;

struct EncoderState {
    receiver: Option<SharedSink>,
    encoder: Option<opus::Encoder>,
    sample_freq: u32,
    quality: i32,
    bitrate_kbps: i32,
    packet_loss: i32,
}

/// Opus encoder: mono, VOIP application, inband FEC, CBR. Every encoded
/// packet is stamped with `ext[0] = crc32(payload)` so receivers can verify
/// frame integrity end to end.
pub struct AudioEncoder {
    state: Mutex<EncoderState>,
}

impl AudioEncoder {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EncoderState {
                receiver: None,
                encoder: None,
                sample_freq: 48_000,
                quality: 10,
                bitrate_kbps: 30,
                packet_loss: 0,
            }),
        }
    }

    pub fn set_receiver(&self, receiver: Option<SharedSink>) {
        self.state.lock().receiver = receiver;
    }

    /// Encoder effort, 0..10. Stored as the session's quality knob; the
    /// binding applies it at start where libopus allows.
    pub fn set_quality(&self, quality: i32) {
        self.state.lock().quality = quality.clamp(0, 10);
    }

    pub fn set_bitrate(&self, kbps: i32) {
        let mut state = self.state.lock();
        state.bitrate_kbps = kbps;
        if let Some(encoder) = state.encoder.as_mut() {
            if let Err(e) = encoder.set_bitrate(opus::Bitrate::Bits(kbps * 1000)) {
                error!("AudioEncoder :: set_bitrate error: {e}");
            }
        }
    }

    pub fn bitrate(&self) -> i32 {
        self.state.lock().bitrate_kbps
    }

    pub fn set_sample_freq(&self, freq: u32) {
        let restart = {
            let mut state = self.state.lock();
            state.sample_freq = freq;
            state.encoder.is_some()
        };
        if restart {
            self.stop();
            if let Err(e) = self.start() {
                error!("AudioEncoder :: restart error: {e}");
            }
        }
    }

    /// Live packet-loss feedback from RTCP stats; drives the FEC strength.
    pub fn set_packet_loss(&self, percent: i32) {
        let mut state = self.state.lock();
        state.packet_loss = percent;
        if let Some(encoder) = state.encoder.as_mut() {
            if let Err(e) = encoder.set_packet_loss_perc(percent) {
                error!("AudioEncoder :: set_packet_loss_perc error: {e}");
            }
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.encoder.is_some() {
            return Ok(());
        }

        let mut encoder = opus::Encoder::new(
            state.sample_freq,
            opus::Channels::Mono,
            opus::Application::Voip,
        )?;
        encoder.set_bitrate(opus::Bitrate::Bits(state.bitrate_kbps * 1000))?;
        encoder.set_vbr(false)?;
        encoder.set_inband_fec(true)?;
        encoder.set_packet_loss_perc(state.packet_loss)?;

        state.encoder = Some(encoder);
        Ok(())
    }

    pub fn stop(&self) {
        self.state.lock().encoder = None;
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().encoder.is_some()
    }

    fn encode_frame(&self, packet: RtpPacket) {
        let mut state = self.state.lock();
        let Some(encoder) = state.encoder.as_mut() else { return };

        let samples: Vec<i16> = packet
            .payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        let encoded = match encoder.encode_vec(&samples, ENCODE_BUFFER_SIZE) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("AudioEncoder :: encode error: {e}");
                return;
            }
        };
        if encoded.is_empty() {
            return;
        }

        let mut header = packet.header;
        header.payload_type = RtpPayloadType::Opus as u8;
        header.set_extension_word(payload_crc32(&encoded));

        if let Some(receiver) = state.receiver.clone() {
            drop(state);
            receiver.send_packet(Packet::Rtp(RtpPacket::new(header, Bytes::from(encoded))), None);
        }
    }
}

impl Default for AudioEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSink for AudioEncoder {
    fn send_packet(&self, packet: Packet, _addr: Option<&Address>) {
        if let Packet::Rtp(packet) = packet {
            if self.is_started() {
                self.encode_frame(packet);
            }
        }
    }
}

struct DecoderState {
    receiver: Option<SharedSink>,
    decoder: Option<opus::Decoder>,
    sample_freq: u32,
    channels: u32,
    last_seq: u16,
}

/// Opus decoder with per-gap loss concealment: every missing sequence number
/// produces one concealment decode before the received packet is decoded.
pub struct AudioDecoder {
    state: Mutex<DecoderState>,
}

impl AudioDecoder {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DecoderState {
                receiver: None,
                decoder: None,
                sample_freq: 48_000,
                channels: 1,
                last_seq: 0,
            }),
        }
    }

    pub fn set_receiver(&self, receiver: Option<SharedSink>) {
        self.state.lock().receiver = receiver;
    }

    pub fn set_sample_freq(&self, freq: u32) {
        let restart = {
            let mut state = self.state.lock();
            state.sample_freq = freq;
            state.decoder.is_some()
        };
        if restart {
            self.stop();
            if let Err(e) = self.start() {
                error!("AudioDecoder :: restart error: {e}");
            }
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.decoder.is_some() {
            return Ok(());
        }
        state.last_seq = 0;
        let channels = if state.channels == 2 { opus::Channels::Stereo } else { opus::Channels::Mono };
        state.decoder = Some(opus::Decoder::new(state.sample_freq, channels)?);
        Ok(())
    }

    pub fn stop(&self) {
        self.state.lock().decoder = None;
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().decoder.is_some()
    }

    fn decode_one(state: &mut DecoderState, data: &[u8], header: &confero_transport_core::RtpHeader) {
        let Some(decoder) = state.decoder.as_mut() else { return };

        // Capacity for up to 40 ms at the configured rate.
        let capacity = (state.sample_freq / 100) as usize * state.channels as usize * 4;
        let mut pcm = vec![0i16; capacity];

        let samples = match decoder.decode(data, &mut pcm, false) {
            Ok(samples) => samples,
            Err(e) => {
                error!("AudioDecoder :: decode error: {e}");
                return;
            }
        };
        if samples == 0 {
            return;
        }

        let byte_count = samples * state.channels as usize * 2;
        let mut payload = Vec::with_capacity(byte_count);
        for sample in &pcm[..samples * state.channels as usize] {
            payload.extend_from_slice(&sample.to_le_bytes());
        }

        if let Some(receiver) = state.receiver.clone() {
            receiver.send_packet(
                Packet::Rtp(RtpPacket::new(*header, Bytes::from(payload))),
                None,
            );
        }
    }
}

impl Default for AudioDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSink for AudioDecoder {
    fn send_packet(&self, packet: Packet, _addr: Option<&Address>) {
        let Packet::Rtp(packet) = packet else { return };
        let mut state = self.state.lock();
        if state.decoder.is_none() {
            return;
        }

        // One concealment decode per missing packet before the real one.
        while state.last_seq != 0 && packet.header.seq > state.last_seq + 1 {
            trace!("AudioDecoder :: concealing lost packet, seq: {}", state.last_seq + 1);
            Self::decode_one(&mut state, &[], &packet.header);
            state.last_seq += 1;
        }

        Self::decode_one(&mut state, &packet.payload, &packet.header);
        state.last_seq = packet.header.seq;
    }
}
