//! Voice processing chain: three-band splitting filter in front of noise
//! suppression, echo cancellation and automatic gain control.
//!
//! The chain exposes two sinks. The microphone sink carries near-end frames
//! through the enabled processors and forwards the result; the speaker sink
//! only feeds the far-end reference into the echo canceller. Any combination
//! of the three processors can be enabled; with all of them off the chain is
//! a passthrough.

pub mod aec;
pub mod agc;
pub mod bands;
pub mod ns;

pub use aec::{AecConfig, EchoCanceller};
pub use agc::{AgcConfig, AutomaticGainControl};
pub use bands::{ThreeBandFilterBank, BAND_FRAME, FULLBAND_FRAME, NUM_BANDS};
pub use ns::{NoiseSuppressor, NsConfig};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::info;

use confero_transport_core::socket::{Packet, PacketSink, SharedSink};
use confero_transport_core::{Address, RtpPacket};

struct MicrophoneState {
    bank: ThreeBandFilterBank,
    ns: NoiseSuppressor,
    agc: AutomaticGainControl,
}

struct SpeakerState {
    bank: ThreeBandFilterBank,
}

struct Inner {
    runned: AtomicBool,
    aec_enabled: AtomicBool,
    ns_enabled: AtomicBool,
    agc_enabled: AtomicBool,
    receiver: Mutex<Option<SharedSink>>,
    microphone: Mutex<MicrophoneState>,
    speaker: Mutex<SpeakerState>,
    canceller: Mutex<EchoCanceller>,
}

/// The AEC/NS/AGC subsystem.
pub struct VoiceProcessor {
    inner: Arc<Inner>,
}

impl VoiceProcessor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                runned: AtomicBool::new(false),
                aec_enabled: AtomicBool::new(true),
                ns_enabled: AtomicBool::new(true),
                agc_enabled: AtomicBool::new(true),
                receiver: Mutex::new(None),
                microphone: Mutex::new(MicrophoneState {
                    bank: ThreeBandFilterBank::new(),
                    ns: NoiseSuppressor::new(NsConfig::default()),
                    agc: AutomaticGainControl::new(AgcConfig::default()),
                }),
                speaker: Mutex::new(SpeakerState { bank: ThreeBandFilterBank::new() }),
                canceller: Mutex::new(EchoCanceller::new(AecConfig::default())),
            }),
        }
    }

    /// Processed microphone frames leave through this receiver.
    pub fn set_receiver(&self, receiver: Option<SharedSink>) {
        *self.inner.receiver.lock() = receiver;
    }

    /// Near-end input sink.
    pub fn microphone_sink(&self) -> SharedSink {
        Arc::new(MicrophoneSink(self.inner.clone()))
    }

    /// Far-end reference sink.
    pub fn speaker_sink(&self) -> SharedSink {
        Arc::new(SpeakerSink(self.inner.clone()))
    }

    pub fn start(&self) {
        if self.inner.runned.swap(true, Ordering::SeqCst) {
            return;
        }
        // Fresh filter state on every start.
        *self.inner.microphone.lock() = MicrophoneState {
            bank: ThreeBandFilterBank::new(),
            ns: NoiseSuppressor::new(NsConfig::default()),
            agc: AutomaticGainControl::new(AgcConfig::default()),
        };
        *self.inner.speaker.lock() = SpeakerState { bank: ThreeBandFilterBank::new() };
        *self.inner.canceller.lock() = EchoCanceller::new(AecConfig::default());
        info!("VoiceProcessor started");
    }

    pub fn stop(&self) {
        if self.inner.runned.swap(false, Ordering::SeqCst) {
            info!("VoiceProcessor stopped");
        }
    }

    pub fn enable_aec(&self, yes: bool) {
        self.inner.aec_enabled.store(yes, Ordering::SeqCst);
    }

    pub fn aec_enabled(&self) -> bool {
        self.inner.aec_enabled.load(Ordering::SeqCst)
    }

    pub fn enable_ns(&self, yes: bool) {
        self.inner.ns_enabled.store(yes, Ordering::SeqCst);
    }

    pub fn ns_enabled(&self) -> bool {
        self.inner.ns_enabled.load(Ordering::SeqCst)
    }

    pub fn enable_agc(&self, yes: bool) {
        self.inner.agc_enabled.store(yes, Ordering::SeqCst);
    }

    pub fn agc_enabled(&self) -> bool {
        self.inner.agc_enabled.load(Ordering::SeqCst)
    }

    pub fn set_mic_level(&self, level: i32) {
        self.inner.microphone.lock().agc.set_mic_level(level);
    }

    pub fn set_render_latency(&self, latency_ms: u32) {
        self.inner.canceller.lock().set_render_latency(latency_ms);
    }
}

impl Default for VoiceProcessor {
    fn default() -> Self {
        Self::new()
    }
}

struct MicrophoneSink(Arc<Inner>);

impl PacketSink for MicrophoneSink {
    fn send_packet(&self, packet: Packet, addr: Option<&Address>) {
        let Packet::Rtp(packet) = packet else { return };
        let inner = &self.0;
        if !inner.runned.load(Ordering::SeqCst) {
            return;
        }

        let aec = inner.aec_enabled.load(Ordering::SeqCst);
        let ns = inner.ns_enabled.load(Ordering::SeqCst);
        let agc = inner.agc_enabled.load(Ordering::SeqCst);

        let receiver = inner.receiver.lock().clone();
        let Some(receiver) = receiver else { return };

        if !aec && !ns && !agc {
            return receiver.send_packet(Packet::Rtp(packet), addr);
        }

        let mut samples: Vec<f32> = packet
            .payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32)
            .collect();

        {
            let mut mic = inner.microphone.lock();
            for chunk in samples.chunks_exact_mut(FULLBAND_FRAME) {
                let mut frame = [0f32; FULLBAND_FRAME];
                frame.copy_from_slice(chunk);

                let mut bands = [[0f32; BAND_FRAME]; NUM_BANDS];
                mic.bank.analysis(&frame, &mut bands);

                if ns {
                    for band in 0..NUM_BANDS {
                        mic.ns.process_band(band, &mut bands[band]);
                    }
                }
                if aec {
                    inner.canceller.lock().process(&mut bands[0]);
                }
                if agc {
                    for band in bands.iter_mut() {
                        mic.agc.process(band);
                    }
                }

                mic.bank.synthesis(&bands, &mut frame);
                chunk.copy_from_slice(&frame);
            }
        }

        let mut payload = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            payload.extend_from_slice(
                &(sample.clamp(-32_768.0, 32_767.0) as i16).to_le_bytes(),
            );
        }
        receiver.send_packet(Packet::Rtp(RtpPacket::new(packet.header, Bytes::from(payload))), addr);
    }
}

struct SpeakerSink(Arc<Inner>);

impl PacketSink for SpeakerSink {
    fn send_packet(&self, packet: Packet, _addr: Option<&Address>) {
        let Packet::Rtp(packet) = packet else { return };
        let inner = &self.0;
        if !inner.runned.load(Ordering::SeqCst) || !inner.aec_enabled.load(Ordering::SeqCst) {
            return;
        }

        let samples: Vec<f32> = packet
            .payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32)
            .collect();

        let mut speaker = inner.speaker.lock();
        let mut canceller = inner.canceller.lock();
        for chunk in samples.chunks_exact(FULLBAND_FRAME) {
            let mut frame = [0f32; FULLBAND_FRAME];
            frame.copy_from_slice(chunk);

            let mut bands = [[0f32; BAND_FRAME]; NUM_BANDS];
            speaker.bank.analysis(&frame, &mut bands);
            canceller.buffer_farend(&bands[0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confero_transport_core::socket::FnSink;
    use confero_transport_core::RtpHeader;

    fn pcm_frame(samples: usize, amplitude: i16) -> RtpPacket {
        let payload: Vec<u8> = (0..samples)
            .flat_map(|i| {
                let value = (amplitude as f32
                    * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin())
                    as i16;
                value.to_le_bytes()
            })
            .collect();
        RtpPacket::new(RtpHeader::default(), Bytes::from(payload))
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
    fn disabled_chain_is_a_passthrough() {
        let processor = VoiceProcessor::new();
        processor.enable_aec(false);
        processor.enable_ns(false);
        processor.enable_agc(false);
        processor.start();

        let (sink, output) = capture();
        processor.set_receiver(Some(sink));

        let frame = pcm_frame(1920, 8000);
        processor.microphone_sink().send_packet(Packet::Rtp(frame.clone()), None);

        assert_eq!(output.lock().pop().unwrap().payload, frame.payload);
    }

    #[test]
    fn processed_frame_keeps_its_length() {
        let processor = VoiceProcessor::new();
        processor.start();

        let (sink, output) = capture();
        processor.set_receiver(Some(sink));

        processor.microphone_sink().send_packet(Packet::Rtp(pcm_frame(1920, 8000)), None);

        let out = output.lock().pop().unwrap();
        assert_eq!(out.payload.len(), 1920 * 2);
    }

    #[test]
    fn stopped_chain_swallows_frames() {
        let processor = VoiceProcessor::new();
        let (sink, output) = capture();
        processor.set_receiver(Some(sink));
        processor.microphone_sink().send_packet(Packet::Rtp(pcm_frame(1920, 100)), None);
        assert!(output.lock().is_empty());
    }

    #[test]
    fn speaker_sink_only_feeds_the_reference() {
        let processor = VoiceProcessor::new();
        processor.start();
        let (sink, output) = capture();
        processor.set_receiver(Some(sink));

        processor.speaker_sink().send_packet(Packet::Rtp(pcm_frame(1920, 5000)), None);
        // The far-end path produces no output frames.
        assert!(output.lock().is_empty());
    }
}
