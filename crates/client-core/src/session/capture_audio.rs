//! Microphone capture session.
//!
//! PCM from the voice processing chain enters through [`pcm_sink`], is
//! Opus-encoded, encrypted and sent to the peer over UDP or the WSM
//! fallback. RTCP stats from the peer drive the encoder's packet-loss
//! feedback.
//!
//! [`pcm_sink`]: CaptureAudioSession::pcm_sink

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, trace};

use confero_media_core::codec::AudioEncoder;
use confero_media_core::Encryptor;
use confero_proto_core::DeviceType;
use confero_transport_core::socket::{FnSink, Packet, PacketSink, SharedSink};
use confero_transport_core::wsm::WsmSocket;
use confero_transport_core::{Address, AppMessageType, RtcpBody, UdpSocket};

use crate::events::{DeviceNotify, DeviceNotifyCallback, DeviceNotifyKind};

struct Params {
    device_id: u32,
    ssrc: u32,
    name: String,
    sample_freq: u32,
    gain: i32,
    wsm: Option<(String, String, String)>,
    notify: Option<DeviceNotifyCallback>,
}

/// One local microphone stream toward the conference.
pub struct CaptureAudioSession {
    encoder: Arc<AudioEncoder>,
    encryptor: Arc<Encryptor>,
    rtp_socket: Arc<UdpSocket>,
    wsm_socket: Arc<WsmSocket>,
    params: Mutex<Params>,
    runned: AtomicBool,
    mute: AtomicBool,
}

impl CaptureAudioSession {
    pub fn new() -> Arc<Self> {
        let session = Arc::new(Self {
            encoder: Arc::new(AudioEncoder::new()),
            encryptor: Arc::new(Encryptor::new()),
            rtp_socket: Arc::new(UdpSocket::new()),
            wsm_socket: Arc::new(WsmSocket::new()),
            params: Mutex::new(Params {
                device_id: 0,
                ssrc: 0,
                name: String::new(),
                sample_freq: 48_000,
                gain: 80,
                wsm: None,
                notify: None,
            }),
            runned: AtomicBool::new(false),
            mute: AtomicBool::new(false),
        });

        session.encoder.set_receiver(Some(session.encryptor.clone()));
        session.encryptor.set_receiver(Some(session.rtp_socket.clone()));

        // Packet-loss stats come back over RTCP on the media socket.
        let encoder = session.encoder.clone();
        let stats_sink: SharedSink = Arc::new(FnSink(move |packet, _| {
            if let Packet::Rtcp(rtcp) = packet {
                if let RtcpBody::App { message_type: AppMessageType::Stat, .. } = rtcp.body {
                    if let Some(loss) = rtcp.app_word() {
                        trace!("CaptureAudioSession :: packet loss feedback: {loss}%");
                        encoder.set_packet_loss(loss as i32);
                    }
                }
            }
        }));
        session.rtp_socket.set_receivers(None, Some(stats_sink.clone()));
        session.wsm_socket.set_receivers(None, Some(stats_sink));

        session
    }

    /// Entry for processed PCM frames; honors the mute flag.
    pub fn pcm_sink(self: &Arc<Self>) -> SharedSink {
        let session = self.clone();
        Arc::new(FnSink(move |packet, addr| {
            if session.runned.load(Ordering::SeqCst) && !session.mute.load(Ordering::SeqCst) {
                if let Packet::Rtp(mut rtp) = packet {
                    rtp.header.ssrc = session.params.lock().ssrc;
                    session.encoder.send_packet(Packet::Rtp(rtp), addr);
                }
            }
        }))
    }

    pub fn set_device_notify_callback(&self, callback: Option<DeviceNotifyCallback>) {
        self.params.lock().notify = callback;
    }

    pub fn set_name(&self, name: &str) {
        self.params.lock().name = name.to_string();
    }

    pub fn set_rtp_params(&self, addr: Address) {
        self.params.lock().wsm = None;
        self.rtp_socket.set_default_address(addr);
    }

    pub fn set_wsm_params(&self, addr: &str, access_token: &str, dest_addr: &str) {
        self.params.lock().wsm =
            Some((addr.to_string(), access_token.to_string(), dest_addr.to_string()));
    }

    pub fn set_sample_freq(&self, freq: u32) {
        self.params.lock().sample_freq = freq;
        self.encoder.set_sample_freq(freq);
    }

    pub fn sample_freq(&self) -> u32 {
        self.params.lock().sample_freq
    }

    pub fn set_bitrate(&self, kbps: i32) {
        self.encoder.set_bitrate(kbps);
    }

    pub fn bitrate(&self) -> i32 {
        self.encoder.bitrate()
    }

    pub fn set_quality(&self, quality: i32) {
        self.encoder.set_quality(quality);
    }

    pub fn set_gain(&self, gain: i32) {
        self.params.lock().gain = gain.clamp(0, 100);
    }

    pub fn gain(&self) -> i32 {
        self.params.lock().gain
    }

    pub fn set_mute(&self, yes: bool) {
        self.mute.store(yes, Ordering::SeqCst);
    }

    pub fn mute(&self) -> bool {
        self.mute.load(Ordering::SeqCst)
    }

    pub fn device_id(&self) -> u32 {
        self.params.lock().device_id
    }

    pub fn ssrc(&self) -> u32 {
        self.params.lock().ssrc
    }

    pub fn start(&self, ssrc: u32, device_id: u32, secure_key: &str) {
        if self.runned.swap(true, Ordering::SeqCst) {
            return;
        }

        let wsm = {
            let mut params = self.params.lock();
            params.ssrc = ssrc;
            params.device_id = device_id;
            params.wsm.clone()
        };

        match &wsm {
            None => {
                self.encryptor.set_receiver(Some(self.rtp_socket.clone()));
                if self.rtp_socket.start(false, 0).is_err() {
                    self.notify_failure();
                    return;
                }
            }
            Some((addr, token, dest)) => {
                self.encryptor.set_receiver(Some(self.wsm_socket.clone()));
                self.wsm_socket.start(addr, token, dest);
            }
        }

        if !secure_key.is_empty() {
            self.encryptor.start(secure_key);
        }

        if self.encoder.start().is_err() {
            info!("Cannot start microphone encoder, device id: {device_id}, ssrc: {ssrc}");
            self.notify_failure();
            return;
        }

        trace!("Started microphone session, device id: {device_id}, ssrc: {ssrc}");
    }

    pub fn is_started(&self) -> bool {
        self.runned.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if !self.runned.swap(false, Ordering::SeqCst) {
            return;
        }
        self.encoder.stop();
        self.encryptor.stop();
        self.rtp_socket.stop();
        self.wsm_socket.stop();

        let params = self.params.lock();
        trace!(
            "Stopped microphone session, device id: {}, ssrc: {}",
            params.device_id,
            params.ssrc
        );
    }

    fn notify_failure(&self) {
        self.runned.store(false, Ordering::SeqCst);
        let params = self.params.lock();
        if let Some(notify) = params.notify.clone() {
            notify(DeviceNotify {
                kind: DeviceNotifyKind::MemoryError,
                device_type: DeviceType::Microphone,
                device_id: params.device_id,
                name: params.name.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use confero_transport_core::{RtpHeader, RtpPacket};

    #[test]
    fn muted_session_swallows_pcm() {
        let session = CaptureAudioSession::new();
        session.start(10, 1, "");
        session.set_mute(true);

        let sink = session.pcm_sink();
        let pcm: Vec<u8> = std::iter::repeat([0u8, 1]).take(1920).flatten().collect();
        sink.send_packet(
            Packet::Rtp(RtpPacket::new(RtpHeader::default(), Bytes::from(pcm))),
            None,
        );
        // Nothing to assert on the socket; the encoder stays idle because the
        // mute gate runs before it.
        assert!(session.mute());
        session.stop();
    }

    #[test]
    fn start_is_idempotent_and_stop_reverses() {
        let session = CaptureAudioSession::new();
        session.start(10, 1, "key");
        session.start(10, 1, "key");
        assert!(session.is_started());
        assert_eq!(session.ssrc(), 10);
        session.stop();
        assert!(!session.is_started());
    }
}
