//! Remote audio renderer session.
//!
//! Receives the peer's Opus stream, decrypts, tees to the recorder, decodes
//! and buffers decoded PCM in the jitter buffer. The shared mixer pulls the
//! buffer as one of its inputs, addressed by the author SSRC. A pinger keeps
//! the NAT path open while the session runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{info, trace};

use confero_media_core::codec::AudioDecoder;
use confero_media_core::{AudioMixer, Decryptor, JitterBuffer, JitterMode, TimeMeter};
use confero_proto_core::DeviceType;
use confero_transport_core::socket::{Packet, PacketSink, SharedSink};
use confero_transport_core::wsm::WsmSocket;
use confero_transport_core::{Address, RtpHeader, RtpPacket, UdpSocket};

use super::{PING_TICKS, PING_TICK_MS};
use crate::events::{DeviceNotify, DeviceNotifyCallback, DeviceNotifyKind};
use crate::tee::Tee;

struct Params {
    device_id: u32,
    receiver_ssrc: u32,
    author_ssrc: u32,
    client_id: i64,
    name: String,
    volume: i32,
    my: bool,
    secure_key: String,
    wsm: Option<(String, String, String)>,
    notify: Option<DeviceNotifyCallback>,
}

/// One remote microphone rendered into the shared mixer.
pub struct RendererAudioSession {
    mixer: Arc<AudioMixer>,
    decryptor: Arc<Decryptor>,
    record_tee: Arc<Tee>,
    decoder: Arc<AudioDecoder>,
    jitter: Arc<JitterBuffer>,
    rtp_socket: Arc<UdpSocket>,
    wsm_socket: Arc<WsmSocket>,
    params: Mutex<Params>,
    mute: AtomicBool,
    runned: Arc<AtomicBool>,
    pinger: Mutex<Option<JoinHandle<()>>>,
}

impl RendererAudioSession {
    pub fn new(time_meter: TimeMeter, mixer: Arc<AudioMixer>) -> Arc<Self> {
        let session = Arc::new(Self {
            mixer,
            decryptor: Arc::new(Decryptor::new()),
            record_tee: Arc::new(Tee::new()),
            decoder: Arc::new(AudioDecoder::new()),
            jitter: Arc::new(JitterBuffer::new(time_meter)),
            rtp_socket: Arc::new(UdpSocket::new()),
            wsm_socket: Arc::new(WsmSocket::new()),
            params: Mutex::new(Params {
                device_id: 0,
                receiver_ssrc: 0,
                author_ssrc: 0,
                client_id: 0,
                name: String::new(),
                volume: 100,
                my: false,
                secure_key: String::new(),
                wsm: None,
                notify: None,
            }),
            mute: AtomicBool::new(false),
            runned: Arc::new(AtomicBool::new(false)),
            pinger: Mutex::new(None),
        });

        session.rtp_socket.set_receivers(Some(session.decryptor.clone()), None);
        session.wsm_socket.set_receivers(Some(session.decryptor.clone()), None);
        session.decryptor.set_receiver(Some(session.record_tee.clone()));
        session.record_tee.set_receiver0(Some(session.decoder.clone()));
        session.decoder.set_receiver(Some(session.jitter.clone()));

        session
    }

    /// Direct entry bypassing the socket, used by "my" local loopback.
    pub fn direct_receiver(&self) -> SharedSink {
        self.record_tee.clone()
    }

    /// Recorder tap carrying the decrypted Opus stream.
    pub fn set_recorder(&self, recorder: Option<SharedSink>) {
        self.record_tee.set_receiver1(recorder);
    }

    pub fn set_device_notify_callback(&self, callback: Option<DeviceNotifyCallback>) {
        self.params.lock().notify = callback;
    }

    pub fn set_name(&self, name: &str) {
        self.params.lock().name = name.to_string();
    }

    pub fn set_client_id(&self, client_id: i64) {
        self.params.lock().client_id = client_id;
    }

    pub fn client_id(&self) -> i64 {
        self.params.lock().client_id
    }

    pub fn set_my(&self, my: bool) {
        self.params.lock().my = my;
    }

    pub fn my(&self) -> bool {
        self.params.lock().my
    }

    pub fn set_rtp_params(&self, addr: Address) {
        self.params.lock().wsm = None;
        self.rtp_socket.set_default_address(addr);
    }

    pub fn set_wsm_params(&self, addr: &str, access_token: &str, dest_addr: &str) {
        self.params.lock().wsm =
            Some((addr.to_string(), access_token.to_string(), dest_addr.to_string()));
    }

    pub fn set_volume(&self, volume: i32) {
        let author_ssrc = {
            let mut params = self.params.lock();
            params.volume = volume;
            params.author_ssrc
        };
        self.mixer.set_input_volume(author_ssrc, volume);
    }

    pub fn volume(&self) -> i32 {
        self.params.lock().volume
    }

    /// Muting swaps the decoder leg out of the tee, so the recorder still
    /// hears the stream but the mixer does not.
    pub fn set_mute(&self, yes: bool) {
        self.mute.store(yes, Ordering::SeqCst);
        self.record_tee
            .set_receiver0(if yes { None } else { Some(self.decoder.clone()) });
    }

    pub fn mute(&self) -> bool {
        self.mute.load(Ordering::SeqCst)
    }

    pub fn device_id(&self) -> u32 {
        self.params.lock().device_id
    }

    pub fn receiver_ssrc(&self) -> u32 {
        self.params.lock().receiver_ssrc
    }

    pub fn author_ssrc(&self) -> u32 {
        self.params.lock().author_ssrc
    }

    pub fn secure_key(&self) -> String {
        self.params.lock().secure_key.clone()
    }

    pub fn start(
        self: &Arc<Self>,
        receiver_ssrc: u32,
        author_ssrc: u32,
        device_id: u32,
        secure_key: &str,
    ) {
        if self.runned.swap(true, Ordering::SeqCst) {
            return;
        }

        let (my, wsm, client_id, name) = {
            let mut params = self.params.lock();
            params.receiver_ssrc = receiver_ssrc;
            params.author_ssrc = author_ssrc;
            params.device_id = device_id;
            params.secure_key = secure_key.to_string();
            (params.my, params.wsm.clone(), params.client_id, params.name.clone())
        };

        if !secure_key.is_empty() {
            self.decryptor.start(secure_key);
        }

        if self.decoder.start().is_err() {
            info!(
                "Cannot start audio renderer decoder, client id: {client_id}, device id: {device_id}"
            );
            self.notify_failure();
            return;
        }

        if !my {
            match &wsm {
                None => {
                    if self.rtp_socket.start(false, 0).is_err() {
                        self.notify_failure();
                        return;
                    }
                }
                Some((addr, token, dest)) => self.wsm_socket.start(addr, token, dest),
            }

            self.jitter.start(JitterMode::Sound, &name);

            self.spawn_pinger();

            let jitter = self.jitter.clone();
            self.mixer.add_input(
                author_ssrc,
                client_id,
                Arc::new(move || jitter.get_frame().map(|packet| packet.payload)),
                self.params.lock().volume,
            );
        }

        info!(
            "Started audio renderer session, client id: {client_id}, device id: {device_id}, receiver ssrc: {receiver_ssrc}, author ssrc: {author_ssrc}"
        );
    }

    pub fn is_started(&self) -> bool {
        self.runned.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if !self.runned.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(pinger) = self.pinger.lock().take() {
            let _ = pinger.join();
        }
        self.rtp_socket.stop();
        self.wsm_socket.stop();
        self.jitter.stop();
        self.decoder.stop();
        self.decryptor.stop();
        self.mixer.delete_input(self.author_ssrc());

        let params = self.params.lock();
        info!(
            "Stopped audio renderer session, client id: {}, device id: {}, receiver ssrc: {}, author ssrc: {}",
            params.client_id, params.device_id, params.receiver_ssrc, params.author_ssrc
        );
    }

    pub fn pause(&self) {
        if self.my() {
            self.decoder.stop();
        } else {
            self.rtp_socket.stop();
        }
    }

    pub fn resume(&self) {
        if self.my() {
            let _ = self.decoder.start();
        } else {
            let _ = self.rtp_socket.start(false, 0);
        }
    }

    /// Periodically send an empty packet carrying the receiver SSRC so the
    /// server and NAT learn this socket's address.
    fn spawn_pinger(self: &Arc<Self>) {
        let runned = self.runned.clone();
        let rtp_socket = self.rtp_socket.clone();
        let wsm_socket = self.wsm_socket.clone();
        let receiver_ssrc = self.receiver_ssrc();
        let use_wsm = self.params.lock().wsm.is_some();

        let handle = std::thread::Builder::new()
            .name("audio-renderer-ping".to_string())
            .spawn(move || {
                let mut ping_count = PING_TICKS;
                while runned.load(Ordering::SeqCst) {
                    if ping_count >= PING_TICKS {
                        let header = RtpHeader { ssrc: receiver_ssrc, ..RtpHeader::default() };
                        let packet = Packet::Rtp(RtpPacket::new(header, Bytes::new()));
                        trace!("RendererAudioSession :: ping, receiver ssrc: {receiver_ssrc}");
                        if use_wsm {
                            wsm_socket.send_packet(packet, None);
                        } else {
                            rtp_socket.send_packet(packet, None);
                        }
                        ping_count = 0;
                    }
                    ping_count += 1;
                    std::thread::sleep(std::time::Duration::from_millis(PING_TICK_MS));
                }
            });
        *self.pinger.lock() = handle.ok();
    }

    fn notify_failure(&self) {
        self.runned.store(false, Ordering::SeqCst);
        let params = self.params.lock();
        if let Some(notify) = params.notify.clone() {
            notify(DeviceNotify {
                kind: DeviceNotifyKind::MemoryError,
                device_type: DeviceType::AudioRenderer,
                device_id: params.device_id,
                name: params.name.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn my_session_skips_network_and_mixer() {
        let mixer = Arc::new(AudioMixer::new());
        let session = RendererAudioSession::new(TimeMeter::new(), mixer.clone());
        session.set_my(true);
        session.start(100, 200, 1, "");
        assert!(session.is_started());
        assert_eq!(mixer.input_count(), 0);
        session.stop();
    }

    #[test]
    fn network_session_registers_a_mixer_input() {
        let mixer = Arc::new(AudioMixer::new());
        let session = RendererAudioSession::new(TimeMeter::new(), mixer.clone());
        session.set_client_id(42);
        session.start(100, 200, 1, "key");
        assert_eq!(mixer.input_count(), 1);
        session.stop();
        assert_eq!(mixer.input_count(), 0);
    }

    #[test]
    fn mute_swaps_the_decoder_leg() {
        let mixer = Arc::new(AudioMixer::new());
        let session = RendererAudioSession::new(TimeMeter::new(), mixer);
        session.set_mute(true);
        assert!(session.mute());
        session.set_mute(false);
        assert!(!session.mute());
    }
}
