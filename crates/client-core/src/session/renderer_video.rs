//! Remote video renderer session.
//!
//! Receives the peer's fragmented VP8 stream, decrypts, reassembles frames
//! in the collector, tees whole frames to the recorder and buffers them in
//! the jitter buffer. A pull thread paced at the frame duration feeds the
//! decoder, whose output goes to the installed frame sink. The decoder's
//! force-keyframe requests travel back over RTCP APP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{info, trace};

use confero_media_core::codec::{KeyFrameRequest, VideoDecoder};
use confero_media_core::{
    ColorSpace, Decryptor, JitterBuffer, JitterMode, Resolution, TimeMeter, VideoCollector,
};
use confero_proto_core::DeviceType;
use confero_transport_core::socket::{Packet, PacketSink, SharedSink};
use confero_transport_core::wsm::WsmSocket;
use confero_transport_core::{
    Address, AppMessageType, RtcpPacket, RtpHeader, RtpPacket, UdpSocket,
};

use super::{PING_TICKS, PING_TICK_MS};
use crate::events::{DeviceNotify, DeviceNotifyCallback, DeviceNotifyKind};
use crate::tee::Tee;

/// Video pull cadence in milliseconds.
const VIDEO_FRAME_DURATION_MS: u64 = 40;

struct Params {
    device_id: u32,
    receiver_ssrc: u32,
    author_ssrc: u32,
    client_id: i64,
    name: String,
    resolution: Resolution,
    mirror: bool,
    speaking: bool,
    my: bool,
    secure_key: String,
    wsm: Option<(String, String, String)>,
    notify: Option<DeviceNotifyCallback>,
}

/// One remote camera or demonstration rendered to a frame sink.
pub struct RendererVideoSession {
    decryptor: Arc<Decryptor>,
    collector: Arc<VideoCollector>,
    record_tee: Arc<Tee>,
    jitter: Arc<JitterBuffer>,
    decoder: Arc<VideoDecoder>,
    rtp_socket: Arc<UdpSocket>,
    wsm_socket: Arc<WsmSocket>,
    params: Mutex<Params>,
    runned: Arc<AtomicBool>,
    pull_thread: Mutex<Option<JoinHandle<()>>>,
    pinger: Mutex<Option<JoinHandle<()>>>,
}

impl RendererVideoSession {
    pub fn new(time_meter: TimeMeter) -> Arc<Self> {
        let session = Arc::new(Self {
            decryptor: Arc::new(Decryptor::new()),
            collector: Arc::new(VideoCollector::new()),
            record_tee: Arc::new(Tee::new()),
            jitter: Arc::new(JitterBuffer::new(time_meter.clone())),
            decoder: Arc::new(VideoDecoder::new(time_meter)),
            rtp_socket: Arc::new(UdpSocket::new()),
            wsm_socket: Arc::new(WsmSocket::new()),
            params: Mutex::new(Params {
                device_id: 0,
                receiver_ssrc: 0,
                author_ssrc: 0,
                client_id: 0,
                name: String::new(),
                resolution: Resolution::VGA,
                mirror: false,
                speaking: false,
                my: false,
                secure_key: String::new(),
                wsm: None,
                notify: None,
            }),
            runned: Arc::new(AtomicBool::new(false)),
            pull_thread: Mutex::new(None),
            pinger: Mutex::new(None),
        });

        session.rtp_socket.set_receivers(Some(session.decryptor.clone()), None);
        session.wsm_socket.set_receivers(Some(session.decryptor.clone()), None);
        session.decryptor.set_receiver(Some(session.collector.clone()));
        session.collector.set_receiver(Some(session.record_tee.clone()));
        session.record_tee.set_receiver0(Some(session.jitter.clone()));

        // Decoder gap recovery goes back to the author over RTCP. Weak link
        // so the decoder does not keep the session alive.
        let back = Arc::downgrade(&session);
        let request: KeyFrameRequest = Arc::new(move |seq| {
            if let Some(session) = back.upgrade() {
                session.send_force_key_frame(seq);
            }
        });
        session.decoder.set_key_frame_request(Some(request));

        session
    }

    /// Decoded frames leave through this sink.
    pub fn set_frame_sink(&self, sink: Option<SharedSink>) {
        self.decoder.set_receiver(sink);
    }

    /// Direct entry bypassing the socket, used by "my" local loopback.
    pub fn direct_receiver(&self) -> SharedSink {
        self.collector.clone()
    }

    /// Recorder tap carrying reassembled VP8 frames.
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

    /// Horizontal flip for self-view rendering.
    pub fn set_mirror(&self, mirror: bool) {
        self.params.lock().mirror = mirror;
    }

    pub fn mirror(&self) -> bool {
        self.params.lock().mirror
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.params.lock().speaking = speaking;
    }

    pub fn is_speaking(&self) -> bool {
        self.params.lock().speaking
    }

    pub fn set_rtp_params(&self, addr: Address) {
        self.params.lock().wsm = None;
        self.rtp_socket.set_default_address(addr);
    }

    pub fn set_wsm_params(&self, addr: &str, access_token: &str, dest_addr: &str) {
        self.params.lock().wsm =
            Some((addr.to_string(), access_token.to_string(), dest_addr.to_string()));
    }

    pub fn set_resolution(&self, resolution: Resolution) {
        self.params.lock().resolution = resolution;
        self.decoder.set_resolution(resolution);
    }

    pub fn resolution(&self) -> Resolution {
        self.params.lock().resolution
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

        let (my, wsm, resolution, client_id, name) = {
            let mut params = self.params.lock();
            params.receiver_ssrc = receiver_ssrc;
            params.author_ssrc = author_ssrc;
            params.device_id = device_id;
            params.secure_key = secure_key.to_string();
            (
                params.my,
                params.wsm.clone(),
                params.resolution,
                params.client_id,
                params.name.clone(),
            )
        };

        if !secure_key.is_empty() {
            self.decryptor.start(secure_key);
        }
        self.collector.reset();

        self.decoder.set_resolution(resolution);
        if self.decoder.start(ColorSpace::I420).is_err() {
            info!(
                "Cannot start video renderer decoder, client id: {client_id}, device id: {device_id}"
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
            self.spawn_pinger();
        }

        self.jitter.start(JitterMode::Video, &name);
        self.spawn_pull_thread();

        info!(
            "Started video renderer session, client id: {client_id}, device id: {device_id}, receiver ssrc: {receiver_ssrc}, author ssrc: {author_ssrc}"
        );
    }

    pub fn is_started(&self) -> bool {
        self.runned.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if !self.runned.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(thread) = self.pull_thread.lock().take() {
            let _ = thread.join();
        }
        if let Some(pinger) = self.pinger.lock().take() {
            let _ = pinger.join();
        }
        self.rtp_socket.stop();
        self.wsm_socket.stop();
        self.jitter.stop();
        self.decoder.stop();
        self.decryptor.stop();

        let params = self.params.lock();
        info!(
            "Stopped video renderer session, client id: {}, device id: {}, receiver ssrc: {}, author ssrc: {}",
            params.client_id, params.device_id, params.receiver_ssrc, params.author_ssrc
        );
    }

    /// Pace the jitter buffer against a monotonic clock and feed complete
    /// frames to the decoder.
    fn spawn_pull_thread(self: &Arc<Self>) {
        let runned = self.runned.clone();
        let jitter = self.jitter.clone();
        let decoder = self.decoder.clone();

        let handle = std::thread::Builder::new()
            .name("video-renderer-pull".to_string())
            .spawn(move || {
                let mut next_tick = Instant::now();
                while runned.load(Ordering::SeqCst) {
                    next_tick += Duration::from_millis(VIDEO_FRAME_DURATION_MS);
                    if let Some(frame) = jitter.get_frame() {
                        decoder.send_packet(Packet::Rtp(frame), None);
                    }
                    let now = Instant::now();
                    if next_tick > now {
                        std::thread::sleep(next_tick - now);
                    } else {
                        next_tick = now;
                    }
                }
            });
        *self.pull_thread.lock() = handle.ok();
    }

    fn spawn_pinger(self: &Arc<Self>) {
        let runned = self.runned.clone();
        let rtp_socket = self.rtp_socket.clone();
        let wsm_socket = self.wsm_socket.clone();
        let receiver_ssrc = self.receiver_ssrc();
        let use_wsm = self.params.lock().wsm.is_some();

        let handle = std::thread::Builder::new()
            .name("video-renderer-ping".to_string())
            .spawn(move || {
                let mut ping_count = PING_TICKS;
                while runned.load(Ordering::SeqCst) {
                    if ping_count >= PING_TICKS {
                        let header = RtpHeader { ssrc: receiver_ssrc, ..RtpHeader::default() };
                        let packet = Packet::Rtp(RtpPacket::new(header, Bytes::new()));
                        trace!("RendererVideoSession :: ping, receiver ssrc: {receiver_ssrc}");
                        if use_wsm {
                            wsm_socket.send_packet(packet, None);
                        } else {
                            rtp_socket.send_packet(packet, None);
                        }
                        ping_count = 0;
                    }
                    ping_count += 1;
                    std::thread::sleep(Duration::from_millis(PING_TICK_MS));
                }
            });
        *self.pinger.lock() = handle.ok();
    }

    /// Ask the author for a keyframe, carrying the last received sequence.
    pub fn send_force_key_frame(&self, seq: u16) {
        let (receiver_ssrc, use_wsm) = {
            let params = self.params.lock();
            (params.receiver_ssrc, params.wsm.is_some())
        };
        let packet = Packet::Rtcp(RtcpPacket::app_with_word(
            AppMessageType::ForceKeyFrame,
            receiver_ssrc,
            seq as u32,
        ));
        if use_wsm {
            self.wsm_socket.send_packet(packet, None);
        } else {
            self.rtp_socket.send_packet(packet, None);
        }
    }

    fn notify_failure(&self) {
        self.runned.store(false, Ordering::SeqCst);
        let params = self.params.lock();
        if let Some(notify) = params.notify.clone() {
            notify(DeviceNotify {
                kind: DeviceNotifyKind::MemoryError,
                device_type: DeviceType::VideoRenderer,
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
    fn start_stop_lifecycle() {
        let session = RendererVideoSession::new(TimeMeter::new());
        session.set_resolution(Resolution::QVGA);
        session.start(100, 200, 1, "key");
        assert!(session.is_started());
        assert_eq!(session.receiver_ssrc(), 100);
        assert_eq!(session.author_ssrc(), 200);
        session.stop();
        assert!(!session.is_started());
    }

    #[test]
    fn speaking_flag_tracks_the_active_speaker() {
        let session = RendererVideoSession::new(TimeMeter::new());
        assert!(!session.is_speaking());
        session.set_speaking(true);
        assert!(session.is_speaking());
    }
}
