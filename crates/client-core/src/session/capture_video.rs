//! Camera / screen capture session.
//!
//! Raw I420 frames from the platform capturer enter through [`frame_sink`],
//! are VP8-encoded, teed to the local preview renderer, fragmented by the
//! splitter, encrypted and sent. The RTCP back-channel carries
//! force-keyframe requests, complexity feedback, frame-rate changes and
//! remote-control input for demonstrations.
//!
//! [`frame_sink`]: CaptureVideoSession::frame_sink

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, trace};

use confero_media_core::codec::VideoEncoder;
use confero_media_core::{Encryptor, Resolution, VideoSplitter};
use confero_proto_core::DeviceType;
use confero_transport_core::socket::{FnSink, Packet, PacketSink, SharedSink};
use confero_transport_core::wsm::WsmSocket;
use confero_transport_core::{
    Address, AppMessageType, RemoteControlAction, RtcpBody, UdpSocket,
};

use crate::events::{DeviceNotify, DeviceNotifyCallback, DeviceNotifyKind};
use crate::tee::Tee;

/// Remote-control payload consumer (a screen capturer injecting input).
pub type RemoteControlCallback = Arc<dyn Fn([u8; 8]) + Send + Sync>;

struct Params {
    device_id: u32,
    ssrc: u32,
    name: String,
    device_type: DeviceType,
    resolution: Resolution,
    frame_rate: u32,
    rc_actions_enabled: bool,
    wsm: Option<(String, String, String)>,
    notify: Option<DeviceNotifyCallback>,
    remote_control: Option<RemoteControlCallback>,
}

/// One local camera or demonstration stream toward the conference.
pub struct CaptureVideoSession {
    encoder: Arc<VideoEncoder>,
    local_tee: Arc<Tee>,
    splitter: Arc<VideoSplitter>,
    encryptor: Arc<Encryptor>,
    rtp_socket: Arc<UdpSocket>,
    wsm_socket: Arc<WsmSocket>,
    params: Mutex<Params>,
    runned: AtomicBool,
    paused: AtomicBool,
}

impl CaptureVideoSession {
    pub fn new(device_type: DeviceType) -> Arc<Self> {
        let session = Arc::new(Self {
            encoder: Arc::new(VideoEncoder::new()),
            local_tee: Arc::new(Tee::new()),
            splitter: Arc::new(VideoSplitter::new()),
            encryptor: Arc::new(Encryptor::new()),
            rtp_socket: Arc::new(UdpSocket::new()),
            wsm_socket: Arc::new(WsmSocket::new()),
            params: Mutex::new(Params {
                device_id: 0,
                ssrc: 0,
                name: String::new(),
                device_type,
                resolution: Resolution::VGA,
                frame_rate: 25,
                rc_actions_enabled: false,
                wsm: None,
                notify: None,
                remote_control: None,
            }),
            runned: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        });

        session.encoder.set_receiver(Some(session.local_tee.clone()));
        session.local_tee.set_receiver0(Some(session.splitter.clone()));
        session.splitter.set_receiver(Some(session.encryptor.clone()));
        session.encryptor.set_receiver(Some(session.rtp_socket.clone()));

        let control = session.clone();
        let rtcp_sink: SharedSink = Arc::new(FnSink(move |packet, _| {
            if let Packet::Rtcp(rtcp) = packet {
                control.on_rtcp(rtcp.body, rtcp.app_word());
            }
        }));
        session.rtp_socket.set_receivers(None, Some(rtcp_sink.clone()));
        session.wsm_socket.set_receivers(None, Some(rtcp_sink));

        session
    }

    /// Entry for raw I420 frames from the capturer.
    pub fn frame_sink(self: &Arc<Self>) -> SharedSink {
        let session = self.clone();
        Arc::new(FnSink(move |packet, addr| {
            if session.runned.load(Ordering::SeqCst) && !session.paused.load(Ordering::SeqCst) {
                if let Packet::Rtp(mut rtp) = packet {
                    rtp.header.ssrc = session.params.lock().ssrc;
                    session.encoder.send_packet(Packet::Rtp(rtp), addr);
                }
            }
        }))
    }

    /// Local preview tap carrying the encoded stream before fragmentation.
    pub fn set_local_receiver(&self, receiver: Option<SharedSink>) {
        self.local_tee.set_receiver1(receiver);
    }

    pub fn set_device_notify_callback(&self, callback: Option<DeviceNotifyCallback>) {
        self.params.lock().notify = callback;
    }

    pub fn set_remote_control_callback(&self, callback: Option<RemoteControlCallback>) {
        self.params.lock().remote_control = callback;
    }

    pub fn set_name(&self, name: &str) {
        self.params.lock().name = name.to_string();
    }

    pub fn name(&self) -> String {
        self.params.lock().name.clone()
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
        self.encoder.set_resolution(resolution);
    }

    pub fn resolution(&self) -> Resolution {
        self.params.lock().resolution
    }

    pub fn set_bitrate(&self, kbps: u32) {
        self.encoder.set_bitrate(kbps);
    }

    pub fn bitrate(&self) -> u32 {
        self.encoder.bitrate()
    }

    pub fn set_frame_rate(&self, rate: u32) {
        self.params.lock().frame_rate = rate;
    }

    pub fn frame_rate(&self) -> u32 {
        self.params.lock().frame_rate
    }

    pub fn set_rc_actions(&self, yes: bool) {
        self.params.lock().rc_actions_enabled = yes;
    }

    pub fn rc_actions_enabled(&self) -> bool {
        self.params.lock().rc_actions_enabled
    }

    pub fn force_key_frame(&self) {
        self.encoder.force_key_frame();
    }

    pub fn device_type(&self) -> DeviceType {
        self.params.lock().device_type
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

        let (wsm, device_type) = {
            let mut params = self.params.lock();
            params.ssrc = ssrc;
            params.device_id = device_id;
            (params.wsm.clone(), params.device_type)
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

        self.splitter.reset();

        if !secure_key.is_empty() {
            self.encryptor.start(secure_key);
        }

        if device_type == DeviceType::Demonstration {
            self.encoder.set_screen_content(true);
        }
        if self.encoder.start().is_err() {
            info!("Cannot start camera encoder, device id: {device_id}, ssrc: {ssrc}");
            self.notify_failure();
            return;
        }

        trace!("Started camera session, device id: {device_id}, ssrc: {ssrc}");
    }

    pub fn is_started(&self) -> bool {
        self.runned.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
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
            "Stopped camera session, device id: {}, ssrc: {}",
            params.device_id,
            params.ssrc
        );
    }

    fn on_rtcp(&self, body: RtcpBody, word: Option<u32>) {
        let RtcpBody::App { message_type, payload, .. } = body else { return };
        match message_type {
            AppMessageType::ForceKeyFrame => {
                trace!(
                    "Camera[{}] :: received force key frame (last_recv_seq: {})",
                    self.name(),
                    word.unwrap_or(0)
                );
                self.encoder.force_key_frame();
            }
            AppMessageType::ReduceComplexity => {
                trace!("Camera[{}] :: received reduce complexity", self.name());
                let params = self.params.lock();
                if let Some(notify) = params.notify.clone() {
                    notify(DeviceNotify {
                        kind: DeviceNotifyKind::OvertimeCoding,
                        device_type: params.device_type,
                        device_id: params.device_id,
                        name: params.name.clone(),
                    });
                }
            }
            AppMessageType::Stat => {
                // VP8 has no live loss knob; the error-resilient encoder
                // config absorbs it, so the figure is only surfaced.
                trace!(
                    "Camera[{}] :: receiver packet loss: {}%",
                    self.name(),
                    word.unwrap_or(0)
                );
            }
            AppMessageType::SetFrameRate => {
                if let Some(rate) = word {
                    trace!("Camera[{}] :: received set frame rate {rate}", self.name());
                    self.set_frame_rate(rate);
                }
            }
            AppMessageType::RemoteControl => {
                let (enabled, callback) = {
                    let params = self.params.lock();
                    (params.rc_actions_enabled, params.remote_control.clone())
                };
                if enabled {
                    let action = RemoteControlAction::from_u16(u16::from_be_bytes([
                        payload[0], payload[1],
                    ]));
                    if action.is_some() {
                        if let Some(callback) = callback {
                            callback(payload);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn notify_failure(&self) {
        self.runned.store(false, Ordering::SeqCst);
        let params = self.params.lock();
        if let Some(notify) = params.notify.clone() {
            notify(DeviceNotify {
                kind: DeviceNotifyKind::MemoryError,
                device_type: params.device_type,
                device_id: params.device_id,
                name: params.name.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confero_transport_core::RtcpPacket;

    #[test]
    fn remote_control_requires_enable() {
        let session = CaptureVideoSession::new(DeviceType::Demonstration);
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = received.clone();
        session.set_remote_control_callback(Some(Arc::new(move |payload| {
            sink.lock().push(payload);
        })));

        let mut payload = [0u8; 8];
        payload[..2].copy_from_slice(&(RemoteControlAction::Move as u16).to_be_bytes());
        let packet = RtcpPacket::app(AppMessageType::RemoteControl, 5, payload);

        session.on_rtcp(packet.body, packet.app_word());
        assert!(received.lock().is_empty());

        session.set_rc_actions(true);
        session.on_rtcp(packet.body, packet.app_word());
        assert_eq!(received.lock().len(), 1);
    }

    #[test]
    fn set_frame_rate_app_updates_the_session() {
        let session = CaptureVideoSession::new(DeviceType::Camera);
        let packet = RtcpPacket::app_with_word(AppMessageType::SetFrameRate, 5, 15);
        session.on_rtcp(packet.body, packet.app_word());
        assert_eq!(session.frame_rate(), 15);
    }
}
