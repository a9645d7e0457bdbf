//! WebSocket media (WSM) socket.
//!
//! Fallback transport that tunnels RTP/RTCP inside the signalling WebSocket
//! as JSON `media` commands with base64 packet bytes. Plain `ws://` is used
//! on purpose: the media payload is already encrypted by the session layer.
//!
//! The socket logs on with `connect_request{type: WSMedia, access_token}`.
//! Packets sent before the logon completes queue in an offline buffer that is
//! drained on success.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, trace, warn};

use confero_proto_core as proto;
use proto::command::{
    ConnectRequest, ConnectResponse, ConnectResult, ConnectType, Disconnect, Media, Ping,
    MEDIA_TYPE_RTCP, MEDIA_TYPE_RTP,
};
use proto::{command_type, CommandType};

use crate::address::Address;
use crate::packet::rtcp::RtcpPacket;
use crate::packet::RtpPacket;
use crate::socket::{Packet, PacketSink, ReceiverPair, SharedSink};

/// Packets bigger than this never fit a sane signalling frame and are
/// rejected at the send boundary.
const MAX_WSM_PACKET: usize = 60 * 1024;

struct Inner {
    receivers: ReceiverPair,
    connected: AtomicBool,
    logged_in: AtomicBool,
    dest_addr: Mutex<String>,
    offline_queue: Mutex<VecDeque<String>>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

/// WebSocket media socket.
pub struct WsmSocket {
    inner: Arc<Inner>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsmSocket {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                receivers: ReceiverPair::new(),
                connected: AtomicBool::new(false),
                logged_in: AtomicBool::new(false),
                dest_addr: Mutex::new(String::new()),
                offline_queue: Mutex::new(VecDeque::new()),
                writer: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn set_receivers(&self, rtp: Option<SharedSink>, rtcp: Option<SharedSink>) {
        self.inner.receivers.install(rtp, rtcp);
    }

    /// Connect to the media WebSocket endpoint and log on.
    pub fn start(&self, address: &str, access_token: &str, dest_addr: &str) {
        *self.inner.dest_addr.lock() = dest_addr.to_string();

        if self.inner.connected.load(Ordering::SeqCst) {
            return;
        }

        let url = format!("ws://{address}");
        let token = access_token.to_string();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            inner.run(url, token).await;
        });
        *self.task.lock() = Some(task);

        trace!("WsmSocket :: connecting, server address {address}");
    }

    pub fn stop(&self) {
        if let Some(tx) = self.inner.writer.lock().take() {
            let _ = tx.send(proto::serialize(&Disconnect {}));
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.logged_in.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl Default for WsmSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WsmSocket {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PacketSink for WsmSocket {
    fn send_packet(&self, packet: Packet, _addr: Option<&Address>) {
        let (media_type, ssrc, wire) = match &packet {
            Packet::Rtp(p) => (MEDIA_TYPE_RTP, p.header.ssrc, p.serialize()),
            Packet::Rtcp(p) => {
                let ssrc = match p.body {
                    crate::packet::rtcp::RtcpBody::App { ssrc, .. } => ssrc,
                    _ => {
                        warn!("WsmSocket :: unsupported outbound rtcp");
                        return;
                    }
                };
                (MEDIA_TYPE_RTCP, ssrc, p.serialize())
            }
        };

        if wire.len() > MAX_WSM_PACKET {
            warn!("WsmSocket :: rejected oversized packet, size: {}", wire.len());
            return;
        }

        let command = proto::serialize(&Media {
            media_type,
            ssrc,
            addr: self.inner.dest_addr.lock().clone(),
            data: base64::engine::general_purpose::STANDARD.encode(&wire),
        });

        if self.inner.logged_in.load(Ordering::SeqCst) {
            if let Some(tx) = self.inner.writer.lock().as_ref() {
                let _ = tx.send(command);
                return;
            }
        }
        self.inner.offline_queue.lock().push_back(command);
    }
}

impl Inner {
    async fn run(self: Arc<Self>, url: String, access_token: String) {
        let (stream, _) = match connect_async(&url).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("WsmSocket :: connect error: {e}");
                return;
            }
        };
        info!("WsmSocket :: connection to server established");
        self.connected.store(true, Ordering::SeqCst);

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.writer.lock() = Some(tx.clone());

        let writer_task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        // Logon before any media flows.
        let logon = proto::serialize(&ConnectRequest {
            connect_type: ConnectType::WSMedia,
            access_token,
            ..ConnectRequest::default()
        });
        let _ = tx.send(logon);

        while let Some(message) = ws_rx.next().await {
            let text = match message {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(_)) => {
                    info!("WsmSocket :: websocket closed");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    error!("WsmSocket :: websocket error: {e}");
                    break;
                }
            };
            self.on_message(&text, &tx);
        }

        writer_task.abort();
        self.connected.store(false, Ordering::SeqCst);
        self.logged_in.store(false, Ordering::SeqCst);
    }

    fn on_message(&self, text: &str, tx: &mpsc::UnboundedSender<String>) {
        match command_type(text) {
            CommandType::ConnectResponse => {
                let Ok(response) = proto::parse::<ConnectResponse>(text) else {
                    return;
                };
                if response.result == ConnectResult::Ok {
                    trace!("WsmSocket :: logon success, connection id: {}", response.connection_id);
                    self.logged_in.store(true, Ordering::SeqCst);
                    let mut queue = self.offline_queue.lock();
                    while let Some(command) = queue.pop_front() {
                        let _ = tx.send(command);
                    }
                } else {
                    error!("WsmSocket :: media session logon refused: {:?}", response.result);
                }
            }
            CommandType::Media => {
                let Ok(media) = proto::parse::<Media>(text) else {
                    return;
                };
                self.on_media(media);
            }
            CommandType::Ping => {
                let _ = tx.send(proto::serialize(&Ping {}));
            }
            _ => {}
        }
    }

    fn on_media(&self, media: Media) {
        let Ok(data) = base64::engine::general_purpose::STANDARD.decode(&media.data) else {
            warn!("WsmSocket :: dropped media frame with bad base64");
            return;
        };
        // The server does not tell us the true origin; attribute to the
        // configured destination.
        let from = match Address::parse(&self.dest_addr.lock()) {
            Ok(addr) => addr,
            Err(_) => return,
        };
        match media.media_type {
            MEDIA_TYPE_RTP => {
                if let Ok(packet) = RtpPacket::parse(&data) {
                    trace!("WsmSocket :: wsm -> rtp, size: {}, ssrc: {}", data.len(), media.ssrc);
                    self.receivers.dispatch_rtp(packet, &from);
                }
            }
            MEDIA_TYPE_RTCP => {
                if let Ok(packet) = RtcpPacket::parse(&data) {
                    trace!("WsmSocket :: wsm -> rtcp, size: {}, ssrc: {}", data.len(), media.ssrc);
                    self.receivers.dispatch_rtcp(packet, &from);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::rtcp::AppMessageType;
    use crate::packet::{RtpHeader, RtpPayloadType};

    fn opus_packet(size: usize) -> Packet {
        let header = RtpHeader {
            payload_type: RtpPayloadType::Opus as u8,
            ssrc: 4,
            ..RtpHeader::default()
        };
        Packet::Rtp(RtpPacket::new(header, bytes::Bytes::from(vec![0u8; size])))
    }

    #[tokio::test]
    async fn packets_before_logon_are_queued() {
        let socket = WsmSocket::new();
        socket.send_packet(opus_packet(100), None);
        socket.send_packet(
            Packet::Rtcp(RtcpPacket::app(AppMessageType::ForceKeyFrame, 4, [0; 8])),
            None,
        );
        assert_eq!(socket.inner.offline_queue.lock().len(), 2);
    }

    #[tokio::test]
    async fn oversized_packets_are_rejected_at_send_boundary() {
        let socket = WsmSocket::new();
        socket.send_packet(opus_packet(MAX_WSM_PACKET + 1), None);
        assert!(socket.inner.offline_queue.lock().is_empty());
    }

    #[test]
    fn inbound_media_dispatches_parsed_rtp() {
        let inner = Arc::new(Inner {
            receivers: ReceiverPair::new(),
            connected: AtomicBool::new(true),
            logged_in: AtomicBool::new(true),
            dest_addr: Mutex::new("127.0.0.1:9000".to_string()),
            offline_queue: Mutex::new(VecDeque::new()),
            writer: Mutex::new(None),
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_received = received.clone();
        inner.receivers.install(
            Some(Arc::new(crate::socket::FnSink(move |packet, _| {
                sink_received.lock().push(packet);
            }))),
            None,
        );

        let rtp = RtpPacket::new(
            RtpHeader { ssrc: 11, ..RtpHeader::default() },
            bytes::Bytes::from_static(b"abc"),
        );
        inner.on_media(Media {
            media_type: MEDIA_TYPE_RTP,
            ssrc: 11,
            addr: String::new(),
            data: base64::engine::general_purpose::STANDARD.encode(rtp.serialize()),
        });

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], Packet::Rtp(rtp));
    }
}
