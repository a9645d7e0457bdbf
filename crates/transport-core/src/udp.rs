//! UDP media socket.
//!
//! One socket per media stream. A dedicated thread blocks in `recv_from` and
//! dispatches parsed packets into the installed receiver pair; sends are
//! synchronous and lock-free per call. Failures are logged and swallowed:
//! the media plane never dies because one datagram did not make it.

use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info, trace, warn};

use crate::address::Address;
use crate::error::Result;
use crate::packet::rtcp::{RTCP_APP, RTCP_RR, RTCP_SR};
use crate::packet::RtpPacket;
use crate::packet::rtcp::RtcpPacket;
use crate::socket::{Packet, PacketSink, ReceiverPair, SharedSink};
use crate::MAX_DATAGRAM_SIZE;

const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

#[cfg(unix)]
const IPTOS_LOWDELAY: u32 = 0x10;

struct Inner {
    socket: Mutex<Option<Arc<std::net::UdpSocket>>>,
    receivers: ReceiverPair,
    default_addr: Mutex<Option<Address>>,
    bound_port: Mutex<u16>,
    runned: AtomicBool,
}

/// A UDP media socket with a dedicated receive thread.
pub struct UdpSocket {
    inner: Arc<Inner>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

impl UdpSocket {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                socket: Mutex::new(None),
                receivers: ReceiverPair::new(),
                default_addr: Mutex::new(None),
                bound_port: Mutex::new(0),
                runned: AtomicBool::new(false),
            }),
            recv_thread: Mutex::new(None),
        }
    }

    /// Install the (rtp, rtcp) receiver pair.
    pub fn set_receivers(&self, rtp: Option<SharedSink>, rtcp: Option<SharedSink>) {
        self.inner.receivers.install(rtp, rtcp);
    }

    /// Default destination used when a send carries no explicit address.
    pub fn set_default_address(&self, addr: Address) {
        *self.inner.default_addr.lock() = Some(addr);
    }

    /// Bind and start receiving. `bind_port` 0 picks an ephemeral port; the
    /// bound port is readable afterwards for signalling.
    pub fn start(&self, ipv6: bool, bind_port: u16) -> Result<()> {
        if self.inner.runned.load(Ordering::SeqCst) {
            return Ok(());
        }

        let socket = if ipv6 {
            let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
            // Dual-stack: a single socket receives both address families.
            socket.set_only_v6(false)?;
            socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, bind_port)).into())?;
            socket
        } else {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, bind_port)).into())?;
            socket
        };

        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
        #[cfg(unix)]
        if let Err(e) = socket.set_tos(IPTOS_LOWDELAY) {
            warn!("UdpSocket :: IP_TOS low-delay not set: {e}");
        }

        let socket: Arc<std::net::UdpSocket> = Arc::new(socket.into());
        let bound_port = socket.local_addr()?.port();
        *self.inner.bound_port.lock() = bound_port;
        *self.inner.socket.lock() = Some(socket.clone());

        self.inner.runned.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("udp-recv-{bound_port}"))
            .spawn(move || inner.receive_loop(socket))?;
        *self.recv_thread.lock() = Some(handle);

        info!("UdpSocket started, port: {bound_port}");
        Ok(())
    }

    /// Stop receiving and close the socket. The shutdown unblocks the
    /// receive thread, which is then joined.
    pub fn stop(&self) {
        if !self.inner.runned.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(socket) = self.inner.socket.lock().take() {
            let _ = socket2::SockRef::from(socket.as_ref()).shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.recv_thread.lock().take() {
            let _ = handle.join();
        }
        info!("UdpSocket ended, port: {}", self.bound_port());
    }

    pub fn is_started(&self) -> bool {
        self.inner.runned.load(Ordering::SeqCst)
    }

    pub fn bound_port(&self) -> u16 {
        *self.inner.bound_port.lock()
    }
}

impl Default for UdpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PacketSink for UdpSocket {
    fn send_packet(&self, packet: Packet, addr: Option<&Address>) {
        if !self.inner.runned.load(Ordering::SeqCst) {
            return;
        }
        let dest = match addr.copied().or_else(|| *self.inner.default_addr.lock()) {
            Some(dest) => dest,
            None => return,
        };
        let socket = match self.inner.socket.lock().clone() {
            Some(socket) => socket,
            None => return,
        };

        let wire = packet.serialize();
        match socket.send_to(&wire, SocketAddr::from(dest)) {
            Ok(sent) => {
                trace!("UdpSocket sent, size: {sent}, to: {dest}, socket port: {}", self.bound_port())
            }
            Err(e) => error!(
                "UdpSocket send error: {e}, receiver: {dest}, socket port: {}",
                self.bound_port()
            ),
        }
    }
}

impl Inner {
    fn receive_loop(&self, socket: Arc<std::net::UdpSocket>) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        while self.runned.load(Ordering::SeqCst) {
            let (size, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) => {
                    if self.runned.load(Ordering::SeqCst) {
                        error!("UdpSocket recv_from error: {e}");
                        continue;
                    }
                    break;
                }
            };

            let from = Address::from(from);
            trace!("UdpSocket receive, size: {size}, from: {from}");
            dispatch(&self.receivers, &buf[..size], &from);
        }
    }
}

/// Parse a datagram and hand it to the matching receiver. RTCP is recognized
/// by its packet-type octet; everything else is tried as RTP.
fn dispatch(receivers: &ReceiverPair, data: &[u8], from: &Address) {
    if data.len() >= 2 && matches!(data[1], RTCP_SR | RTCP_RR | RTCP_APP) {
        match RtcpPacket::parse(data) {
            Ok(packet) => receivers.dispatch_rtcp(packet, from),
            Err(e) => trace!("UdpSocket dropped malformed rtcp from {from}: {e}"),
        }
    } else {
        match RtpPacket::parse(data) {
            Ok(packet) => receivers.dispatch_rtp(packet, from),
            Err(e) => trace!("UdpSocket dropped malformed rtp from {from}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{RtpHeader, RtpPayloadType};
    use crate::socket::FnSink;
    use std::sync::mpsc;
    use std::time::Duration;

    fn opus_packet(seq: u16) -> RtpPacket {
        let header = RtpHeader {
            payload_type: RtpPayloadType::Opus as u8,
            seq,
            ssrc: 99,
            ..RtpHeader::default()
        };
        RtpPacket::new(header, bytes::Bytes::from_static(b"payload"))
    }

    #[test]
    fn loopback_send_and_receive() {
        let receiver = UdpSocket::new();
        receiver.start(false, 0).unwrap();

        let (tx, rx) = mpsc::channel();
        receiver.set_receivers(
            Some(Arc::new(FnSink(move |packet, _| {
                if let Packet::Rtp(p) = packet {
                    let _ = tx.send(p);
                }
            }))),
            None,
        );

        let sender = UdpSocket::new();
        sender.start(false, 0).unwrap();
        let dest = Address::resolve("127.0.0.1", receiver.bound_port()).unwrap();
        sender.send_packet(Packet::Rtp(opus_packet(5)), Some(&dest));

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, opus_packet(5));

        sender.stop();
        receiver.stop();
    }

    #[test]
    fn stop_unblocks_receive_thread() {
        let socket = UdpSocket::new();
        socket.start(false, 0).unwrap();
        assert!(socket.is_started());
        socket.stop();
        assert!(!socket.is_started());
    }

    #[test]
    fn rtcp_dispatches_to_rtcp_receiver() {
        let receiver = UdpSocket::new();
        receiver.start(false, 0).unwrap();

        let (tx, rx) = mpsc::channel();
        receiver.set_receivers(
            None,
            Some(Arc::new(FnSink(move |packet, _| {
                if let Packet::Rtcp(p) = packet {
                    let _ = tx.send(p);
                }
            }))),
        );

        let sender = UdpSocket::new();
        sender.start(false, 0).unwrap();
        let dest = Address::resolve("127.0.0.1", receiver.bound_port()).unwrap();
        let probe = RtcpPacket::app(crate::packet::rtcp::AppMessageType::UdpTest, 7, [0; 8]);
        sender.send_packet(Packet::Rtcp(probe), Some(&dest));

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, probe);

        sender.stop();
        receiver.stop();
    }
}
