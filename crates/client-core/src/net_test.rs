//! Network reachability and speed probes.
//!
//! Three probes run on demand before or during a call: a UDP probe that
//! sends an RTCP APP `udp_test` to every candidate media endpoint and waits
//! for the echo, a TCP probe that just connects, and a speed probe that
//! times a known blob download over the signalling WebSocket.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, trace};

use confero_proto_core as proto;
use proto::command::{
    ConnectRequest, ConnectResponse, ConnectResult, ConnectType, DeliveryBlobs, LoadBlobs, Ping,
};
use proto::{command_type, CommandType};
use confero_transport_core::socket::{FnSink, Packet, PacketSink};
use confero_transport_core::{Address, AppMessageType, RtcpBody, RtcpPacket, UdpSocket};

use crate::error::Result;

/// The well-known blob the server serves for speed probing.
pub const SPEED_TEST_BLOB: &str = "00000000-0000-0000-0000-000000000001";

/// Tick length of the UDP probe.
const UDP_TEST_TICK: Duration = Duration::from_millis(250);

/// UDP reachability probe.
pub struct UdpTester {
    addresses: Mutex<Vec<Address>>,
    available: Arc<Mutex<Vec<Address>>>,
    runned: Arc<AtomicBool>,
}

impl UdpTester {
    pub fn new() -> Self {
        Self {
            addresses: Mutex::new(Vec::new()),
            available: Arc::new(Mutex::new(Vec::new())),
            runned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn add_address(&self, address: Address) {
        trace!("UdpTester :: add address {address}");
        let mut addresses = self.addresses.lock();
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }

    pub fn clear_addresses(&self) {
        self.addresses.lock().clear();
        self.available.lock().clear();
    }

    /// Probe every candidate. Each gets its own socket and one `udp_test`
    /// APP; an address passes iff a datagram comes back from exactly that
    /// address. The wait is bounded at two ticks per candidate.
    pub fn run(&self) -> Vec<Address> {
        let addresses = self.addresses.lock().clone();
        if addresses.is_empty() {
            return Vec::new();
        }

        self.available.lock().clear();
        self.runned.store(true, Ordering::SeqCst);
        info!("UdpTester :: started, {} candidates", addresses.len());

        let mut sockets = Vec::new();
        for address in &addresses {
            let socket = UdpSocket::new();
            if socket.start(address.is_ipv6(), 0).is_err() {
                continue;
            }

            let expected = *address;
            let available = self.available.clone();
            socket.set_receivers(
                None,
                Some(Arc::new(FnSink(move |packet, from| {
                    if let (Packet::Rtcp(_), Some(from)) = (packet, from) {
                        if *from == expected {
                            trace!("UdpTester :: echo from {from}");
                            available.lock().push(expected);
                        }
                    }
                }))),
            );

            let probe = RtcpPacket::app(AppMessageType::UdpTest, 0, [0; 8]);
            socket.send_packet(Packet::Rtcp(probe), Some(address));
            sockets.push(socket);
        }

        // Double time to wait for the responses.
        for _ in 0..addresses.len() * 2 {
            if !self.runned.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(UDP_TEST_TICK);
        }

        for socket in sockets {
            socket.stop();
        }
        self.runned.store(false, Ordering::SeqCst);

        let available = self.available.lock().clone();
        info!("UdpTester :: finished, {} available", available.len());
        available
    }

    pub fn stop(&self) {
        self.runned.store(false, Ordering::SeqCst);
    }

    pub fn test_passed(&self) -> bool {
        !self.available.lock().is_empty()
    }
}

impl Default for UdpTester {
    fn default() -> Self {
        Self::new()
    }
}

/// TCP reachability probe: a candidate passes iff the connect completes
/// within the timeout.
pub struct TcpTester;

impl TcpTester {
    pub fn probe(address: Address, timeout: Duration) -> bool {
        match TcpStream::connect_timeout(&address.into(), timeout) {
            Ok(_) => {
                trace!("TcpTester :: {address} reachable");
                true
            }
            Err(e) => {
                trace!("TcpTester :: {address} unreachable: {e}");
                false
            }
        }
    }
}

/// Per-iteration progress of the speed probe.
pub type SpeedProgressCallback = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// Download speed probe over the signalling WebSocket.
pub struct SpeedTester {
    url: String,
    login: String,
    password: String,
    iterations: u32,
    progress: Option<SpeedProgressCallback>,
    runned: Arc<AtomicBool>,
}

impl SpeedTester {
    pub fn new(url: &str, login: &str, password: &str) -> Self {
        Self {
            url: url.to_string(),
            login: login.to_string(),
            password: password.to_string(),
            iterations: 5,
            progress: None,
            runned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn with_progress(mut self, progress: SpeedProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn stop(&self) {
        self.runned.store(false, Ordering::SeqCst);
    }

    /// Log on, download the well-known blob `iterations` times and return
    /// the average inbound speed in kbit/s.
    pub async fn run(&self) -> Result<u32> {
        self.runned.store(true, Ordering::SeqCst);

        let (stream, _) = connect_async(&self.url)
            .await
            .map_err(|e| crate::error::ClientError::Signaling(e.to_string()))?;
        let (mut tx, mut rx) = stream.split();

        let logon = proto::serialize(&ConnectRequest {
            connect_type: ConnectType::Client,
            login: self.login.clone(),
            password: self.password.clone(),
            ..ConnectRequest::default()
        });
        tx.send(WsMessage::Text(logon))
            .await
            .map_err(|e| crate::error::ClientError::Signaling(e.to_string()))?;

        let mut speed_sum = 0u64;
        let mut measured = 0u32;
        let mut started_at: Option<Instant> = None;
        let mut iteration = 0u32;

        while let Some(message) = rx.next().await {
            if !self.runned.load(Ordering::SeqCst) {
                break;
            }
            let text = match message {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    error!("SpeedTester :: websocket error: {e}");
                    break;
                }
            };

            match command_type(&text) {
                CommandType::ConnectResponse => {
                    let response = proto::parse::<ConnectResponse>(&text)?;
                    if response.result != ConnectResult::Ok {
                        return Err(crate::error::ClientError::Signaling(
                            "speed test logon refused".to_string(),
                        ));
                    }
                    started_at = Some(Instant::now());
                    let request = proto::serialize(&LoadBlobs {
                        guids: vec![SPEED_TEST_BLOB.to_string()],
                    });
                    tx.send(WsMessage::Text(request))
                        .await
                        .map_err(|e| crate::error::ClientError::Signaling(e.to_string()))?;
                }
                CommandType::DeliveryBlobs => {
                    let blobs = proto::parse::<DeliveryBlobs>(&text)?;
                    if let Some(at) = started_at.take() {
                        let elapsed = at.elapsed().as_secs_f64().max(1e-3);
                        let bits = (blobs.data.len() * 8) as f64;
                        let kbps = (bits / elapsed / 1000.0) as u64;
                        speed_sum += kbps;
                        measured += 1;
                        iteration += 1;
                        if let Some(progress) = &self.progress {
                            progress(iteration, kbps as u32);
                        }
                    }
                    if iteration >= self.iterations {
                        break;
                    }
                    started_at = Some(Instant::now());
                    let request = proto::serialize(&LoadBlobs {
                        guids: vec![SPEED_TEST_BLOB.to_string()],
                    });
                    tx.send(WsMessage::Text(request))
                        .await
                        .map_err(|e| crate::error::ClientError::Signaling(e.to_string()))?;
                }
                CommandType::Ping => {
                    let _ = tx.send(WsMessage::Text(proto::serialize(&Ping {}))).await;
                }
                _ => {}
            }
        }

        self.runned.store(false, Ordering::SeqCst);
        if measured == 0 {
            return Ok(0);
        }
        Ok((speed_sum / measured as u64) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_probe_passes_only_echoed_addresses() {
        // An echo responder standing in for the media server.
        let responder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        responder.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let responder_port = responder.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let mut buf = [0u8; 128];
            if let Ok((size, from)) = responder.recv_from(&mut buf) {
                let _ = responder.send_to(&buf[..size], from);
            }
        });

        let tester = UdpTester::new();
        tester.add_address(Address::resolve("127.0.0.1", responder_port).unwrap());
        // A port nobody listens on never echoes.
        tester.add_address(Address::resolve("127.0.0.1", 1).unwrap());

        let available = tester.run();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].port(), responder_port);
        assert!(tester.test_passed());
    }

    #[test]
    fn tcp_probe_detects_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = Address::from(listener.local_addr().unwrap());
        assert!(TcpTester::probe(addr, Duration::from_secs(1)));

        drop(listener);
        let dead = Address::resolve("127.0.0.1", 1).unwrap();
        assert!(!TcpTester::probe(dead, Duration::from_millis(300)));
    }

    #[tokio::test]
    async fn speed_test_measures_blob_delivery() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Expect logon, answer OK, then serve blobs until close.
            while let Some(Ok(message)) = ws.next().await {
                let WsMessage::Text(text) = message else { continue };
                match command_type(&text) {
                    CommandType::ConnectRequest => {
                        let response = proto::serialize(&ConnectResponse {
                            result: ConnectResult::Ok,
                            ..ConnectResponse::default()
                        });
                        ws.send(WsMessage::Text(response)).await.unwrap();
                    }
                    CommandType::LoadBlobs => {
                        let blob = proto::serialize(&DeliveryBlobs {
                            guid: SPEED_TEST_BLOB.to_string(),
                            data: "x".repeat(100_000),
                        });
                        ws.send(WsMessage::Text(blob)).await.unwrap();
                    }
                    _ => {}
                }
            }
        });

        let tester =
            SpeedTester::new(&format!("ws://127.0.0.1:{port}"), "u", "p").with_iterations(2);
        let kbps = tester.run().await.unwrap();
        assert!(kbps > 0);
    }
}
