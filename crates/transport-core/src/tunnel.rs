//! TCP tunnel transport.
//!
//! A single TCP connection multiplexes N UDP flows for networks where UDP is
//! blocked. Framing is length-prefixed: `u16 body_len | u16 dest_port |
//! u16 src_port` (all big-endian) followed by `body_len` opaque bytes, with
//! `body_len` bounded at [`MAX_TUNNEL_BODY`]. A frame that violates the bound
//! is malformed and closes the session.
//!
//! On the client a *pipe* maps a remote server port to a locally bound UDP
//! port: sessions keep talking plain UDP to `127.0.0.1:<local>` and the pipe
//! wraps datagrams into tunnel frames. `dest_port` carries the originating
//! session socket port (the flow id), `src_port` the server's service port.
//! The server unwraps to per-flow UDP sockets toward its local service and
//! mirrors the pair on the way back.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};

use crate::error::{Error, Result};

/// Largest tunnel frame body.
pub const MAX_TUNNEL_BODY: usize = 2048;

/// Tunnel frame header size on the wire.
pub const TUNNEL_HEADER_SIZE: usize = 6;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// One tunnel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelFrame {
    pub dest_port: u16,
    pub src_port: u16,
    pub body: Bytes,
}

impl TunnelFrame {
    pub fn new(dest_port: u16, src_port: u16, body: Bytes) -> Result<Self> {
        if body.len() > MAX_TUNNEL_BODY {
            return Err(Error::InvalidTunnelFrame("body exceeds 2048 bytes"));
        }
        Ok(Self { dest_port, src_port, body })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TUNNEL_HEADER_SIZE + self.body.len());
        buf.put_u16(self.body.len() as u16);
        buf.put_u16(self.dest_port);
        buf.put_u16(self.src_port);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decode the 6-byte header, returning `(body_len, dest_port, src_port)`.
    pub fn decode_header(header: &[u8]) -> Result<(usize, u16, u16)> {
        if header.len() < TUNNEL_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: TUNNEL_HEADER_SIZE,
                available: header.len(),
            });
        }
        let mut cursor = header;
        let body_len = cursor.get_u16() as usize;
        if body_len > MAX_TUNNEL_BODY {
            return Err(Error::InvalidTunnelFrame("declared body exceeds 2048 bytes"));
        }
        Ok((body_len, cursor.get_u16(), cursor.get_u16()))
    }
}

async fn read_frame(stream: &mut (impl AsyncReadExt + Unpin)) -> Result<TunnelFrame> {
    let mut header = [0u8; TUNNEL_HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let (body_len, dest_port, src_port) = TunnelFrame::decode_header(&header)?;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await?;
    Ok(TunnelFrame { dest_port, src_port, body: Bytes::from(body) })
}

/// One client pipe: a local UDP socket standing in for a remote server port.
struct Pipe {
    local_port: u16,
    socket: Arc<std::net::UdpSocket>,
}

/// Tunnel client. Reconnects on disconnect; frames queued while the
/// connection is down are written once it is up again.
pub struct TunnelClient {
    server: Mutex<Option<(String, u16)>>,
    pipes: Arc<Mutex<HashMap<u16, Pipe>>>,
    frame_tx: Mutex<Option<mpsc::UnboundedSender<TunnelFrame>>>,
    conn_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    runned: Arc<AtomicBool>,
}

impl TunnelClient {
    pub fn new() -> Self {
        Self {
            server: Mutex::new(None),
            pipes: Arc::new(Mutex::new(HashMap::new())),
            frame_tx: Mutex::new(None),
            conn_task: Mutex::new(None),
            runned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_server_address(&self, host: &str, port: u16) {
        *self.server.lock() = Some((host.to_string(), port));
        trace!("TunnelClient server address {host}:{port}");
    }

    /// Map `server_port` to a locally bound UDP port, starting the tunnel
    /// connection on first use. Returns the local pipe port.
    pub fn create_pipe(&self, server_port: u16) -> Result<u16> {
        if let Some(pipe) = self.pipes.lock().get(&server_port) {
            info!("TunnelClient reusing pipe UDP[{}] -> TCP[{server_port}]", pipe.local_port);
            return Ok(pipe.local_port);
        }

        self.ensure_connected()?;
        let frame_tx = self
            .frame_tx
            .lock()
            .clone()
            .ok_or(Error::NotStarted)?;

        let socket = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        let local_port = socket.local_addr()?.port();
        let socket = Arc::new(socket);

        let runned = self.runned.clone();
        let reader = socket.clone();
        std::thread::Builder::new()
            .name(format!("tunnel-pipe-{server_port}"))
            .spawn(move || {
                let mut buf = [0u8; MAX_TUNNEL_BODY];
                while runned.load(Ordering::SeqCst) {
                    let (size, from) = match reader.recv_from(&mut buf) {
                        Ok(received) => received,
                        Err(_) => break,
                    };
                    let frame = TunnelFrame {
                        dest_port: from.port(),
                        src_port: server_port,
                        body: Bytes::copy_from_slice(&buf[..size]),
                    };
                    if frame_tx.send(frame).is_err() {
                        break;
                    }
                }
            })?;

        self.pipes.lock().insert(server_port, Pipe { local_port, socket });
        info!("TunnelClient created pipe UDP[{local_port}] -> TCP[{server_port}]");
        Ok(local_port)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.runned.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (host, port) = self
            .server
            .lock()
            .clone()
            .ok_or(Error::NotStarted)?;

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        *self.frame_tx.lock() = Some(frame_tx);
        self.runned.store(true, Ordering::SeqCst);

        let pipes = self.pipes.clone();
        let runned = self.runned.clone();
        let task = tokio::spawn(connection_loop(host, port, frame_rx, pipes, runned));
        *self.conn_task.lock() = Some(task);
        Ok(())
    }

    /// Tear the tunnel down: close the connection and every pipe socket.
    pub fn end_session(&self) {
        if !self.runned.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.conn_task.lock().take() {
            task.abort();
        }
        *self.frame_tx.lock() = None;
        for (_, pipe) in self.pipes.lock().drain() {
            let _ = socket2::SockRef::from(pipe.socket.as_ref()).shutdown(Shutdown::Both);
        }
        info!("TunnelClient closed");
    }
}

impl Default for TunnelClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.end_session();
    }
}

async fn connection_loop(
    host: String,
    port: u16,
    mut frame_rx: mpsc::UnboundedReceiver<TunnelFrame>,
    pipes: Arc<Mutex<HashMap<u16, Pipe>>>,
    runned: Arc<AtomicBool>,
) {
    while runned.load(Ordering::SeqCst) {
        info!("TunnelClient connecting to {host}:{port}");
        let stream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("TunnelClient connect error: {e}, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        info!("TunnelClient connected");

        let (mut reader, mut writer) = stream.into_split();
        let (dead_tx, mut dead_rx) = tokio::sync::oneshot::channel::<()>();
        let reader_pipes = pipes.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => route_to_pipe(&reader_pipes, frame),
                    Err(e) => {
                        error!("TunnelClient read error: {e}, reconnecting");
                        break;
                    }
                }
            }
            let _ = dead_tx.send(());
        });

        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        reader_task.abort();
                        return;
                    };
                    if let Err(e) = writer.write_all(&frame.encode()).await {
                        error!("TunnelClient write error: {e}, reconnecting");
                        break;
                    }
                }
                _ = &mut dead_rx => break,
            }
        }
        reader_task.abort();
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Rewrite an inbound tunnel frame into a UDP datagram toward the session
/// socket that originated the flow.
fn route_to_pipe(pipes: &Mutex<HashMap<u16, Pipe>>, frame: TunnelFrame) {
    let Some(socket) = pipes.lock().get(&frame.src_port).map(|p| p.socket.clone()) else {
        trace!("TunnelClient frame for unknown pipe, src port: {}", frame.src_port);
        return;
    };
    let dest = SocketAddr::from((Ipv4Addr::LOCALHOST, frame.dest_port));
    if let Err(e) = socket.send_to(&frame.body, dest) {
        error!("TunnelClient pipe forward error: {e}, dest port: {}", frame.dest_port);
    }
}

/// Tunnel server: accepts connections and bridges frames to local UDP
/// services.
pub struct TunnelServer {
    port: u16,
    listener_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    runned: Arc<AtomicBool>,
}

impl TunnelServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            listener_task: Mutex::new(None),
            runned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if self.runned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        info!("TunnelServer listening on port {}", self.port);

        let runned = self.runned.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!("TunnelServer accepted session from {peer}");
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(serve_session(stream, runned.clone()));
                    }
                    Err(e) => {
                        error!("TunnelServer accept error: {e}");
                        break;
                    }
                }
            }
        });
        *self.listener_task.lock() = Some(task);
        Ok(())
    }

    pub fn stop(&self) {
        if !self.runned.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.listener_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_session(stream: TcpStream, runned: Arc<AtomicBool>) {
    let (mut reader, mut writer) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<TunnelFrame>();

    // Per-flow UDP sockets keyed by the client's flow id (dest_port).
    let mut flows: HashMap<u16, Arc<std::net::UdpSocket>> = HashMap::new();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if writer.write_all(&frame.encode()).await.is_err() {
                break;
            }
        }
    });

    while runned.load(Ordering::SeqCst) {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("TunnelServer session closed: {e}");
                break;
            }
        };

        let socket = match flows.get(&frame.dest_port) {
            Some(socket) => socket.clone(),
            None => match open_flow(frame.dest_port, frame_tx.clone(), runned.clone()) {
                Ok(socket) => {
                    flows.insert(frame.dest_port, socket.clone());
                    socket
                }
                Err(e) => {
                    error!("TunnelServer cannot open flow socket: {e}");
                    continue;
                }
            },
        };

        let dest = SocketAddr::from((Ipv4Addr::LOCALHOST, frame.src_port));
        if let Err(e) = socket.send_to(&frame.body, dest) {
            error!("TunnelServer forward error: {e}, service port: {}", frame.src_port);
        }
    }

    writer_task.abort();
    for (_, socket) in flows {
        let _ = socket2::SockRef::from(socket.as_ref()).shutdown(Shutdown::Both);
    }
}

/// Bind the per-flow UDP socket and pump service replies back into tunnel
/// frames carrying the mirrored port pair.
fn open_flow(
    flow_port: u16,
    frame_tx: mpsc::UnboundedSender<TunnelFrame>,
    runned: Arc<AtomicBool>,
) -> Result<Arc<std::net::UdpSocket>> {
    let socket = Arc::new(std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?);
    let reader = socket.clone();
    std::thread::Builder::new()
        .name(format!("tunnel-flow-{flow_port}"))
        .spawn(move || {
            let mut buf = [0u8; MAX_TUNNEL_BODY];
            while runned.load(Ordering::SeqCst) {
                let (size, from) = match reader.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(_) => break,
                };
                let frame = TunnelFrame {
                    dest_port: flow_port,
                    src_port: from.port(),
                    body: Bytes::copy_from_slice(&buf[..size]),
                };
                if frame_tx.send(frame).is_err() {
                    break;
                }
            }
        })?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_encode_decode() {
        let frame = TunnelFrame::new(5004, 443, Bytes::from_static(b"rtp-bytes")).unwrap();
        let wire = frame.encode();
        let (body_len, dest, src) = TunnelFrame::decode_header(&wire[..TUNNEL_HEADER_SIZE]).unwrap();
        assert_eq!(body_len, 9);
        assert_eq!(dest, 5004);
        assert_eq!(src, 443);
        assert_eq!(&wire[TUNNEL_HEADER_SIZE..], b"rtp-bytes");
    }

    #[test]
    fn oversized_body_is_rejected() {
        let body = Bytes::from(vec![0u8; MAX_TUNNEL_BODY + 1]);
        assert!(TunnelFrame::new(1, 2, body).is_err());

        let mut header = [0u8; TUNNEL_HEADER_SIZE];
        header[0] = 0x08; // 2049 big-endian
        header[1] = 0x01;
        assert!(TunnelFrame::decode_header(&header).is_err());
    }

    #[tokio::test]
    async fn tunnel_round_trip_through_server() {
        // Service socket plays the server-side media endpoint.
        let service = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        service.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let service_port = service.local_addr().unwrap().port();

        let server = TunnelServer::new(0);
        // Bind on an ephemeral port by hand so the test can learn it.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let server_port = listener.local_addr().unwrap().port();
        let runned = server.runned.clone();
        runned.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_session(stream, runned).await;
        });

        let client = TunnelClient::new();
        client.set_server_address("127.0.0.1", server_port);
        let local_port = client.create_pipe(service_port).unwrap();

        // A "session socket" sends a datagram into the pipe...
        let session = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        session.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        session
            .send_to(b"ping", (Ipv4Addr::LOCALHOST, local_port))
            .unwrap();

        // ...the service receives it through the tunnel...
        let mut buf = [0u8; 64];
        let (size, from) = service.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"ping");

        // ...and the reply comes back to the session socket.
        service.send_to(b"pong", from).unwrap();
        let (size, _) = session.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"pong");

        client.end_session();
        server.stop();
    }
}
