//! Signalling WebSocket channel.
//!
//! One connection to the server front end carrying JSON commands both ways.
//! The channel reconnects on drops; commands sent while offline buffer in a
//! queue that drains once the connection is back. Messages are surfaced raw
//! to the controller, which dispatches on the sniffed command name.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, trace};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Raised toward the controller next to the raw message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingNotice {
    Connected,
    Message(String),
    Disconnected,
}

struct Inner {
    url: Mutex<String>,
    connected: AtomicBool,
    runned: AtomicBool,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    offline_queue: Mutex<VecDeque<String>>,
    notices: Mutex<Option<mpsc::UnboundedSender<SignalingNotice>>>,
    close_signal: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

/// The signalling connection.
pub struct SignalingChannel {
    inner: Arc<Inner>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SignalingChannel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                url: Mutex::new(String::new()),
                connected: AtomicBool::new(false),
                runned: AtomicBool::new(false),
                writer: Mutex::new(None),
                offline_queue: Mutex::new(VecDeque::new()),
                notices: Mutex::new(None),
                close_signal: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the connection loop toward `url`, delivering notices on the
    /// returned stream. A previous loop is stopped first.
    pub fn connect(&self, url: &str) -> mpsc::UnboundedReceiver<SignalingNotice> {
        self.stop();

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        *self.inner.url.lock() = url.to_string();
        *self.inner.notices.lock() = Some(notice_tx);
        self.inner.runned.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        *self.task.lock() = Some(tokio::spawn(async move { inner.run().await }));
        notice_rx
    }

    /// Redirect to a new endpoint, keeping the notice stream. The current
    /// connection is closed and the loop reconnects against the new URL.
    pub fn change_server(&self, url: &str) {
        *self.inner.url.lock() = url.to_string();
        if let Some(close) = self.inner.close_signal.lock().take() {
            let _ = close.send(());
        }
    }

    /// Queue one serialized command. Buffered while offline.
    pub fn send(&self, command: String) {
        if self.inner.connected.load(Ordering::SeqCst) {
            if let Some(writer) = self.inner.writer.lock().as_ref() {
                let _ = writer.send(command);
                return;
            }
        }
        self.inner.offline_queue.lock().push_back(command);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.inner.runned.store(false, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        *self.inner.writer.lock() = None;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Default for SignalingChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn notify(&self, notice: SignalingNotice) {
        if let Some(notices) = self.notices.lock().as_ref() {
            let _ = notices.send(notice);
        }
    }

    async fn run(self: Arc<Self>) {
        while self.runned.load(Ordering::SeqCst) {
            let url = self.url.lock().clone();
            info!("Signaling :: connecting to {url}");

            let stream = match connect_async(&url).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("Signaling :: connect error: {e}");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            info!("Signaling :: connected");
            let (mut ws_tx, mut ws_rx) = stream.split();

            let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
            *self.writer.lock() = Some(writer_tx.clone());
            self.connected.store(true, Ordering::SeqCst);
            self.notify(SignalingNotice::Connected);

            // Drain everything queued while offline.
            {
                let mut queue = self.offline_queue.lock();
                while let Some(command) = queue.pop_front() {
                    let _ = writer_tx.send(command);
                }
            }

            let writer_task = tokio::spawn(async move {
                while let Some(text) = writer_rx.recv().await {
                    if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            let (close_tx, mut close_rx) = tokio::sync::oneshot::channel::<()>();
            *self.close_signal.lock() = Some(close_tx);

            loop {
                let message = tokio::select! {
                    message = ws_rx.next() => message,
                    _ = &mut close_rx => {
                        info!("Signaling :: connection closed for server change");
                        break;
                    }
                };
                match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        trace!("Signaling :: <- {} bytes", text.len());
                        self.notify(SignalingNotice::Message(text));
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Signaling :: closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Signaling :: websocket error: {e}");
                        break;
                    }
                }
            }
            *self.close_signal.lock() = None;

            writer_task.abort();
            self.connected.store(false, Ordering::SeqCst);
            *self.writer.lock() = None;
            self.notify(SignalingNotice::Disconnected);

            if self.runned.load(Ordering::SeqCst) {
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_commands_are_queued() {
        let channel = SignalingChannel::new();
        channel.send("{\"ping\":{}}".to_string());
        assert_eq!(channel.inner.offline_queue.lock().len(), 1);
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn connects_to_mock_server_and_exchanges_messages() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Mock server: accept one connection, echo one message back.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                ws.send(WsMessage::Text(text)).await.unwrap();
            }
        });

        let channel = SignalingChannel::new();
        let mut notices = channel.connect(&format!("ws://127.0.0.1:{port}"));

        assert_eq!(notices.recv().await, Some(SignalingNotice::Connected));
        channel.send("{\"ping\":{}}".to_string());
        assert_eq!(
            notices.recv().await,
            Some(SignalingNotice::Message("{\"ping\":{}}".to_string()))
        );

        channel.stop();
    }
}
