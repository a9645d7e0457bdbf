//! Client engine for the Confero conferencing system.
//!
//! The [`ClientController`] is the single entry point: it logs in over the
//! signalling WebSocket, joins and leaves conferences, owns one capture and
//! one renderer session per media stream and keeps the member registry in
//! sync with the server. Media flows through `confero-media-core` pipelines
//! over `confero-transport-core` sockets; the application supplies capture
//! frames and consumes events, mixed audio and decoded video.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod net_test;
pub mod recorder;
pub mod session;
pub mod signaling;
pub mod tee;

pub use config::ClientConfig;
pub use controller::{AudioOutputCallback, ClientController, ClientState, LocalDevice};
pub use error::{AuthFailReason, ClientError, Result};
pub use events::{ClientEvent, DeviceNotify, DeviceNotifyKind};
pub use net_test::{SpeedTester, TcpTester, UdpTester};
pub use recorder::Recorder;
pub use signaling::{SignalingChannel, SignalingNotice};
