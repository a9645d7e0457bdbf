//! Media sessions.
//!
//! A session owns one directed media stream and its whole pipeline. Capture
//! sessions run capturer → encoder → (splitter) → encryptor → socket; the
//! RTCP back-channel from the same socket feeds control (force-keyframe,
//! stats, remote control) into the session. Renderer sessions run socket →
//! decryptor → (collector) → decoder/jitter toward the mixer or a frame
//! sink, and keep the NAT path open with a periodic empty packet.

pub mod capture_audio;
pub mod capture_video;
pub mod renderer_audio;
pub mod renderer_video;

pub use capture_audio::CaptureAudioSession;
pub use capture_video::CaptureVideoSession;
pub use renderer_audio::RendererAudioSession;
pub use renderer_video::RendererVideoSession;

/// Interval between NAT keep-open pings, in 50 ms ticks.
pub(crate) const PING_TICKS: u32 = 80;

/// Tick length of the pinger threads.
pub(crate) const PING_TICK_MS: u64 = 50;
