//! Codec wrappers.
//!
//! Thin pipeline stages around libopus and libvpx. Encoders and decoders are
//! [`PacketSink`]s like every other stage: PCM or raw frames go in as RTP
//! payloads, encoded packets (or decoded frames) come out on the configured
//! receiver.
//!
//! [`PacketSink`]: confero_transport_core::socket::PacketSink

pub mod opus;
pub mod vp8;

pub use self::opus::{AudioDecoder, AudioEncoder};
pub use self::vp8::{is_key_frame, KeyFrameRequest, VideoDecoder, VideoEncoder};
