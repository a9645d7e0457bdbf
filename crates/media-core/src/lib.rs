//! Media pipelines for the Confero conferencing client.
//!
//! Everything between a capture device and a transport socket lives here:
//! Opus and VP8 codec wrappers, the VP8 RTP splitter/collector with its
//! CRC-gated reassembly, the per-session payload encryption, the
//! Kalman-driven jitter buffer, the pull audio mixer and the voice
//! processing chain (echo cancellation, noise suppression, gain control).

pub mod codec;
pub mod crypto;
pub mod error;
pub mod jitter;
pub mod mixer;
pub mod payload;
pub mod processing;
pub mod time;
pub mod types;

pub use crypto::{Decryptor, Encryptor};
pub use error::{Error, Result};
pub use jitter::{JitterBuffer, JitterMode};
pub use mixer::AudioMixer;
pub use payload::{VideoCollector, VideoSplitter, SPLITTED_PACKET_SIZE};
pub use processing::VoiceProcessor;
pub use time::TimeMeter;
pub use types::{ColorSpace, Resolution};

use crc::{Crc, CRC_32_ISO_HDLC};

/// CRC-32 used by the frame integrity extension (the zlib polynomial).
pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 of a payload as stamped into RTP extension word 0.
pub fn payload_crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}
