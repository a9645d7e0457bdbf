//! RTP packet codec.
//!
//! Wire format is the RFC 3550 baseline. The engine uses the extension block
//! for small fixed payloads: encoders stamp `ext[0]` with a CRC-32 of the
//! encoded payload, and the video splitter additionally stamps `ext[1]` with
//! the original (pre-split) sequence number. CSRC and extension capacities
//! are static so a hostile peer cannot make a parse allocate or overflow.

pub mod rtcp;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Static CSRC capacity.
pub const MAX_CSRC: usize = 15;

/// Static extension block capacity, in 32-bit words.
pub const MAX_EXTENSION_WORDS: usize = 8;

/// Payload types carried by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtpPayloadType {
    /// Raw PCM frames, used only on the in-process AEC reference path
    Pcm = 11,
    Vp8 = 96,
    Opus = 102,
}

impl RtpPayloadType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            11 => Some(RtpPayloadType::Pcm),
            96 => Some(RtpPayloadType::Vp8),
            102 => Some(RtpPayloadType::Opus),
            _ => None,
        }
    }
}

/// RTP fixed header plus the engine's bounded CSRC/extension blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub seq: u16,
    pub ts: u32,
    pub ssrc: u32,
    pub csrc: [u32; MAX_CSRC],
    /// Extension length in words as carried on the wire; only the first
    /// [`MAX_EXTENSION_WORDS`] words are retained.
    pub extension_len: u16,
    pub ext: [u32; MAX_EXTENSION_WORDS],
}

impl Default for RtpHeader {
    fn default() -> Self {
        Self {
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: 0,
            seq: 0,
            ts: 0,
            ssrc: 0,
            csrc: [0; MAX_CSRC],
            extension_len: 0,
            ext: [0; MAX_EXTENSION_WORDS],
        }
    }
}

impl RtpHeader {
    /// Header size on the wire, in bytes.
    pub fn size(&self) -> usize {
        let mut size = 12 + self.csrc_count as usize * 4;
        if self.extension {
            size += 4 + self.extension_len as usize * 4;
        }
        size
    }

    /// Stamp the extension block with a single word.
    pub fn set_extension_word(&mut self, word: u32) {
        self.extension = true;
        self.extension_len = 1;
        self.ext[0] = word;
    }
}

/// One RTP packet with an owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Parse a packet. Fails on `version != 2` and on a declared header size
    /// that exceeds the input.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            return Err(Error::BufferTooSmall { required: 12, available: buf.len() });
        }

        let first = buf[0];
        if first >> 6 != 2 {
            return Err(Error::MalformedPacket("rtp version is not 2"));
        }

        let mut header = RtpHeader {
            padding: first & 0x20 != 0,
            extension: first & 0x10 != 0,
            csrc_count: first & 0x0f,
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7f,
            ..RtpHeader::default()
        };

        let mut cursor = &buf[2..];
        header.seq = cursor.get_u16();
        header.ts = cursor.get_u32();
        header.ssrc = cursor.get_u32();

        let mut header_size = 12 + header.csrc_count as usize * 4;
        if header_size > buf.len() {
            return Err(Error::MalformedPacket("csrc block exceeds packet"));
        }
        for i in 0..header.csrc_count as usize {
            let word = cursor.get_u32();
            if i < MAX_CSRC {
                header.csrc[i] = word;
            }
        }

        if header.extension {
            if header_size + 4 > buf.len() {
                return Err(Error::MalformedPacket("extension header exceeds packet"));
            }
            cursor.advance(2); // profile word, unused
            header.extension_len = cursor.get_u16();
            header_size += 4 + header.extension_len as usize * 4;
            if header_size > buf.len() {
                return Err(Error::MalformedPacket("extension block exceeds packet"));
            }
            // Words beyond the static capacity are skipped, not stored.
            for i in 0..header.extension_len as usize {
                let word = cursor.get_u32();
                if i < MAX_EXTENSION_WORDS {
                    header.ext[i] = word;
                }
            }
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&buf[header_size..]),
        })
    }

    /// Serialize into a fresh buffer. The extension length is clamped to the
    /// static capacity on the way out.
    pub fn serialize(&self) -> Bytes {
        let h = &self.header;
        let csrc_count = (h.csrc_count as usize).min(MAX_CSRC);
        let ext_len = (h.extension_len as usize).min(MAX_EXTENSION_WORDS);

        let mut buf = BytesMut::with_capacity(h.size() + self.payload.len());

        let mut first = 0x80u8 | csrc_count as u8;
        if h.padding {
            first |= 0x20;
        }
        if h.extension {
            first |= 0x10;
        }
        buf.put_u8(first);
        buf.put_u8(if h.marker { h.payload_type | 0x80 } else { h.payload_type & 0x7f });
        buf.put_u16(h.seq);
        buf.put_u32(h.ts);
        buf.put_u32(h.ssrc);

        for i in 0..csrc_count {
            buf.put_u32(h.csrc[i]);
        }

        if h.extension {
            buf.put_u16(0);
            buf.put_u16(ext_len as u16);
            for i in 0..ext_len {
                buf.put_u32(h.ext[i]);
            }
        }

        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> RtpPacket {
        let mut header = RtpHeader {
            marker: true,
            payload_type: RtpPayloadType::Opus as u8,
            seq: 4242,
            ts: 960_000,
            ssrc: 0xdead_beef,
            ..RtpHeader::default()
        };
        header.extension = true;
        header.extension_len = 2;
        header.ext[0] = 0x1234_5678;
        header.ext[1] = 77;
        RtpPacket::new(header, Bytes::from_static(b"opus-payload"))
    }

    #[test]
    fn serialize_parse_round_trip() {
        let packet = sample_packet();
        let wire = packet.serialize();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed, packet);
        // Re-serializing the parsed packet reproduces the exact bytes.
        assert_eq!(parsed.serialize(), wire);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut wire = sample_packet().serialize().to_vec();
        wire[0] = 0x40 | (wire[0] & 0x3f); // version 1
        assert!(RtpPacket::parse(&wire).is_err());
    }

    #[test]
    fn rejects_header_longer_than_packet() {
        let mut wire = sample_packet().serialize().to_vec();
        // Claim a giant extension block.
        let ext_len_offset = 12 + 2;
        wire[ext_len_offset] = 0xff;
        wire[ext_len_offset + 1] = 0xff;
        assert!(RtpPacket::parse(&wire).is_err());
    }

    #[test]
    fn extension_words_beyond_capacity_are_dropped_not_read_oob() {
        let mut header = RtpHeader::default();
        header.extension = true;
        header.extension_len = 2;
        header.ext[0] = 1;
        header.ext[1] = 2;
        let mut wire = RtpPacket::new(header, Bytes::new()).serialize().to_vec();
        // Grow the declared extension to 12 words and append the extra data.
        wire[14] = 0;
        wire[15] = 12;
        wire.extend_from_slice(&[0u8; 10 * 4]);
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.header.extension_len, 12);
        assert_eq!(parsed.header.ext[0], 1);
        assert_eq!(parsed.header.ext[1], 2);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn payload_is_copied_verbatim() {
        let packet = sample_packet();
        let parsed = RtpPacket::parse(&packet.serialize()).unwrap();
        assert_eq!(parsed.payload, Bytes::from_static(b"opus-payload"));
    }
}
