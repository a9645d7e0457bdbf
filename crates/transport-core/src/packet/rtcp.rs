//! RTCP packet codec.
//!
//! The engine produces SR, RR and APP packets only. APP carries the control
//! side-band: force-keyframe, stream stats, complexity reduction, frame-rate
//! change, the UDP reachability probe and remote-control input events.
//!
//! The common `length` field is clamped to 1 on receive. That is a hardening
//! choice inherited from the deployed protocol, not an RFC 3550 truth: peers
//! never send compound packets, so anything longer is treated as hostile.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const RTCP_SR: u8 = 200;
pub const RTCP_RR: u8 = 201;
pub const RTCP_APP: u8 = 204;

/// APP packet message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AppMessageType {
    Undefined = 0,
    ForceKeyFrame = 1,
    Stat = 2,
    ReduceComplexity = 3,
    SetFrameRate = 4,
    UdpTest = 5,
    RemoteControl = 6,
}

impl AppMessageType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => AppMessageType::ForceKeyFrame,
            2 => AppMessageType::Stat,
            3 => AppMessageType::ReduceComplexity,
            4 => AppMessageType::SetFrameRate,
            5 => AppMessageType::UdpTest,
            6 => AppMessageType::RemoteControl,
            _ => AppMessageType::Undefined,
        }
    }
}

/// Remote control sub-commands carried in APP `RemoteControl` payloads.
/// The payload layout is a 2-octet action code followed by action bytes
/// (x/y coordinates, wheel delta or key code plus modifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RemoteControlAction {
    Move = 0,
    LeftUp = 1,
    LeftDown = 2,
    CenterUp = 3,
    CenterDown = 4,
    RightUp = 5,
    RightDown = 6,
    LeftDblClick = 7,
    RightDblClick = 8,
    Wheel = 9,
    KeyUp = 10,
    KeyDown = 11,
}

impl RemoteControlAction {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => RemoteControlAction::Move,
            1 => RemoteControlAction::LeftUp,
            2 => RemoteControlAction::LeftDown,
            3 => RemoteControlAction::CenterUp,
            4 => RemoteControlAction::CenterDown,
            5 => RemoteControlAction::RightUp,
            6 => RemoteControlAction::RightDown,
            7 => RemoteControlAction::LeftDblClick,
            8 => RemoteControlAction::RightDblClick,
            9 => RemoteControlAction::Wheel,
            10 => RemoteControlAction::KeyUp,
            11 => RemoteControlAction::KeyDown,
            _ => return None,
        })
    }
}

/// Typed RTCP body. The engine never emits report blocks, so SR and RR carry
/// their fixed part only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpBody {
    SenderReport {
        ssrc: u32,
        ntp_sec: u32,
        ntp_frac: u32,
        rtp_ts: u32,
        packet_count: u32,
        octet_count: u32,
    },
    ReceiverReport {
        ssrc: u32,
    },
    App {
        message_type: AppMessageType,
        ssrc: u32,
        payload: [u8; 8],
    },
}

impl RtcpBody {
    fn wire_size(&self) -> usize {
        match self {
            RtcpBody::SenderReport { .. } => 24,
            RtcpBody::ReceiverReport { .. } => 4,
            RtcpBody::App { .. } => 16,
        }
    }

    fn packet_type(&self) -> u8 {
        match self {
            RtcpBody::SenderReport { .. } => RTCP_SR,
            RtcpBody::ReceiverReport { .. } => RTCP_RR,
            RtcpBody::App { .. } => RTCP_APP,
        }
    }
}

/// One RTCP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpPacket {
    pub padding: bool,
    pub count: u8,
    pub body: RtcpBody,
}

impl RtcpPacket {
    /// Build an APP packet, the engine's control side-band carrier.
    pub fn app(message_type: AppMessageType, ssrc: u32, payload: [u8; 8]) -> Self {
        Self {
            padding: false,
            count: 0,
            body: RtcpBody::App { message_type, ssrc, payload },
        }
    }

    /// Build an APP packet whose payload is a single big-endian word.
    pub fn app_with_word(message_type: AppMessageType, ssrc: u32, word: u32) -> Self {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&word.to_be_bytes());
        Self::app(message_type, ssrc, payload)
    }

    /// First big-endian payload word of an APP packet.
    pub fn app_word(&self) -> Option<u32> {
        match &self.body {
            RtcpBody::App { payload, .. } => {
                Some(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
            }
            _ => None,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::BufferTooSmall { required: 4, available: buf.len() });
        }

        let first = buf[0];
        if first >> 6 != 2 {
            return Err(Error::MalformedPacket("rtcp version is not 2"));
        }
        let padding = first & 0x20 != 0;
        let count = first & 0x1f;
        let packet_type = buf[1];

        let mut cursor = &buf[2..];
        let length = cursor.get_u16();
        if length == 0 {
            return Err(Error::MalformedPacket("rtcp length is zero"));
        }
        // length > 1 is clamped: compound packets are never legitimate here,
        // only the first body is read.

        let body = match packet_type {
            RTCP_SR => {
                if cursor.remaining() < 24 {
                    return Err(Error::MalformedPacket("truncated sender report"));
                }
                RtcpBody::SenderReport {
                    ssrc: cursor.get_u32(),
                    ntp_sec: cursor.get_u32(),
                    ntp_frac: cursor.get_u32(),
                    rtp_ts: cursor.get_u32(),
                    packet_count: cursor.get_u32(),
                    octet_count: cursor.get_u32(),
                }
            }
            RTCP_RR => {
                if cursor.remaining() < 4 {
                    return Err(Error::MalformedPacket("truncated receiver report"));
                }
                RtcpBody::ReceiverReport { ssrc: cursor.get_u32() }
            }
            RTCP_APP => {
                if cursor.remaining() < 16 {
                    return Err(Error::MalformedPacket("truncated app packet"));
                }
                let message_type = AppMessageType::from_u32(cursor.get_u32());
                let ssrc = cursor.get_u32();
                let mut payload = [0u8; 8];
                cursor.copy_to_slice(&mut payload);
                RtcpBody::App { message_type, ssrc, payload }
            }
            _ => return Err(Error::MalformedPacket("unsupported rtcp packet type")),
        };

        Ok(Self { padding, count, body })
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.body.wire_size());

        let mut first = 0x80u8 | (self.count & 0x1f);
        if self.padding {
            first |= 0x20;
        }
        buf.put_u8(first);
        buf.put_u8(self.body.packet_type());
        buf.put_u16(1); // single body, always

        match &self.body {
            RtcpBody::SenderReport { ssrc, ntp_sec, ntp_frac, rtp_ts, packet_count, octet_count } => {
                buf.put_u32(*ssrc);
                buf.put_u32(*ntp_sec);
                buf.put_u32(*ntp_frac);
                buf.put_u32(*rtp_ts);
                buf.put_u32(*packet_count);
                buf.put_u32(*octet_count);
            }
            RtcpBody::ReceiverReport { ssrc } => {
                buf.put_u32(*ssrc);
            }
            RtcpBody::App { message_type, ssrc, payload } => {
                buf.put_u32(*message_type as u32);
                buf.put_u32(*ssrc);
                buf.put_slice(payload);
            }
        }

        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_round_trip() {
        let packet = RtcpPacket::app_with_word(AppMessageType::ForceKeyFrame, 42, 31337);
        let parsed = RtcpPacket::parse(&packet.serialize()).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.app_word(), Some(31337));
    }

    #[test]
    fn sender_report_round_trip() {
        let packet = RtcpPacket {
            padding: false,
            count: 0,
            body: RtcpBody::SenderReport {
                ssrc: 7,
                ntp_sec: 100,
                ntp_frac: 200,
                rtp_ts: 48_000,
                packet_count: 50,
                octet_count: 5_000,
            },
        };
        assert_eq!(RtcpPacket::parse(&packet.serialize()).unwrap(), packet);
    }

    #[test]
    fn declared_length_is_ignored_beyond_one_body() {
        let mut wire = RtcpPacket::app(AppMessageType::UdpTest, 1, [0; 8]).serialize().to_vec();
        wire[2] = 0x7f;
        wire[3] = 0xff;
        // Still parses as a single APP body; the huge length is not trusted.
        let parsed = RtcpPacket::parse(&wire).unwrap();
        assert!(matches!(parsed.body, RtcpBody::App { message_type: AppMessageType::UdpTest, .. }));
    }

    #[test]
    fn truncated_app_is_rejected() {
        let wire = RtcpPacket::app(AppMessageType::Stat, 1, [0; 8]).serialize();
        assert!(RtcpPacket::parse(&wire[..10]).is_err());
    }

    #[test]
    fn remote_control_action_codes_round_trip() {
        for code in 0..12u16 {
            let action = RemoteControlAction::from_u16(code).unwrap();
            assert_eq!(action as u16, code);
        }
        assert!(RemoteControlAction::from_u16(12).is_none());
    }
}
