//! Media-over-WebSocket, chat delivery and net-test commands.

use serde::{Deserialize, Serialize};

use super::Command;
use crate::entities::Message;

/// Media type discriminator of a WSM frame.
pub const MEDIA_TYPE_RTP: u32 = 1;
pub const MEDIA_TYPE_RTCP: u32 = 2;

/// One RTP/RTCP packet tunnelled through the signalling WebSocket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Media {
    /// 1 = RTP, 2 = RTCP
    #[serde(rename = "mt")]
    pub media_type: u32,
    pub ssrc: u32,
    /// Destination `host:port` the server should forward to.
    #[serde(rename = "a", default, skip_serializing_if = "String::is_empty")]
    pub addr: String,
    /// Base64 of the serialized packet.
    #[serde(rename = "d")]
    pub data: String,
}

impl Command for Media {
    const NAME: &'static str = "media";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryMessages {
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Command for DeliveryMessages {
    const NAME: &'static str = "delivery_messages";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadMessages {
    #[serde(default)]
    pub from_dt: i64,
    #[serde(default)]
    pub count: u32,
}

impl Command for LoadMessages {
    const NAME: &'static str = "load_messages";
}

/// Request a known blob, used by the speed test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBlobs {
    #[serde(default)]
    pub guids: Vec<String>,
}

impl Command for LoadBlobs {
    const NAME: &'static str = "load_blobs";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryBlobs {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub data: String,
}

impl Command for DeliveryBlobs {
    const NAME: &'static str = "delivery_blobs";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMediaAddresses {}

impl Command for RequestMediaAddresses {
    const NAME: &'static str = "request_media_addresses";
}

/// Candidate media endpoints the client should probe for UDP reachability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaAddressesList {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl Command for MediaAddressesList {
    const NAME: &'static str = "media_addresses_list";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{command_type, parse, serialize, CommandType};

    #[test]
    fn media_uses_short_wire_keys() {
        let cmd = Media {
            media_type: MEDIA_TYPE_RTP,
            ssrc: 42,
            addr: "203.0.113.1:5004".into(),
            data: "AAECAw==".into(),
        };
        let wire = serialize(&cmd);
        assert!(wire.contains(r#""mt":1"#));
        assert!(wire.contains(r#""a":"203.0.113.1:5004""#));
        assert!(wire.contains(r#""d":"AAECAw==""#));
        assert_eq!(command_type(&wire), CommandType::Media);
        assert_eq!(parse::<Media>(&wire).unwrap(), cmd);
    }
}
