//! Device announcement and media routing commands.

use serde::{Deserialize, Serialize};

use super::Command;
use crate::entities::{wire_enum, DeviceType};

wire_enum!(DeviceConnectType {
    Undefined = 0,
    CreatedCapturer = 1,
    ConnectRenderer = 2,
} fallback Undefined);

/// Announce a local capturer to the conference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceParams {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub ssrc: u32,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub ord: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub resolution: u32,
    #[serde(default)]
    pub color_space: u32,
}

impl Command for DeviceParams {
    const NAME: &'static str = "device_params";
}

/// Per-peer session bring-up, sent by the server for every remote device the
/// client must render (or echo of the client's own capturer when `my`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConnect {
    #[serde(default)]
    pub connect_type: DeviceConnectType,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub device_id: u32,
    #[serde(default)]
    pub client_id: i64,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub receiver_ssrc: u32,
    #[serde(default)]
    pub author_ssrc: u32,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resolution: u32,
    #[serde(default)]
    pub color_space: u32,
    #[serde(default)]
    pub my: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secure_key: String,
}

impl Command for DeviceConnect {
    const NAME: &'static str = "device_connect";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDisconnect {
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub device_id: u32,
    #[serde(default)]
    pub client_id: i64,
    #[serde(default)]
    pub author_ssrc: u32,
}

impl Command for DeviceDisconnect {
    const NAME: &'static str = "device_disconnect";
}

/// Ask the server to route a published SSRC to this client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RendererConnect {
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub author_ssrc: u32,
    #[serde(default)]
    pub client_id: i64,
}

impl Command for RendererConnect {
    const NAME: &'static str = "renderer_connect";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RendererDisconnect {
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub author_ssrc: u32,
    #[serde(default)]
    pub client_id: i64,
}

impl Command for RendererDisconnect {
    const NAME: &'static str = "renderer_disconnect";
}

/// A publisher changed its capture resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionChange {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub resolution: u32,
}

impl Command for ResolutionChange {
    const NAME: &'static str = "resolution_change";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{parse, serialize};

    #[test]
    fn device_connect_round_trip() {
        let cmd = DeviceConnect {
            connect_type: DeviceConnectType::ConnectRenderer,
            device_type: DeviceType::Microphone,
            device_id: 3,
            client_id: 99,
            receiver_ssrc: 1000,
            author_ssrc: 2000,
            address: "203.0.113.10".into(),
            port: 5004,
            secure_key: "key".into(),
            ..DeviceConnect::default()
        };
        let wire = serialize(&cmd);
        assert_eq!(parse::<DeviceConnect>(&wire).unwrap(), cmd);
    }
}
