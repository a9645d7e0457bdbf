//! Connection lifecycle commands.

use serde::{Deserialize, Serialize};

use super::Command;
use crate::entities::wire_enum;

wire_enum!(ConnectType {
    Undefined = 0,
    Client = 1,
    WSMedia = 2,
} fallback Undefined);

wire_enum!(ConnectResult {
    Undefined = 0,
    Ok = 1,
    InvalidCredentials = 2,
    NoCredentials = 3,
    Redirected = 4,
    UpdateRequired = 5,
    ServerFull = 6,
    InternalServerError = 7,
} fallback Undefined);

/// Client logon. `access_token` substitutes for credentials on WSM media
/// connections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(default, rename = "type")]
    pub connect_type: ConnectType,
    #[serde(default)]
    pub client_version: u32,
    #[serde(default)]
    pub system: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub login: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_token: String,
}

impl Command for ConnectRequest {
    const NAME: &'static str = "connect_request";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(default)]
    pub result: ConnectResult,
    #[serde(default)]
    pub server_version: u32,
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub connection_id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub redirect_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secure_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    #[serde(default)]
    pub options: u32,
    #[serde(default)]
    pub grants: u32,
    #[serde(default)]
    pub max_output_bitrate: u32,
    #[serde(default)]
    pub reduced_frame_rate: u16,
}

impl Command for ConnectResponse {
    const NAME: &'static str = "connect_response";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Disconnect {}

impl Command for Disconnect {
    const NAME: &'static str = "disconnect";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping {}

impl Command for Ping {
    const NAME: &'static str = "ping";
}

/// Server-initiated redirect to another front end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeServer {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub secure: bool,
}

impl Command for ChangeServer {
    const NAME: &'static str = "change_server";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetMaxBitrate {
    #[serde(default)]
    pub bitrate: u32,
}

impl Command for SetMaxBitrate {
    const NAME: &'static str = "set_max_bitrate";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateGrants {
    #[serde(default)]
    pub grants: u32,
}

impl Command for UpdateGrants {
    const NAME: &'static str = "update_grants";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{parse, serialize};

    #[test]
    fn connect_request_omits_empty_credentials() {
        let cmd = ConnectRequest {
            connect_type: ConnectType::WSMedia,
            access_token: "token".into(),
            ..ConnectRequest::default()
        };
        let wire = serialize(&cmd);
        assert!(wire.contains(r#""access_token":"token""#));
        assert!(!wire.contains("password"));
        assert_eq!(parse::<ConnectRequest>(&wire).unwrap(), cmd);
    }

    #[test]
    fn connect_response_round_trip() {
        let cmd = ConnectResponse {
            result: ConnectResult::Ok,
            id: 7,
            connection_id: 1,
            name: "u".into(),
            secure_key: "k".into(),
            ..ConnectResponse::default()
        };
        let wire = serialize(&cmd);
        assert_eq!(parse::<ConnectResponse>(&wire).unwrap(), cmd);
    }
}
