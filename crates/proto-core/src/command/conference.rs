//! Conference lifecycle and membership commands.

use serde::{Deserialize, Serialize};

use super::Command;
use crate::entities::{wire_enum, Conference, MemberAction};

wire_enum!(ConferenceConnectResult {
    Undefined = 0,
    Ok = 1,
    NotExists = 2,
    NotAllowed = 3,
    LicenseFull = 4,
} fallback Undefined);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConferencesList {
    #[serde(default)]
    pub conferences: Vec<Conference>,
}

impl Command for ConferencesList {
    const NAME: &'static str = "conferences_list";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConferenceUpdateRequest {
    #[serde(default)]
    pub action: u32,
    #[serde(default)]
    pub conference: Conference,
}

impl Command for ConferenceUpdateRequest {
    const NAME: &'static str = "conference_update_request";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConferenceUpdateResponse {
    #[serde(default)]
    pub result: u32,
    #[serde(default)]
    pub id: i64,
}

impl Command for ConferenceUpdateResponse {
    const NAME: &'static str = "conference_update_response";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTempConference {
    #[serde(default)]
    pub subscriber_id: i64,
}

impl Command for CreateTempConference {
    const NAME: &'static str = "create_temp_conference";
}

/// Ring a user into a conference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendConnectToConference {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub connecter_id: i64,
    #[serde(default)]
    pub connecter_connection_id: u32,
    #[serde(default)]
    pub flags: u32,
}

impl Command for SendConnectToConference {
    const NAME: &'static str = "send_connect_to_conference";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectToConferenceRequest {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub connect_members: bool,
    #[serde(default)]
    pub has_camera: bool,
    #[serde(default)]
    pub has_microphone: bool,
    #[serde(default)]
    pub has_demonstration: bool,
}

impl Command for ConnectToConferenceRequest {
    const NAME: &'static str = "connect_to_conference_request";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectToConferenceResponse {
    #[serde(default)]
    pub result: ConferenceConnectResult,
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub grants: u32,
    #[serde(default)]
    pub founder_id: i64,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub temp: bool,
}

impl Command for ConnectToConferenceResponse {
    const NAME: &'static str = "connect_to_conference_response";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisconnectFromConference {}

impl Command for DisconnectFromConference {
    const NAME: &'static str = "disconnect_from_conference";
}

/// A member joined, left or changed its published devices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeMemberState {
    #[serde(default)]
    pub members: Vec<crate::entities::Member>,
}

impl Command for ChangeMemberState {
    const NAME: &'static str = "change_member_state";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnSpeaker {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub enabled: bool,
}

impl Command for TurnSpeaker {
    const NAME: &'static str = "turn_speaker";
}

/// Kick / mute / enable-remote-control style moderator actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberActionCommand {
    #[serde(default, rename = "id")]
    pub ids: Vec<i64>,
    #[serde(default)]
    pub action: MemberAction,
    #[serde(default)]
    pub result: u32,
    #[serde(default)]
    pub actor_id: i64,
    #[serde(default)]
    pub actor_name: String,
    #[serde(default)]
    pub grants: u32,
}

impl Command for MemberActionCommand {
    const NAME: &'static str = "member_action";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WantSpeak {
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub is_speak: bool,
}

impl Command for WantSpeak {
    const NAME: &'static str = "want_speak";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConnect {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub time_limit: u32,
}

impl Command for ScheduleConnect {
    const NAME: &'static str = "schedule_connect";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub connection_id: u32,
}

impl Command for CallRequest {
    const NAME: &'static str = "call_request";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub connection_id: u32,
    #[serde(default)]
    pub result: u32,
}

impl Command for CallResponse {
    const NAME: &'static str = "call_response";
}

/// Voice-activity transitions of the local microphone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MicrophoneActive {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub ssrc: u32,
}

impl Command for MicrophoneActive {
    const NAME: &'static str = "microphone_active";
}
