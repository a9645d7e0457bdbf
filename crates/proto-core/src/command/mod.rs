//! Command envelopes and dispatch.
//!
//! A command on the wire is `{"<name>":{...fields...}}`. [`command_type`]
//! recognizes the name from the first quoted token so the read loop can
//! dispatch without decoding the whole message; [`parse`] then produces the
//! typed command.

pub mod conference;
pub mod contacts;
pub mod device;
pub mod media;
pub mod session;

pub use conference::*;
pub use contacts::*;
pub use device::*;
pub use media::*;
pub use session::*;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// A typed signalling command.
pub trait Command: Serialize + DeserializeOwned {
    /// Wire name, the single key of the envelope object.
    const NAME: &'static str;
}

/// Wrap a command into its one-key envelope.
pub fn serialize<C: Command>(command: &C) -> String {
    serde_json::json!({ C::NAME: command }).to_string()
}

/// Decode a message known to carry command `C`.
pub fn parse<C: Command>(message: &str) -> Result<C> {
    let value: serde_json::Value = serde_json::from_str(message)?;
    let inner = value.get(C::NAME).ok_or(Error::WrongCommand(C::NAME))?;
    Ok(serde_json::from_value(inner.clone())?)
}

/// Every command the engine can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Undefined,
    ConnectRequest,
    ConnectResponse,
    Disconnect,
    ChangeServer,
    Ping,
    SetMaxBitrate,
    UpdateGrants,
    ContactList,
    SearchContact,
    ContactsUpdate,
    ChangeContactState,
    GroupList,
    ConferencesList,
    ConferenceUpdateRequest,
    ConferenceUpdateResponse,
    CreateTempConference,
    SendConnectToConference,
    ConnectToConferenceRequest,
    ConnectToConferenceResponse,
    DisconnectFromConference,
    ChangeMemberState,
    TurnSpeaker,
    MemberAction,
    WantSpeak,
    ScheduleConnect,
    CallRequest,
    CallResponse,
    MicrophoneActive,
    DeviceParams,
    DeviceConnect,
    DeviceDisconnect,
    RendererConnect,
    RendererDisconnect,
    ResolutionChange,
    Media,
    DeliveryMessages,
    LoadMessages,
    LoadBlobs,
    DeliveryBlobs,
    RequestMediaAddresses,
    MediaAddressesList,
}

impl CommandType {
    pub fn from_name(name: &str) -> Self {
        match name {
            ConnectRequest::NAME => CommandType::ConnectRequest,
            ConnectResponse::NAME => CommandType::ConnectResponse,
            Disconnect::NAME => CommandType::Disconnect,
            ChangeServer::NAME => CommandType::ChangeServer,
            Ping::NAME => CommandType::Ping,
            SetMaxBitrate::NAME => CommandType::SetMaxBitrate,
            UpdateGrants::NAME => CommandType::UpdateGrants,
            ContactList::NAME => CommandType::ContactList,
            SearchContact::NAME => CommandType::SearchContact,
            ContactsUpdate::NAME => CommandType::ContactsUpdate,
            ChangeContactState::NAME => CommandType::ChangeContactState,
            GroupList::NAME => CommandType::GroupList,
            ConferencesList::NAME => CommandType::ConferencesList,
            ConferenceUpdateRequest::NAME => CommandType::ConferenceUpdateRequest,
            ConferenceUpdateResponse::NAME => CommandType::ConferenceUpdateResponse,
            CreateTempConference::NAME => CommandType::CreateTempConference,
            SendConnectToConference::NAME => CommandType::SendConnectToConference,
            ConnectToConferenceRequest::NAME => CommandType::ConnectToConferenceRequest,
            ConnectToConferenceResponse::NAME => CommandType::ConnectToConferenceResponse,
            DisconnectFromConference::NAME => CommandType::DisconnectFromConference,
            ChangeMemberState::NAME => CommandType::ChangeMemberState,
            TurnSpeaker::NAME => CommandType::TurnSpeaker,
            MemberActionCommand::NAME => CommandType::MemberAction,
            WantSpeak::NAME => CommandType::WantSpeak,
            ScheduleConnect::NAME => CommandType::ScheduleConnect,
            CallRequest::NAME => CommandType::CallRequest,
            CallResponse::NAME => CommandType::CallResponse,
            MicrophoneActive::NAME => CommandType::MicrophoneActive,
            DeviceParams::NAME => CommandType::DeviceParams,
            DeviceConnect::NAME => CommandType::DeviceConnect,
            DeviceDisconnect::NAME => CommandType::DeviceDisconnect,
            RendererConnect::NAME => CommandType::RendererConnect,
            RendererDisconnect::NAME => CommandType::RendererDisconnect,
            ResolutionChange::NAME => CommandType::ResolutionChange,
            Media::NAME => CommandType::Media,
            DeliveryMessages::NAME => CommandType::DeliveryMessages,
            LoadMessages::NAME => CommandType::LoadMessages,
            LoadBlobs::NAME => CommandType::LoadBlobs,
            DeliveryBlobs::NAME => CommandType::DeliveryBlobs,
            RequestMediaAddresses::NAME => CommandType::RequestMediaAddresses,
            MediaAddressesList::NAME => CommandType::MediaAddressesList,
            _ => CommandType::Undefined,
        }
    }
}

/// Sniff the command name from the first quoted token of a message.
pub fn command_type(message: &str) -> CommandType {
    let Some(first) = message.find('"') else {
        return CommandType::Undefined;
    };
    let rest = &message[first + 1..];
    let Some(len) = rest.find('"') else {
        return CommandType::Undefined;
    };
    let name = rest[..len].to_ascii_lowercase();
    CommandType::from_name(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let cmd = Ping {};
        let wire = serialize(&cmd);
        assert_eq!(wire, r#"{"ping":{}}"#);
        assert_eq!(command_type(&wire), CommandType::Ping);
        parse::<Ping>(&wire).unwrap();
    }

    #[test]
    fn sniffing_is_case_insensitive_and_safe_on_junk() {
        assert_eq!(command_type(r#"{"PING":{}}"#), CommandType::Ping);
        assert_eq!(command_type("not json at all"), CommandType::Undefined);
        assert_eq!(command_type(r#"{"#), CommandType::Undefined);
    }

    #[test]
    fn parse_rejects_wrong_envelope() {
        assert!(parse::<ConnectResponse>(r#"{"ping":{}}"#).is_err());
    }
}
