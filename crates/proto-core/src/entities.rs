//! Protocol entities: members, groups, conferences and chat messages.
//!
//! Field names follow the wire protocol exactly; enums travel as integers.

use serde::{Deserialize, Serialize};

/// Implements integer wire encoding for a protocol enum, with an
/// `Undefined`-style fallback for unknown values so new server revisions do
/// not break old clients.
macro_rules! wire_enum {
    ($name:ident { $($variant:ident = $value:expr),+ $(,)? } fallback $fallback:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn from_u32(value: u32) -> Self {
                match value {
                    $($value => $name::$variant,)+
                    _ => $name::$fallback,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::$fallback
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u32(*self as u32)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                Ok($name::from_u32(u32::deserialize(deserializer)?))
            }
        }
    };
}

pub(crate) use wire_enum;

wire_enum!(MemberState {
    Undefined = 0,
    Offline = 1,
    Online = 2,
    Conferencing = 3,
} fallback Undefined);

wire_enum!(DeviceType {
    Undefined = 0,
    Camera = 1,
    Microphone = 2,
    Demonstration = 3,
    AudioRenderer = 4,
    VideoRenderer = 5,
} fallback Undefined);

wire_enum!(ConferenceType {
    Undefined = 0,
    Symmetric = 1,
    Asymmetric = 2,
    AsymmetricWithSymmetricSound = 3,
} fallback Undefined);

wire_enum!(MemberAction {
    Undefined = 0,
    TurnCamera = 1,
    TurnMicrophone = 2,
    TurnDemonstration = 3,
    TurnSpeaker = 4,
    EnableRemoteControl = 5,
    DisableRemoteControl = 6,
    MuteMicrophone = 7,
    DisconnectFromConference = 8,
} fallback Undefined);

/// A contact / conference participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    #[serde(default)]
    pub state: MemberState,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub max_input_bitrate: u32,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub has_camera: bool,
    #[serde(default)]
    pub has_microphone: bool,
    #[serde(default)]
    pub has_demonstration: bool,
    #[serde(default)]
    pub grants: u32,
    #[serde(default)]
    pub deleted: bool,
}

/// A contact-list group node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    #[serde(default)]
    pub parent_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub owner_id: i64,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub deleted: bool,
}

/// A conference room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conference {
    pub id: i64,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub descr: String,
    #[serde(default)]
    pub founder_id: i64,
    #[serde(default, rename = "type")]
    pub conference_type: ConferenceType,
    #[serde(default)]
    pub grants: u32,
    #[serde(default)]
    pub duration: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<Member>,
    #[serde(default)]
    pub connect_members: bool,
    #[serde(default)]
    pub temp: bool,
    #[serde(default)]
    pub deleted: bool,
}

/// A chat message traversing the signalling channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub dt: i64,
    #[serde(default, rename = "type")]
    pub message_type: u32,
    #[serde(default)]
    pub author_id: i64,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub sender_id: i64,
    #[serde(default)]
    pub subscriber_id: i64,
    #[serde(default)]
    pub subscriber_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub conference_tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub conference_name: String,
    #[serde(default)]
    pub status: u32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub call_duration: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_round_trips_with_wire_names() {
        let member = Member {
            id: 7,
            state: MemberState::Conferencing,
            login: "alice".into(),
            name: "Alice".into(),
            has_camera: true,
            grants: 3,
            ..Member::default()
        };
        let json = serde_json::to_string(&member).unwrap();
        assert!(json.contains("\"has_camera\":true"));
        assert!(json.contains("\"state\":3"));
        let back: Member = serde_json::from_str(&json).unwrap();
        assert_eq!(back, member);
    }

    #[test]
    fn unknown_enum_values_fall_back_to_undefined() {
        let member: Member = serde_json::from_str(r#"{"id":1,"state":99}"#).unwrap();
        assert_eq!(member.state, MemberState::Undefined);
    }

    #[test]
    fn conference_type_uses_wire_key() {
        let conference: Conference =
            serde_json::from_str(r#"{"id":5,"tag":"room","type":2}"#).unwrap();
        assert_eq!(conference.conference_type, ConferenceType::Asymmetric);
    }
}
