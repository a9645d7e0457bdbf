//! Typed events the controller raises toward the application.
//!
//! The engine never calls back into UI code; everything user-visible leaves
//! through this event stream.

use confero_proto_core::{Conference, Group, Member, Message};

use crate::controller::ClientState;
use crate::error::AuthFailReason;

/// Why a session raised a device notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceNotifyKind {
    /// Component could not allocate its working memory / codec
    MemoryError,
    /// Encoder cannot keep up; the peer asked to reduce complexity
    OvertimeCoding,
    /// The capture device disappeared
    DeviceEnded,
}

/// A device notification with enough context to address the session.
#[derive(Debug, Clone)]
pub struct DeviceNotify {
    pub kind: DeviceNotifyKind,
    pub device_type: confero_proto_core::DeviceType,
    pub device_id: u32,
    pub name: String,
}

/// Callback sessions use to report device problems to the controller.
pub type DeviceNotifyCallback = std::sync::Arc<dyn Fn(DeviceNotify) + Send + Sync>;

/// Events out of the controller, in occurrence order.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The controller state machine moved.
    StateChanged(ClientState),
    /// Logon refused; the application should collect new credentials.
    AuthFailed(AuthFailReason),
    /// The server redirected this client to another front end.
    ServerChanged(String),
    /// Contact list replaced or incrementally updated.
    ContactsUpdated(Vec<Member>),
    /// Group tree received.
    GroupsUpdated(Vec<Group>),
    /// Conference catalogue received.
    ConferencesUpdated(Vec<Conference>),
    /// A conference was joined.
    ConferenceJoined(Conference),
    /// The current conference was left.
    ConferenceLeft,
    /// Join attempt refused (unknown tag, no permission, license full).
    ConferenceRefused { reason: String },
    /// A member changed state inside the conference.
    MemberStateChanged(Vec<Member>),
    /// The active speaker changed.
    SpeakerChanged { client_id: i64 },
    /// A member asks for (or yields) the floor.
    WantSpeak { user_id: i64, user_name: String, is_speak: bool },
    /// Incoming ring into a conference.
    ScheduleConnect { tag: String, name: String },
    /// Incoming call offer from a contact.
    CallIncoming { id: i64, name: String },
    /// Result of a conference create/update request.
    ConferenceUpdateResult { result: u32, id: i64 },
    /// Chat messages delivered over signalling.
    MessagesDelivered(Vec<Message>),
    /// A session reported a device problem.
    DeviceNotify(DeviceNotify),
    /// Remote control input arrived for a published demonstration.
    RemoteControlInput { device_id: u32, payload: [u8; 8] },
    /// Signalling connection dropped; the controller is reconnecting.
    ConnectionLost,
}
