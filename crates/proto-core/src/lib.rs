//! JSON signalling protocol.
//!
//! Every signalling message is a JSON object with a single key equal to the
//! command name; the value holds the fields. [`command_type`] sniffs the
//! command name without a full parse so the dispatcher can route messages
//! cheaply, then the typed command is decoded with [`parse`].

pub mod command;
pub mod entities;
pub mod error;

pub use command::{command_type, parse, serialize, Command, CommandType};
pub use entities::{
    Conference, ConferenceType, DeviceType, Group, Member, MemberState, Message,
};
pub use error::{Error, Result};
