//! Contact list commands.

use serde::{Deserialize, Serialize};

use super::Command;
use crate::entities::{Group, Member};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactList {
    #[serde(default)]
    pub sort_type: u32,
    #[serde(default)]
    pub show_numbers: bool,
    #[serde(default)]
    pub members: Vec<Member>,
}

impl Command for ContactList {
    const NAME: &'static str = "contact_list";
}

/// Incremental contact changes: added, updated or soft-deleted members.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactsUpdate {
    #[serde(default)]
    pub members: Vec<Member>,
}

impl Command for ContactsUpdate {
    const NAME: &'static str = "contacts_update";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchContact {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub members: Vec<Member>,
}

impl Command for SearchContact {
    const NAME: &'static str = "search_contact";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeContactState {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl Command for ChangeContactState {
    const NAME: &'static str = "change_contact_state";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupList {
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl Command for GroupList {
    const NAME: &'static str = "group_list";
}
