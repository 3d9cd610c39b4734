//! Domain objects rebuilt from raw events, and the batches subscribers receive.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Channel or profile metadata as entered by a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub about: String,
    pub picture: String,
}

impl Metadata {
    pub fn new(
        name: impl Into<String>,
        about: impl Into<String>,
        picture: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            about: about.into(),
            picture: picture.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Id of the kind 40 creation event.
    pub id: String,
    pub name: String,
    pub about: String,
    pub picture: String,
    pub created: u64,
    pub creator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    pub id: String,
    pub channel_id: String,
    pub name: String,
    pub about: String,
    pub picture: String,
    pub creator: String,
    pub created: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicMessage {
    pub id: String,
    /// Channel id, `""` when the message carries no root marker.
    pub root: String,
    /// Parent message id, `""` for top-level messages.
    pub reply: String,
    pub content: String,
    pub creator: String,
    pub mentions: Vec<String>,
    pub created: u64,
    pub decrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: String,
    pub root: String,
    pub content: String,
    /// The party that is not the local identity.
    pub peer: String,
    pub creator: String,
    pub mentions: Vec<String>,
    pub created: u64,
    pub decrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub creator: String,
    pub created: u64,
    pub name: String,
    pub about: String,
    pub picture: String,
    pub nip05: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    /// Id of the message reacted to.
    pub message: String,
    pub creator: String,
    /// Author of the message reacted to.
    pub peer: String,
    pub content: String,
    pub created: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDeletion {
    pub event_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessageHide {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUserMute {
    pub pubkey: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteList {
    pub pubkeys: Vec<String>,
    pub encrypted: String,
}

/// Chat or peer id to the unix time it was last read.
pub type ReadMarkMap = BTreeMap<String, u64>;

/// What the engine emits to subscribers. Batch variants are never empty;
/// `MuteList` is empty when the list was cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RavenEvent {
    /// Own events have been fetched.
    Ready,
    /// Incoming direct messages have been fetched.
    DmsDone,
    /// Initial channel sync has finished.
    SyncDone,
    ProfileUpdate(Vec<Profile>),
    PublicMessage(Vec<PublicMessage>),
    DirectMessage(Vec<DirectMessage>),
    ChannelMessageHide(Vec<ChannelMessageHide>),
    ChannelUserMute(Vec<ChannelUserMute>),
    Reaction(Vec<Reaction>),
    EventDeletion(Vec<EventDeletion>),
    MuteList(MuteList),
    ChannelCreation(Vec<Channel>),
    ChannelUpdate(Vec<ChannelUpdate>),
    ReadMarkMap(ReadMarkMap),
}

impl RavenEvent {
    pub fn label(&self) -> &'static str {
        match self {
            RavenEvent::Ready => "ready",
            RavenEvent::DmsDone => "dms_done",
            RavenEvent::SyncDone => "sync_done",
            RavenEvent::ProfileUpdate(_) => "profile_update",
            RavenEvent::PublicMessage(_) => "public_message",
            RavenEvent::DirectMessage(_) => "direct_message",
            RavenEvent::ChannelMessageHide(_) => "channel_message_hide",
            RavenEvent::ChannelUserMute(_) => "channel_user_mute",
            RavenEvent::Reaction(_) => "reaction",
            RavenEvent::EventDeletion(_) => "event_deletion",
            RavenEvent::MuteList(_) => "mute_list",
            RavenEvent::ChannelCreation(_) => "channel_creation",
            RavenEvent::ChannelUpdate(_) => "channel_update",
            RavenEvent::ReadMarkMap(_) => "read_mark_map",
        }
    }

    /// Number of domain objects carried.
    pub fn len(&self) -> usize {
        match self {
            RavenEvent::Ready | RavenEvent::DmsDone | RavenEvent::SyncDone => 0,
            RavenEvent::ProfileUpdate(items) => items.len(),
            RavenEvent::PublicMessage(items) => items.len(),
            RavenEvent::DirectMessage(items) => items.len(),
            RavenEvent::ChannelMessageHide(items) => items.len(),
            RavenEvent::ChannelUserMute(items) => items.len(),
            RavenEvent::Reaction(items) => items.len(),
            RavenEvent::EventDeletion(items) => items.len(),
            RavenEvent::MuteList(list) => list.pubkeys.len(),
            RavenEvent::ChannelCreation(items) => items.len(),
            RavenEvent::ChannelUpdate(items) => items.len(),
            RavenEvent::ReadMarkMap(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            RavenEvent::Ready | RavenEvent::DmsDone | RavenEvent::SyncDone
        )
    }
}
