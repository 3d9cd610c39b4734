//! Raw events to domain objects.
//!
//! A batch is split by [`EventKind`] and each kind runs through its own
//! reducer in [`EventKind::PIPELINE_ORDER`]. Reducers drop events that lack
//! the tags they need and never fail; apart from direct-message decryption
//! they are pure functions of the batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nostr::nip28::string_field;
use nostr::tag_parsing::{find_tag_value, unique_tag_values};
use nostr::{
    ChannelMetadata, Event, KIND_APP_DATA, KIND_CHANNEL_CREATION, KIND_CHANNEL_HIDE_MESSAGE,
    KIND_CHANNEL_MESSAGE, KIND_CHANNEL_METADATA, KIND_CHANNEL_MUTE_USER,
    KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_EVENT_DELETION, KIND_METADATA, KIND_MUTE_LIST,
    KIND_REACTION, Marker, READ_MARK_MAP_IDENTIFIER, find_marked_reference,
};
use serde_json::Value;
use tracing::debug;

use crate::model::{
    Channel, ChannelMessageHide, ChannelUpdate, ChannelUserMute, DirectMessage, EventDeletion,
    MuteList, Profile, PublicMessage, RavenEvent, Reaction, ReadMarkMap,
};
use crate::signer::Cipher;

/// The event kinds the engine rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Profile,
    PublicMessage,
    DirectMessage,
    MessageHide,
    UserMute,
    Reaction,
    Deletion,
    MuteList,
    ChannelCreation,
    ChannelUpdate,
    ReadMarkMap,
}

impl EventKind {
    /// Order in which reducers run and batches are emitted.
    pub const PIPELINE_ORDER: [EventKind; 11] = [
        EventKind::Profile,
        EventKind::PublicMessage,
        EventKind::DirectMessage,
        EventKind::MessageHide,
        EventKind::UserMute,
        EventKind::Reaction,
        EventKind::Deletion,
        EventKind::MuteList,
        EventKind::ChannelCreation,
        EventKind::ChannelUpdate,
        EventKind::ReadMarkMap,
    ];

    pub fn classify(event: &Event) -> Option<Self> {
        match event.kind {
            KIND_METADATA => Some(EventKind::Profile),
            KIND_CHANNEL_MESSAGE => Some(EventKind::PublicMessage),
            KIND_ENCRYPTED_DIRECT_MESSAGE => Some(EventKind::DirectMessage),
            KIND_CHANNEL_HIDE_MESSAGE => Some(EventKind::MessageHide),
            KIND_CHANNEL_MUTE_USER => Some(EventKind::UserMute),
            KIND_REACTION => Some(EventKind::Reaction),
            KIND_EVENT_DELETION => Some(EventKind::Deletion),
            KIND_MUTE_LIST => Some(EventKind::MuteList),
            KIND_CHANNEL_CREATION => Some(EventKind::ChannelCreation),
            KIND_CHANNEL_METADATA => Some(EventKind::ChannelUpdate),
            KIND_APP_DATA
                if find_tag_value(&event.tags, "d") == Some(READ_MARK_MAP_IDENTIFIER) =>
            {
                Some(EventKind::ReadMarkMap)
            }
            _ => None,
        }
    }

    pub fn kind_number(self) -> u16 {
        match self {
            EventKind::Profile => KIND_METADATA,
            EventKind::PublicMessage => KIND_CHANNEL_MESSAGE,
            EventKind::DirectMessage => KIND_ENCRYPTED_DIRECT_MESSAGE,
            EventKind::MessageHide => KIND_CHANNEL_HIDE_MESSAGE,
            EventKind::UserMute => KIND_CHANNEL_MUTE_USER,
            EventKind::Reaction => KIND_REACTION,
            EventKind::Deletion => KIND_EVENT_DELETION,
            EventKind::MuteList => KIND_MUTE_LIST,
            EventKind::ChannelCreation => KIND_CHANNEL_CREATION,
            EventKind::ChannelUpdate => KIND_CHANNEL_METADATA,
            EventKind::ReadMarkMap => KIND_APP_DATA,
        }
    }
}

pub struct ReconstructionPipeline {
    identity: Option<String>,
    synthetic: bool,
    cipher: Arc<dyn Cipher>,
}

impl ReconstructionPipeline {
    pub fn new(identity: Option<String>, synthetic: bool, cipher: Arc<dyn Cipher>) -> Self {
        Self {
            identity,
            synthetic,
            cipher,
        }
    }

    /// Rebuild one batch. Emits at most one `RavenEvent` per kind, in
    /// pipeline order. Batch variants are never empty; a mute list may be,
    /// when it was cleared.
    pub async fn reconstruct(&self, batch: &[Event]) -> Vec<RavenEvent> {
        let mut seen = HashSet::new();
        let mut grouped: HashMap<EventKind, Vec<&Event>> = HashMap::new();
        for event in batch {
            let Some(kind) = EventKind::classify(event) else {
                continue;
            };
            if seen.insert(event.id.as_str()) {
                grouped.entry(kind).or_default().push(event);
            }
        }

        let mut emitted = Vec::new();
        for kind in EventKind::PIPELINE_ORDER {
            let Some(events) = grouped.remove(&kind) else {
                continue;
            };
            let output = match kind {
                EventKind::Profile => {
                    non_empty(events.iter().map(|event| profile(event)).collect())
                        .map(RavenEvent::ProfileUpdate)
                }
                EventKind::PublicMessage => {
                    non_empty(events.iter().map(|event| public_message(event)).collect())
                        .map(RavenEvent::PublicMessage)
                }
                EventKind::DirectMessage => non_empty(self.direct_messages(&events).await)
                    .map(RavenEvent::DirectMessage),
                EventKind::MessageHide => {
                    non_empty(events.iter().filter_map(|event| message_hide(event)).collect())
                        .map(RavenEvent::ChannelMessageHide)
                }
                EventKind::UserMute => {
                    non_empty(events.iter().filter_map(|event| user_mute(event)).collect())
                        .map(RavenEvent::ChannelUserMute)
                }
                EventKind::Reaction => {
                    non_empty(events.iter().filter_map(|event| reaction(event)).collect())
                        .map(RavenEvent::Reaction)
                }
                EventKind::Deletion => {
                    non_empty(events.iter().flat_map(|event| deletions(event)).collect())
                        .map(RavenEvent::EventDeletion)
                }
                EventKind::MuteList => mute_list(&events).map(RavenEvent::MuteList),
                EventKind::ChannelCreation => {
                    non_empty(events.iter().map(|event| channel(event)).collect())
                        .map(RavenEvent::ChannelCreation)
                }
                EventKind::ChannelUpdate => {
                    non_empty(events.iter().filter_map(|event| channel_update(event)).collect())
                        .map(RavenEvent::ChannelUpdate)
                }
                EventKind::ReadMarkMap => read_mark_map(&events).map(RavenEvent::ReadMarkMap),
            };
            emitted.extend(output);
        }
        emitted
    }

    async fn direct_messages(&self, events: &[&Event]) -> Vec<DirectMessage> {
        let mut messages = Vec::with_capacity(events.len());
        for event in events {
            let Some(mut message) = direct_message(event, self.identity.as_deref()) else {
                continue;
            };
            if !self.synthetic && self.identity.is_some() {
                match self.cipher.decrypt(&message.peer, &message.content).await {
                    Ok(plaintext) => {
                        message.content = plaintext;
                        message.decrypted = true;
                    }
                    Err(error) => debug!("keeping {} encrypted: {}", message.id, error),
                }
            }
            messages.push(message);
        }
        messages
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

fn parse_json(content: &str) -> Value {
    serde_json::from_str(content).unwrap_or(Value::Null)
}

fn marked(event: &Event, marker: Marker) -> String {
    find_marked_reference(&event.tags, marker)
        .unwrap_or_default()
        .to_string()
}

fn first_tag(event: &Event, name: &str) -> Option<String> {
    find_tag_value(&event.tags, name).map(str::to_string)
}

pub(crate) fn profile(event: &Event) -> Profile {
    let content = parse_json(&event.content);
    Profile {
        id: event.id.clone(),
        creator: event.pubkey.clone(),
        created: event.created_at,
        name: string_field(&content, "name"),
        about: string_field(&content, "about"),
        picture: string_field(&content, "picture"),
        nip05: string_field(&content, "nip05"),
    }
}

fn public_message(event: &Event) -> PublicMessage {
    PublicMessage {
        id: event.id.clone(),
        root: marked(event, Marker::Root),
        reply: marked(event, Marker::Reply),
        content: event.content.clone(),
        creator: event.pubkey.clone(),
        mentions: unique_tag_values(&event.tags, "p"),
        created: event.created_at,
        decrypted: true,
    }
}

/// Undecrypted message. `None` without a recipient tag.
fn direct_message(event: &Event, identity: Option<&str>) -> Option<DirectMessage> {
    let recipient = first_tag(event, "p")?;
    let peer = if identity == Some(event.pubkey.as_str()) {
        recipient
    } else {
        event.pubkey.clone()
    };
    Some(DirectMessage {
        id: event.id.clone(),
        root: marked(event, Marker::Root),
        content: event.content.clone(),
        peer,
        creator: event.pubkey.clone(),
        mentions: unique_tag_values(&event.tags, "p"),
        created: event.created_at,
        decrypted: false,
    })
}

fn reason(event: &Event) -> String {
    string_field(&parse_json(&event.content), "reason")
}

fn message_hide(event: &Event) -> Option<ChannelMessageHide> {
    Some(ChannelMessageHide {
        id: first_tag(event, "e")?,
        reason: reason(event),
    })
}

fn user_mute(event: &Event) -> Option<ChannelUserMute> {
    Some(ChannelUserMute {
        pubkey: first_tag(event, "p")?,
        reason: reason(event),
    })
}

fn reaction(event: &Event) -> Option<Reaction> {
    let message = first_tag(event, "e")?;
    Some(Reaction {
        id: event.id.clone(),
        message,
        creator: event.pubkey.clone(),
        peer: first_tag(event, "p").unwrap_or_else(|| event.pubkey.clone()),
        content: event.content.clone(),
        created: event.created_at,
    })
}

fn deletions(event: &Event) -> Vec<EventDeletion> {
    unique_tag_values(&event.tags, "e")
        .into_iter()
        .map(|event_id| EventDeletion {
            event_id,
            reason: event.content.clone(),
        })
        .collect()
}

/// Pubkeys of every mute-list event in the batch, first seen first. An
/// event that clears the list still yields an (empty) list.
fn mute_list(events: &[&Event]) -> Option<MuteList> {
    let mut list = MuteList::default();
    let mut seen = HashSet::new();
    let mut push = |pubkey: &str, list: &mut MuteList| {
        if seen.insert(pubkey.to_string()) {
            list.pubkeys.push(pubkey.to_string());
        }
    };

    for event in events {
        for pubkey in unique_tag_values(&event.tags, "p") {
            push(&pubkey, &mut list);
        }
        if let Some(pubkeys) = parse_json(&event.content)
            .get("pubkeys")
            .and_then(Value::as_array)
        {
            for pubkey in pubkeys.iter().filter_map(Value::as_str) {
                push(pubkey, &mut list);
            }
        }
    }

    if let Some(newest) = events.iter().max_by_key(|event| event.created_at) {
        let content = newest.content.trim();
        if !content.is_empty() && serde_json::from_str::<Value>(content).is_err() {
            list.encrypted = content.to_string();
        }
    }

    (!events.is_empty()).then_some(list)
}

pub(crate) fn channel(event: &Event) -> Channel {
    let metadata = ChannelMetadata::from_content(&event.content);
    Channel {
        id: event.id.clone(),
        name: metadata.name,
        about: metadata.about,
        picture: metadata.picture,
        created: event.created_at,
        creator: event.pubkey.clone(),
    }
}

fn channel_update(event: &Event) -> Option<ChannelUpdate> {
    let channel_id = first_tag(event, "e")?;
    let metadata = ChannelMetadata::from_content(&event.content);
    Some(ChannelUpdate {
        id: event.id.clone(),
        channel_id,
        name: metadata.name,
        about: metadata.about,
        picture: metadata.picture,
        creator: event.pubkey.clone(),
        created: event.created_at,
    })
}

/// Newest parseable read-mark map in the batch.
fn read_mark_map(events: &[&Event]) -> Option<ReadMarkMap> {
    let mut newest: Option<(u64, ReadMarkMap)> = None;
    for event in events {
        let Ok(map) = serde_json::from_str::<ReadMarkMap>(&event.content) else {
            debug!("dropping malformed read-mark map {}", event.id);
            continue;
        };
        if newest
            .as_ref()
            .is_none_or(|(created, _)| event.created_at > *created)
        {
            newest = Some((event.created_at, map));
        }
    }
    newest.map(|(_, map)| map)
}
