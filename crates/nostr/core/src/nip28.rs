//! NIP-28: public chat channels.
//!
//! Channels are created with a kind 40 event whose id becomes the channel
//! id. Metadata updates (41), messages (42) and moderation events (43, 44)
//! reference the channel or message through tags.

use crate::nip10::{EventReference, Marker};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const KIND_CHANNEL_CREATION: u16 = 40;
pub const KIND_CHANNEL_METADATA: u16 = 41;
pub const KIND_CHANNEL_MESSAGE: u16 = 42;
pub const KIND_CHANNEL_HIDE_MESSAGE: u16 = 43;
pub const KIND_CHANNEL_MUTE_USER: u16 = 44;

/// Channel metadata carried as JSON in kind 40 and kind 41 content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub name: String,
    pub about: String,
    pub picture: String,
}

impl ChannelMetadata {
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

    /// Lenient parse: malformed JSON or non-string fields read as `""`.
    pub fn from_content(content: &str) -> Self {
        let value = serde_json::from_str::<Value>(content).unwrap_or(Value::Null);
        Self {
            name: string_field(&value, "name"),
            about: string_field(&value, "about"),
            picture: string_field(&value, "picture"),
        }
    }

    pub fn to_content(&self) -> String {
        serde_json::json!({
            "name": self.name,
            "about": self.about,
            "picture": self.picture,
        })
        .to_string()
    }
}

/// String field of a JSON object, `""` when absent or not a string.
pub fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// `["e", <channel>, "", "root"]`
pub fn channel_root_tag(channel_id: &str) -> Vec<String> {
    EventReference::new(channel_id, Some(Marker::Root)).to_tag()
}

/// `["e", <message>, "", "reply"]`
pub fn reply_tag(message_id: &str) -> Vec<String> {
    EventReference::new(message_id, Some(Marker::Reply)).to_tag()
}

/// Address of a channel creation event, `40:<id>`.
pub fn channel_address(channel_id: &str) -> String {
    format!("{KIND_CHANNEL_CREATION}:{channel_id}")
}
