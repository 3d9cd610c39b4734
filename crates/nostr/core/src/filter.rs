//! NIP-01 subscription filters.
//!
//! A [`Filter`] serializes to the JSON object relays expect inside a `REQ`
//! message. Unset fields are omitted, so `Filter::new()` matches everything.

use crate::nip01::Event;
use crate::tag_parsing::{is_tag, tag_field};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(rename = "#e", default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<String>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<String>>,
    #[serde(rename = "#d", default, skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn kind(self, kind: u16) -> Self {
        self.kinds([kind])
    }

    /// `#e` tag values.
    pub fn events<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// `#p` tag values.
    pub fn pubkeys<I, S>(mut self, pubkeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pubkeys = Some(pubkeys.into_iter().map(Into::into).collect());
        self
    }

    /// `#d` tag values.
    pub fn identifiers<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identifiers = Some(identifiers.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Local evaluation of the filter. `limit` is a relay-side concern and
    /// is ignored here.
    pub fn matches(&self, event: &Event) -> bool {
        fn contains(set: Option<&Vec<String>>, value: &str) -> bool {
            set.is_none_or(|set| set.iter().any(|candidate| candidate == value))
        }

        fn tag_matches(set: Option<&Vec<String>>, event: &Event, name: &str) -> bool {
            set.is_none_or(|set| {
                event.tags.iter().any(|tag| {
                    is_tag(tag, name)
                        && tag_field(tag, 1).is_some_and(|value| set.iter().any(|v| v == value))
                })
            })
        }

        contains(self.ids.as_ref(), &event.id)
            && contains(self.authors.as_ref(), &event.pubkey)
            && self
                .kinds
                .as_ref()
                .is_none_or(|kinds| kinds.contains(&event.kind))
            && tag_matches(self.events.as_ref(), event, "e")
            && tag_matches(self.pubkeys.as_ref(), event, "p")
            && tag_matches(self.identifiers.as_ref(), event, "d")
            && self.since.is_none_or(|since| event.created_at >= since)
            && self.until.is_none_or(|until| event.created_at <= until)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }
}
