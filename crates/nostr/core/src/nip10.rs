//! NIP-10: marked `e` tags.
//!
//! Chat messages point at their channel with a `root` marker and at the
//! message they answer with a `reply` marker:
//! `["e", <event-id>, <relay-url>, <marker>, <pubkey>?]`.

use crate::tag_parsing::{is_tag, tag_field};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marker {
    /// The root event of a thread (for chat messages: the channel).
    Root,
    /// The immediate parent being replied to.
    Reply,
    Mention,
}

impl Marker {
    pub fn as_str(self) -> &'static str {
        match self {
            Marker::Root => "root",
            Marker::Reply => "reply",
            Marker::Mention => "mention",
        }
    }
}

impl FromStr for Marker {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(Marker::Root),
            "reply" => Ok(Marker::Reply),
            "mention" => Ok(Marker::Mention),
            _ => Err(()),
        }
    }
}

/// An `e` tag reference to another event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReference {
    pub event_id: String,
    pub relay_url: Option<String>,
    pub marker: Option<Marker>,
    pub author_pubkey: Option<String>,
}

impl EventReference {
    pub fn new(event_id: impl Into<String>, marker: Option<Marker>) -> Self {
        Self {
            event_id: event_id.into(),
            relay_url: None,
            marker,
            author_pubkey: None,
        }
    }

    /// Parse an `e` tag. Returns `None` for other tags or a tag without an id.
    pub fn from_tag(tag: &[String]) -> Option<Self> {
        if !is_tag(tag, "e") {
            return None;
        }
        let event_id = tag_field(tag, 1)?.to_string();
        let non_empty = |index| tag_field(tag, index).filter(|value| !value.is_empty());

        Some(Self {
            event_id,
            relay_url: non_empty(2).map(str::to_string),
            marker: non_empty(3).and_then(|marker| marker.parse().ok()),
            author_pubkey: non_empty(4).map(str::to_string),
        })
    }

    pub fn to_tag(&self) -> Vec<String> {
        let mut tag = vec![
            "e".to_string(),
            self.event_id.clone(),
            self.relay_url.clone().unwrap_or_default(),
        ];

        if let Some(marker) = self.marker {
            tag.push(marker.as_str().to_string());
            if let Some(ref pubkey) = self.author_pubkey {
                tag.push(pubkey.clone());
            }
        }

        tag
    }
}

/// Id of the first `e` tag carrying `marker`.
///
/// Positional (unmarked) `e` tags are never consulted.
pub fn find_marked_reference(tags: &[Vec<String>], marker: Marker) -> Option<&str> {
    tags.iter()
        .filter(|tag| is_tag(tag, "e"))
        .find(|tag| tag_field(tag, 3) == Some(marker.as_str()))
        .and_then(|tag| tag_field(tag, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(raw: &[&[&str]]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|tag| tag.iter().map(|field| (*field).to_string()).collect())
            .collect()
    }

    #[test]
    fn find_marked_reference_cases() {
        struct Case {
            name: &'static str,
            tags: Vec<Vec<String>>,
            marker: Marker,
            expected: Option<&'static str>,
        }

        let cases = vec![
            Case {
                name: "root and reply",
                tags: tags(&[&["e", "c1", "", "root"], &["e", "m1", "", "reply"]]),
                marker: Marker::Reply,
                expected: Some("m1"),
            },
            Case {
                name: "root only",
                tags: tags(&[&["e", "c1", "", "root"]]),
                marker: Marker::Reply,
                expected: None,
            },
            Case {
                name: "positional tags ignored",
                tags: tags(&[&["e", "c1"], &["e", "m1"]]),
                marker: Marker::Root,
                expected: None,
            },
            Case {
                name: "first marked wins",
                tags: tags(&[&["e", "a", "", "root"], &["e", "b", "", "root"]]),
                marker: Marker::Root,
                expected: Some("a"),
            },
            Case {
                name: "p tag with marker ignored",
                tags: tags(&[&["p", "x", "", "root"]]),
                marker: Marker::Root,
                expected: None,
            },
        ];

        for case in cases {
            assert_eq!(
                find_marked_reference(&case.tags, case.marker),
                case.expected,
                "case {}",
                case.name
            );
        }
    }

    #[test]
    fn reference_tag_roundtrip() {
        let reference = EventReference::new("c1", Some(Marker::Root));
        let tag = reference.to_tag();
        assert_eq!(tag, vec!["e", "c1", "", "root"]);
        assert_eq!(EventReference::from_tag(&tag), Some(reference));
    }

    #[test]
    fn from_tag_rejects_non_e_tags() {
        assert_eq!(EventReference::from_tag(&["p".to_string(), "x".to_string()]), None);
        assert_eq!(EventReference::from_tag(&["e".to_string()]), None);
    }
}
