//! Read and write relay sets.

use crate::config::RelayEntry;
use crate::transport::RelayTransport;

/// Public relays used for reads when none are configured.
pub const BOOTSTRAP_RELAYS: [&str; 5] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://relay.nostr.wine",
    "wss://relay.mostr.pub",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayRole {
    Read,
    Write,
}

/// Connected relays serving one role. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySet {
    pub role: RelayRole,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RelaySetResolver {
    read: Vec<String>,
    write: Vec<String>,
}

impl RelaySetResolver {
    pub fn new(relays: &[RelayEntry]) -> Self {
        let mut read = Vec::new();
        let mut write = Vec::new();
        for entry in relays {
            if entry.read {
                push_unique(&mut read, &entry.url);
            }
            if entry.write {
                push_unique(&mut write, &entry.url);
            }
        }

        if read.is_empty() {
            for url in BOOTSTRAP_RELAYS {
                push_unique(&mut read, url);
                push_unique(&mut write, url);
            }
        }

        Self { read, write }
    }

    /// Relays configured for `role`, connected or not.
    pub fn configured(&self, role: RelayRole) -> &[String] {
        match role {
            RelayRole::Read => &self.read,
            RelayRole::Write => &self.write,
        }
    }

    /// Every configured relay across both roles, once each.
    pub fn all_configured(&self) -> Vec<String> {
        let mut all = self.read.clone();
        for url in &self.write {
            push_unique(&mut all, url);
        }
        all
    }

    /// Configured relays for `role` that currently have a live connection.
    /// `None` when there are none.
    pub async fn resolve(&self, role: RelayRole, transport: &dyn RelayTransport) -> Option<RelaySet> {
        let connected = transport.connected_relays().await;
        let urls: Vec<String> = self
            .configured(role)
            .iter()
            .filter(|url| connected.contains(url))
            .cloned()
            .collect();
        (!urls.is_empty()).then_some(RelaySet { role, urls })
    }
}

fn push_unique(urls: &mut Vec<String>, url: &str) {
    if !urls.iter().any(|existing| existing == url) {
        urls.push(url.to_string());
    }
}
