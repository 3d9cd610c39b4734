//! Signing and broadcasting new events.
//!
//! Every operation checks the publishing capability before any I/O, signs
//! through the [`Signer`], requires at least one write relay to accept, and
//! then emits the resulting domain object on the engine's event channel.

use std::sync::Arc;

use nostr::nip28::{channel_address, channel_root_tag, reply_tag};
use nostr::{
    ChannelMetadata, Event, EventReference, EventTemplate, KIND_APP_DATA, KIND_CHANNEL_CREATION,
    KIND_CHANNEL_HIDE_MESSAGE, KIND_CHANNEL_MESSAGE, KIND_CHANNEL_METADATA,
    KIND_CHANNEL_MUTE_USER, KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_EVENT_DELETION, KIND_METADATA,
    KIND_MUTE_LIST, KIND_REACTION, KIND_RECOMMEND_RELAY, Marker, READ_MARK_MAP_IDENTIFIER,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{RavenError, Result};
use crate::model::{
    Channel, ChannelMessageHide, ChannelUpdate, ChannelUserMute, DirectMessage, EventDeletion,
    Metadata, MuteList, Profile, PublicMessage, RavenEvent, Reaction, ReadMarkMap,
};
use crate::relay_set::{RelayRole, RelaySetResolver};
use crate::signer::{Cipher, Signer};
use crate::transport::RelayTransport;

#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn RelayTransport>,
    resolver: Arc<RelaySetResolver>,
    signer: Arc<dyn Signer>,
    cipher: Arc<dyn Cipher>,
    events: broadcast::Sender<RavenEvent>,
}

fn tag(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|field| (*field).to_string()).collect()
}

fn reason_content(reason: &str) -> String {
    serde_json::json!({ "reason": reason }).to_string()
}

fn unique(values: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        if !unique.contains(value) {
            unique.push(value.clone());
        }
    }
    unique
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        resolver: Arc<RelaySetResolver>,
        signer: Arc<dyn Signer>,
        cipher: Arc<dyn Cipher>,
        events: broadcast::Sender<RavenEvent>,
    ) -> Self {
        Self {
            transport,
            resolver,
            signer,
            cipher,
            events,
        }
    }

    /// A real key is available to sign with.
    pub fn can_publish(&self) -> bool {
        !self.signer.is_synthetic() && self.signer.identity().is_some()
    }

    fn ensure_can_publish(&self) -> Result<()> {
        if self.can_publish() {
            Ok(())
        } else {
            Err(RavenError::CannotPublish)
        }
    }

    fn emit(&self, event: RavenEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    async fn publish(&self, template: EventTemplate) -> Result<Event> {
        self.ensure_can_publish()?;
        let write = self
            .resolver
            .resolve(RelayRole::Write, self.transport.as_ref())
            .await
            .ok_or(RavenError::NoWriteRelays)?;

        let event = self.signer.sign(template).await?;
        let confirmations = self.transport.publish(&write.urls, &event).await;
        let accepted = confirmations.iter().filter(|c| c.accepted).count();
        if accepted == 0 {
            let reasons = confirmations
                .iter()
                .map(|c| format!("{}: {}", c.relay_url, c.message))
                .collect::<Vec<_>>()
                .join("; ");
            warn!("kind {} event {} rejected everywhere", event.kind, event.id);
            return Err(RavenError::PublishRejected(reasons));
        }

        debug!(
            "published kind {} event {} to {}/{} relays",
            event.kind,
            event.id,
            accepted,
            confirmations.len()
        );
        Ok(event)
    }

    pub async fn send_public_message(
        &self,
        channel_id: &str,
        content: &str,
        mentions: &[String],
        reply_to: Option<&str>,
    ) -> Result<PublicMessage> {
        self.ensure_can_publish()?;
        if channel_id.is_empty() {
            return Err(RavenError::InvalidInput("channel id is empty".to_string()));
        }

        let mentions = unique(mentions);
        let mut tags = vec![channel_root_tag(channel_id)];
        if let Some(reply_to) = reply_to {
            tags.push(reply_tag(reply_to));
        }
        tags.extend(mentions.iter().map(|pubkey| tag(&["p", pubkey.as_str()])));

        let event = self
            .publish(EventTemplate::now(KIND_CHANNEL_MESSAGE, tags, content))
            .await?;
        let message = PublicMessage {
            id: event.id,
            root: channel_id.to_string(),
            reply: reply_to.unwrap_or_default().to_string(),
            content: event.content,
            creator: event.pubkey,
            mentions,
            created: event.created_at,
            decrypted: true,
        };
        self.emit(RavenEvent::PublicMessage(vec![message.clone()]));
        Ok(message)
    }

    /// Encrypt `content` for `peer` and send it. The echo carries the
    /// plaintext.
    pub async fn send_direct_message(
        &self,
        peer: &str,
        content: &str,
        root: Option<&str>,
    ) -> Result<DirectMessage> {
        self.ensure_can_publish()?;
        let ciphertext = self.cipher.encrypt(peer, content).await?;

        let mut tags = vec![tag(&["p", peer])];
        if let Some(root) = root {
            tags.push(EventReference::new(root, Some(Marker::Root)).to_tag());
        }

        let event = self
            .publish(EventTemplate::now(
                KIND_ENCRYPTED_DIRECT_MESSAGE,
                tags,
                ciphertext,
            ))
            .await?;
        let message = DirectMessage {
            id: event.id,
            root: root.unwrap_or_default().to_string(),
            content: content.to_string(),
            peer: peer.to_string(),
            creator: event.pubkey,
            mentions: vec![peer.to_string()],
            created: event.created_at,
            decrypted: true,
        };
        self.emit(RavenEvent::DirectMessage(vec![message.clone()]));
        Ok(message)
    }

    pub async fn create_channel(&self, metadata: Metadata) -> Result<Channel> {
        let content =
            ChannelMetadata::new(&metadata.name, &metadata.about, &metadata.picture).to_content();
        let event = self
            .publish(EventTemplate::now(KIND_CHANNEL_CREATION, vec![], content))
            .await?;
        let channel = Channel {
            id: event.id,
            name: metadata.name,
            about: metadata.about,
            picture: metadata.picture,
            created: event.created_at,
            creator: event.pubkey,
        };
        self.emit(RavenEvent::ChannelCreation(vec![channel.clone()]));
        Ok(channel)
    }

    pub async fn update_channel(&self, channel: &Channel, metadata: Metadata) -> Result<ChannelUpdate> {
        let content =
            ChannelMetadata::new(&metadata.name, &metadata.about, &metadata.picture).to_content();
        let tags = vec![
            channel_root_tag(&channel.id),
            tag(&["a", channel_address(&channel.id).as_str()]),
        ];
        let event = self
            .publish(EventTemplate::now(KIND_CHANNEL_METADATA, tags, content))
            .await?;
        let update = ChannelUpdate {
            id: event.id,
            channel_id: channel.id.clone(),
            name: metadata.name,
            about: metadata.about,
            picture: metadata.picture,
            creator: event.pubkey,
            created: event.created_at,
        };
        self.emit(RavenEvent::ChannelUpdate(vec![update.clone()]));
        Ok(update)
    }

    pub async fn send_reaction(
        &self,
        message_id: &str,
        message_author: &str,
        content: &str,
    ) -> Result<Reaction> {
        let tags = vec![tag(&["e", message_id]), tag(&["p", message_author])];
        let event = self
            .publish(EventTemplate::now(KIND_REACTION, tags, content))
            .await?;
        let reaction = Reaction {
            id: event.id,
            message: message_id.to_string(),
            creator: event.pubkey,
            peer: message_author.to_string(),
            content: event.content,
            created: event.created_at,
        };
        self.emit(RavenEvent::Reaction(vec![reaction.clone()]));
        Ok(reaction)
    }

    pub async fn delete_events(&self, event_ids: &[String], reason: &str) -> Result<Vec<EventDeletion>> {
        self.ensure_can_publish()?;
        let event_ids = unique(event_ids);
        if event_ids.is_empty() {
            return Err(RavenError::InvalidInput("nothing to delete".to_string()));
        }

        let tags = event_ids.iter().map(|id| tag(&["e", id.as_str()])).collect();
        self.publish(EventTemplate::now(KIND_EVENT_DELETION, tags, reason))
            .await?;
        let deletions: Vec<EventDeletion> = event_ids
            .into_iter()
            .map(|event_id| EventDeletion {
                event_id,
                reason: reason.to_string(),
            })
            .collect();
        self.emit(RavenEvent::EventDeletion(deletions.clone()));
        Ok(deletions)
    }

    pub async fn hide_channel_message(&self, message_id: &str, reason: &str) -> Result<ChannelMessageHide> {
        let tags = vec![tag(&["e", message_id])];
        self.publish(EventTemplate::now(
            KIND_CHANNEL_HIDE_MESSAGE,
            tags,
            reason_content(reason),
        ))
        .await?;
        let hide = ChannelMessageHide {
            id: message_id.to_string(),
            reason: reason.to_string(),
        };
        self.emit(RavenEvent::ChannelMessageHide(vec![hide.clone()]));
        Ok(hide)
    }

    pub async fn mute_channel_user(&self, pubkey: &str, reason: &str) -> Result<ChannelUserMute> {
        let tags = vec![tag(&["p", pubkey])];
        self.publish(EventTemplate::now(
            KIND_CHANNEL_MUTE_USER,
            tags,
            reason_content(reason),
        ))
        .await?;
        let mute = ChannelUserMute {
            pubkey: pubkey.to_string(),
            reason: reason.to_string(),
        };
        self.emit(RavenEvent::ChannelUserMute(vec![mute.clone()]));
        Ok(mute)
    }

    /// Replace the whole mute list with `pubkeys`.
    pub async fn update_mute_list(&self, pubkeys: &[String]) -> Result<MuteList> {
        let pubkeys = unique(pubkeys);
        let tags = pubkeys.iter().map(|pubkey| tag(&["p", pubkey.as_str()])).collect();
        self.publish(EventTemplate::now(KIND_MUTE_LIST, tags, ""))
            .await?;
        let list = MuteList {
            pubkeys,
            encrypted: String::new(),
        };
        self.emit(RavenEvent::MuteList(list.clone()));
        Ok(list)
    }

    /// Publishes a kind 2 recommendation. Nothing is echoed.
    pub async fn recommend_relay(&self, url: &str) -> Result<Event> {
        self.publish(EventTemplate::now(
            KIND_RECOMMEND_RELAY,
            vec![tag(&["r", url])],
            "",
        ))
        .await
    }

    pub async fn update_profile(&self, metadata: Metadata) -> Result<Profile> {
        let content = serde_json::to_string(&metadata)?;
        let event = self
            .publish(EventTemplate::now(KIND_METADATA, vec![], content))
            .await?;
        let profile = Profile {
            id: event.id,
            creator: event.pubkey,
            created: event.created_at,
            name: metadata.name,
            about: metadata.about,
            picture: metadata.picture,
            nip05: String::new(),
        };
        self.emit(RavenEvent::ProfileUpdate(vec![profile.clone()]));
        Ok(profile)
    }

    pub async fn update_read_mark_map(&self, map: ReadMarkMap) -> Result<ReadMarkMap> {
        let content = serde_json::to_string(&map)?;
        let tags = vec![tag(&["d", READ_MARK_MAP_IDENTIFIER])];
        self.publish(EventTemplate::now(KIND_APP_DATA, tags, content))
            .await?;
        self.emit(RavenEvent::ReadMarkMap(map.clone()));
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayEntry;
    use crate::signer::{KeySigner, NoSigner, PassthroughCipher};
    use crate::transport::memory::MemoryTransport;
    use nostr::find_marked_reference;

    const RELAY: &str = "wss://relay.example";

    struct Fixture {
        publisher: Publisher,
        transport: Arc<MemoryTransport>,
        events: broadcast::Receiver<RavenEvent>,
    }

    async fn fixture(signer: Arc<dyn Signer>) -> Fixture {
        let transport = Arc::new(MemoryTransport::new());
        transport.add_connected_relay(RELAY).await;
        let (sender, events) = broadcast::channel(16);
        let publisher = Publisher::new(
            transport.clone(),
            Arc::new(RelaySetResolver::new(&[RelayEntry::read_write(RELAY)])),
            signer,
            Arc::new(PassthroughCipher),
            sender,
        );
        Fixture {
            publisher,
            transport,
            events,
        }
    }

    fn key_signer() -> std::result::Result<Arc<dyn Signer>, crate::signer::SignerError> {
        Ok(Arc::new(KeySigner::from_bytes([7u8; 32])?))
    }

    #[tokio::test]
    async fn synthetic_identity_fails_before_io() {
        let fixture = fixture(Arc::new(NoSigner::watching("ab".repeat(32)))).await;
        assert!(!fixture.publisher.can_publish());

        let results = [
            fixture
                .publisher
                .send_public_message("chan", "hi", &[], None)
                .await
                .err(),
            fixture.publisher.send_direct_message("peer", "hi", None).await.err(),
            fixture.publisher.create_channel(Metadata::default()).await.err(),
            fixture.publisher.delete_events(&[], "").await.err(),
            fixture.publisher.recommend_relay(RELAY).await.err(),
        ];
        for result in results {
            assert!(matches!(result, Some(RavenError::CannotPublish)));
        }
        assert_eq!(fixture.transport.publish_calls().await, 0);
    }

    #[tokio::test]
    async fn public_message_tags_and_echo() -> Result<()> {
        let mut fixture = fixture(key_signer()?).await;
        let message = fixture
            .publisher
            .send_public_message(
                "chan1",
                "hello",
                &["alice".to_string(), "alice".to_string()],
                Some("msg5"),
            )
            .await?;

        assert_eq!(message.root, "chan1");
        assert_eq!(message.reply, "msg5");
        assert_eq!(message.mentions, vec!["alice"]);

        let stored = fixture.transport.stored(RELAY).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(find_marked_reference(&stored[0].tags, Marker::Root), Some("chan1"));
        assert_eq!(find_marked_reference(&stored[0].tags, Marker::Reply), Some("msg5"));

        let echoed = fixture.events.try_recv().map_err(|e| RavenError::InvalidInput(e.to_string()))?;
        assert_eq!(echoed, RavenEvent::PublicMessage(vec![message]));
        Ok(())
    }

    #[tokio::test]
    async fn no_connected_write_relay() -> Result<()> {
        let fixture = fixture(key_signer()?).await;
        fixture.transport.shutdown().await;
        let result = fixture.publisher.create_channel(Metadata::new("a", "", "")).await;
        assert!(matches!(result, Err(RavenError::NoWriteRelays)));
        Ok(())
    }

    #[tokio::test]
    async fn rejection_everywhere_is_an_error_without_echo() -> Result<()> {
        let mut fixture = fixture(key_signer()?).await;
        fixture.transport.reject_publishes(RELAY, "blocked: spam").await;

        let result = fixture.publisher.send_reaction("m1", "alice", "+").await;
        match result {
            Err(RavenError::PublishRejected(reason)) => assert!(reason.contains("blocked: spam")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(fixture.events.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn deleting_nothing_is_invalid() -> Result<()> {
        let fixture = fixture(key_signer()?).await;
        let result = fixture.publisher.delete_events(&[], "").await;
        assert!(matches!(result, Err(RavenError::InvalidInput(_))));
        assert_eq!(fixture.transport.publish_calls().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn moderation_content_is_json() -> Result<()> {
        let fixture = fixture(key_signer()?).await;
        fixture.publisher.hide_channel_message("m1", "spam").await?;
        fixture.publisher.mute_channel_user("bob", "rude").await?;

        let stored = fixture.transport.stored(RELAY).await;
        for event in &stored {
            let content: serde_json::Value = serde_json::from_str(&event.content)?;
            assert!(content["reason"].is_string());
        }
        assert_eq!(stored[0].kind, KIND_CHANNEL_HIDE_MESSAGE);
        assert_eq!(stored[1].kind, KIND_CHANNEL_MUTE_USER);
        assert_eq!(stored[1].tags, vec![vec!["p".to_string(), "bob".to_string()]]);
        Ok(())
    }

    #[tokio::test]
    async fn channel_update_references_channel() -> Result<()> {
        let fixture = fixture(key_signer()?).await;
        let channel = fixture.publisher.create_channel(Metadata::new("rust", "", "")).await?;
        let update = fixture
            .publisher
            .update_channel(&channel, Metadata::new("rust-lang", "about", ""))
            .await?;

        assert_eq!(update.channel_id, channel.id);
        let stored = fixture.transport.stored(RELAY).await;
        let address = format!("40:{}", channel.id);
        assert!(stored[1].tags.iter().any(|tag| tag == &vec!["a".to_string(), address.clone()]));
        Ok(())
    }
}
