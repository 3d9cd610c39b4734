//! The [`Raven`] facade: one value wiring relays, intake, reconstruction and
//! publishing together.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use nostr::tag_parsing::{collect_tag_values, find_tag_value};
use nostr::{
    Event, Filter, KIND_CHANNEL_CREATION, KIND_CHANNEL_MESSAGE, KIND_CHANNEL_METADATA,
    KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_EVENT_DELETION, KIND_METADATA, Marker,
    find_marked_reference,
};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::RavenConfig;
use crate::error::Result;
use crate::fetch::{FetchEngine, FetchStrategy};
use crate::intake::IntakeBuffer;
use crate::model::{
    Channel, ChannelMessageHide, ChannelUpdate, ChannelUserMute, DirectMessage, EventDeletion,
    Metadata, MuteList, Profile, PublicMessage, RavenEvent, Reaction, ReadMarkMap,
};
use crate::publisher::Publisher;
use crate::reconstruct::{self, ReconstructionPipeline};
use crate::relay_set::RelaySetResolver;
use crate::signer::{Cipher, Signer};
use crate::subscriptions::SubscriptionManager;
use crate::transport::{ConnectReport, RelayTransport};

/// Filters fetched together per round of the per-channel sync.
const CHANNEL_FILTER_GROUP: usize = 6;

pub struct Raven {
    config: RavenConfig,
    identity: Option<String>,
    transport: Arc<dyn RelayTransport>,
    resolver: Arc<RelaySetResolver>,
    fetcher: FetchEngine,
    intake: Arc<IntakeBuffer>,
    subscriptions: SubscriptionManager,
    publisher: Publisher,
    events: broadcast::Sender<RavenEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Raven {
    /// Wire the engine and start its reconstruction worker. Must be called
    /// from within a tokio runtime.
    pub fn new(
        config: RavenConfig,
        transport: Arc<dyn RelayTransport>,
        signer: Arc<dyn Signer>,
        cipher: Arc<dyn Cipher>,
    ) -> Self {
        let identity = signer.identity();
        let resolver = Arc::new(RelaySetResolver::new(&config.relays));
        let fetcher = FetchEngine::new(
            Arc::clone(&transport),
            Arc::clone(&resolver),
            config.fetch_timeout,
            FetchStrategy::from_concurrency(config.fetch_concurrency),
        );
        let intake = Arc::new(IntakeBuffer::new(config.batch_delay, config.max_batch_size));
        let pipeline = Arc::new(ReconstructionPipeline::new(
            identity.clone(),
            signer.is_synthetic(),
            Arc::clone(&cipher),
        ));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let subscriptions = SubscriptionManager::new(
            Arc::clone(&transport),
            Arc::clone(&resolver),
            Arc::clone(&intake),
            identity.clone(),
            config.filter_chunk_size,
            config.messages_per_page,
        );
        let publisher = Publisher::new(
            Arc::clone(&transport),
            Arc::clone(&resolver),
            signer,
            cipher,
            events.clone(),
        );
        let worker = Arc::clone(&intake).spawn_worker(pipeline, events.clone());

        Self {
            config,
            identity,
            transport,
            resolver,
            fetcher,
            intake,
            subscriptions,
            publisher,
            events,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// A new receiver of every batch emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<RavenEvent> {
        self.events.subscribe()
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn can_publish(&self) -> bool {
        self.publisher.can_publish()
    }

    pub fn config(&self) -> &RavenConfig {
        &self.config
    }

    fn emit(&self, event: RavenEvent) {
        let _ = self.events.send(event);
    }

    /// Connect every configured relay. Relays that fail are reported, the
    /// rest stay usable.
    pub async fn connect(&self) -> ConnectReport {
        let urls = self.resolver.all_configured();
        let report = self
            .transport
            .connect(&urls, self.config.connect_timeout)
            .await;
        for (url, reason) in &report.failed {
            debug!("could not connect {}: {}", url, reason);
        }
        info!(
            "connected {} of {} relays",
            report.connected.len(),
            urls.len()
        );
        report
    }

    /// Initial sync: own events, incoming direct messages, then every known
    /// channel. Emits `Ready`, `DmsDone` and `SyncDone` along the way.
    pub async fn init(&self) {
        let Some(me) = self.identity.clone() else {
            info!("no identity, skipping initial sync");
            self.emit(RavenEvent::Ready);
            self.emit(RavenEvent::DmsDone);
            self.emit(RavenEvent::SyncDone);
            return;
        };

        let own = self
            .fetcher
            .fetch(vec![Filter::new().authors([me.clone()])], None)
            .await;
        let deleted = deleted_ids(&own);
        let mut channel_ids = referenced_channels(&own);
        self.intake
            .extend(
                own.iter()
                    .filter(|event| event.kind != KIND_CHANNEL_MESSAGE)
                    .cloned(),
            )
            .await;
        debug!("fetched {} own events", own.len());
        self.emit(RavenEvent::Ready);

        let dms = self
            .fetcher
            .fetch(
                vec![
                    Filter::new()
                        .kind(KIND_ENCRYPTED_DIRECT_MESSAGE)
                        .pubkeys([me]),
                ],
                None,
            )
            .await;
        debug!("fetched {} direct messages", dms.len());
        self.intake.extend(dms).await;
        self.emit(RavenEvent::DmsDone);

        channel_ids.retain(|id| !deleted.contains(id));
        for id in &self.config.default_channels {
            if !channel_ids.contains(id) {
                channel_ids.push(id.clone());
            }
        }
        self.sync_channels(&channel_ids).await;
        info!("initial sync finished for {} channels", channel_ids.len());
        self.emit(RavenEvent::SyncDone);
    }

    async fn sync_channels(&self, channel_ids: &[String]) {
        if channel_ids.is_empty() {
            return;
        }

        let creations: Vec<Filter> = channel_ids
            .chunks(self.config.filter_chunk_size.max(1))
            .map(|chunk| {
                Filter::new()
                    .kind(KIND_CHANNEL_CREATION)
                    .ids(chunk.iter().cloned())
            })
            .collect();
        let created = self.fetcher.fetch(creations, None).await;
        self.intake.extend(created).await;

        let filters: Vec<Filter> = channel_ids
            .iter()
            .flat_map(|id| {
                [
                    Filter::new()
                        .kinds([KIND_CHANNEL_METADATA, KIND_EVENT_DELETION])
                        .events([id.clone()]),
                    Filter::new()
                        .kind(KIND_CHANNEL_MESSAGE)
                        .events([id.clone()])
                        .limit(self.config.messages_per_page),
                ]
            })
            .collect();
        let rounds = filters
            .chunks(CHANNEL_FILTER_GROUP)
            .map(|group| self.fetcher.fetch(group.to_vec(), None));
        for events in join_all(rounds).await {
            self.intake.extend(events).await;
        }
    }

    /// One-shot query outside any subscription. Results are returned, not
    /// reconstructed.
    pub async fn fetch_events(&self, filters: Vec<Filter>, limit: Option<Duration>) -> Vec<Event> {
        self.fetcher.fetch(filters, limit).await
    }

    /// The page of messages in `channel_id` older than `until`. They are also
    /// staged for reconstruction.
    pub async fn fetch_prev_messages(&self, channel_id: &str, until: u64) -> Vec<Event> {
        let filter = Filter::new()
            .kind(KIND_CHANNEL_MESSAGE)
            .events([channel_id.to_string()])
            .until(until)
            .limit(self.config.messages_per_page);
        let events = self.fetcher.fetch(vec![filter], None).await;
        self.intake.extend(events.iter().cloned()).await;
        events
    }

    /// A channel with the metadata of its newest update applied.
    pub async fn fetch_channel(&self, channel_id: &str) -> Option<Channel> {
        let events = self
            .fetcher
            .fetch(
                vec![
                    Filter::new()
                        .kind(KIND_CHANNEL_CREATION)
                        .ids([channel_id.to_string()]),
                    Filter::new()
                        .kind(KIND_CHANNEL_METADATA)
                        .events([channel_id.to_string()]),
                ],
                None,
            )
            .await;

        let creation = events
            .iter()
            .find(|event| event.kind == KIND_CHANNEL_CREATION && event.id == channel_id)?;
        let mut channel = reconstruct::channel(creation);
        let newest_update = events
            .iter()
            .filter(|event| event.kind == KIND_CHANNEL_METADATA)
            .max_by_key(|event| event.created_at);
        if let Some(update) = newest_update {
            let metadata = reconstruct::channel(update);
            channel.name = metadata.name;
            channel.about = metadata.about;
            channel.picture = metadata.picture;
        }
        Some(channel)
    }

    /// Latest profile of each pubkey. Emits one `ProfileUpdate` when any was
    /// found.
    pub async fn load_profiles(&self, pubkeys: &[String]) -> Vec<Profile> {
        let mut unique = Vec::new();
        for pubkey in pubkeys {
            if !unique.contains(pubkey) {
                unique.push(pubkey.clone());
            }
        }
        if unique.is_empty() {
            return Vec::new();
        }

        let filters = unique
            .chunks(self.config.filter_chunk_size.max(1))
            .map(|chunk| Filter::new().kind(KIND_METADATA).authors(chunk.iter().cloned()))
            .collect();
        let events = self.fetcher.fetch(filters, None).await;

        let mut newest: HashMap<&str, &Event> = HashMap::new();
        for event in &events {
            let slot = newest.entry(event.pubkey.as_str()).or_insert(event);
            if event.created_at > slot.created_at {
                *slot = event;
            }
        }
        let profiles: Vec<Profile> = unique
            .iter()
            .filter_map(|pubkey| newest.get(pubkey.as_str()))
            .map(|event| reconstruct::profile(event))
            .collect();

        if !profiles.is_empty() {
            self.emit(RavenEvent::ProfileUpdate(profiles.clone()));
        }
        profiles
    }

    pub async fn fetch_profile(&self, pubkey: &str) -> Option<Profile> {
        let filter = Filter::new()
            .kind(KIND_METADATA)
            .authors([pubkey.to_string()]);
        self.fetcher
            .fetch(vec![filter], Some(self.config.profile_timeout))
            .await
            .iter()
            .max_by_key(|event| event.created_at)
            .map(reconstruct::profile)
    }

    pub async fn start_inbox(&self) -> bool {
        self.subscriptions.start_inbox().await
    }

    pub async fn listen_channels(&self, channel_ids: &[String], since: u64) -> bool {
        self.subscriptions.listen_channels(channel_ids, since).await
    }

    pub async fn listen_messages(&self, message_ids: &[String], reference_ids: &[String]) -> bool {
        self.subscriptions
            .listen_messages(message_ids, reference_ids)
            .await
    }

    pub async fn load_channel(&self, channel_id: &str) -> bool {
        self.subscriptions.load_channel(channel_id).await
    }

    pub async fn stop_subscription(&self, name: &str) -> bool {
        self.subscriptions.stop(name).await
    }

    pub async fn active_subscriptions(&self) -> Vec<String> {
        self.subscriptions.active().await
    }

    pub async fn send_public_message(
        &self,
        channel_id: &str,
        content: &str,
        mentions: &[String],
        reply_to: Option<&str>,
    ) -> Result<PublicMessage> {
        self.publisher
            .send_public_message(channel_id, content, mentions, reply_to)
            .await
    }

    pub async fn send_direct_message(
        &self,
        peer: &str,
        content: &str,
        root: Option<&str>,
    ) -> Result<DirectMessage> {
        self.publisher.send_direct_message(peer, content, root).await
    }

    pub async fn create_channel(&self, metadata: Metadata) -> Result<Channel> {
        self.publisher.create_channel(metadata).await
    }

    pub async fn update_channel(&self, channel: &Channel, metadata: Metadata) -> Result<ChannelUpdate> {
        self.publisher.update_channel(channel, metadata).await
    }

    pub async fn send_reaction(&self, message_id: &str, author: &str, content: &str) -> Result<Reaction> {
        self.publisher
            .send_reaction(message_id, author, content)
            .await
    }

    pub async fn delete_events(&self, event_ids: &[String], reason: &str) -> Result<Vec<EventDeletion>> {
        self.publisher.delete_events(event_ids, reason).await
    }

    pub async fn hide_channel_message(&self, message_id: &str, reason: &str) -> Result<ChannelMessageHide> {
        self.publisher.hide_channel_message(message_id, reason).await
    }

    pub async fn mute_channel_user(&self, pubkey: &str, reason: &str) -> Result<ChannelUserMute> {
        self.publisher.mute_channel_user(pubkey, reason).await
    }

    pub async fn update_mute_list(&self, pubkeys: &[String]) -> Result<MuteList> {
        self.publisher.update_mute_list(pubkeys).await
    }

    pub async fn recommend_relay(&self, url: &str) -> Result<Event> {
        self.publisher.recommend_relay(url).await
    }

    pub async fn update_profile(&self, metadata: Metadata) -> Result<Profile> {
        self.publisher.update_profile(metadata).await
    }

    pub async fn update_read_mark_map(&self, map: ReadMarkMap) -> Result<ReadMarkMap> {
        self.publisher.update_read_mark_map(map).await
    }

    /// Stop every subscription and the reconstruction worker, then close the
    /// transport. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.subscriptions.stop_all().await;
        if let Some(worker) = self.worker.lock().await.take() {
            worker.abort();
        }
        self.transport.shutdown().await;
        info!("raven shut down");
    }
}

/// Ids the identity has asked to delete.
fn deleted_ids(own: &[Event]) -> HashSet<String> {
    own.iter()
        .filter(|event| event.kind == KIND_EVENT_DELETION)
        .flat_map(|event| collect_tag_values(&event.tags, "e"))
        .collect()
}

/// Channels the identity created or posted in, in first-seen order.
fn referenced_channels(own: &[Event]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for event in own {
        let id = match event.kind {
            KIND_CHANNEL_CREATION => Some(event.id.as_str()),
            KIND_CHANNEL_MESSAGE => find_marked_reference(&event.tags, Marker::Root)
                .or_else(|| find_tag_value(&event.tags, "e")),
            _ => None,
        };
        match id {
            Some(id) if !ids.iter().any(|known| known == id) => ids.push(id.to_string()),
            _ => {}
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, kind: u16, tags: &[&[&str]]) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "aa".repeat(32),
            created_at: 1,
            kind,
            tags: tags
                .iter()
                .map(|tag| tag.iter().map(|part| (*part).to_string()).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn channels_come_from_creations_and_messages() {
        struct Case {
            name: &'static str,
            events: Vec<Event>,
            expected: Vec<&'static str>,
        }

        let cases = vec![
            Case {
                name: "creation",
                events: vec![event("c1", KIND_CHANNEL_CREATION, &[])],
                expected: vec!["c1"],
            },
            Case {
                name: "root marker wins over position",
                events: vec![event(
                    "m1",
                    KIND_CHANNEL_MESSAGE,
                    &[&["e", "parent", "", "reply"], &["e", "c2", "", "root"]],
                )],
                expected: vec!["c2"],
            },
            Case {
                name: "first e tag without markers",
                events: vec![event("m1", KIND_CHANNEL_MESSAGE, &[&["e", "c3"], &["e", "x"]])],
                expected: vec!["c3"],
            },
            Case {
                name: "duplicates collapse",
                events: vec![
                    event("c1", KIND_CHANNEL_CREATION, &[]),
                    event("m1", KIND_CHANNEL_MESSAGE, &[&["e", "c1", "", "root"]]),
                ],
                expected: vec!["c1"],
            },
            Case {
                name: "other kinds ignored",
                events: vec![event("d1", KIND_EVENT_DELETION, &[&["e", "c1"]])],
                expected: vec![],
            },
        ];

        for case in cases {
            assert_eq!(referenced_channels(&case.events), case.expected, "{}", case.name);
        }
    }

    #[test]
    fn deletions_collect_every_e_tag() {
        let own = vec![
            event("d1", KIND_EVENT_DELETION, &[&["e", "a"], &["e", "b"]]),
            event("m1", KIND_CHANNEL_MESSAGE, &[&["e", "c"]]),
        ];
        let deleted = deleted_ids(&own);
        assert!(deleted.contains("a") && deleted.contains("b"));
        assert!(!deleted.contains("c"));
    }
}
