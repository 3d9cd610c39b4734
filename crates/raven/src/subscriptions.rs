//! Named live subscriptions feeding the intake buffer.

use std::collections::HashMap;
use std::sync::Arc;

use nostr::{
    Filter, KIND_APP_DATA, KIND_CHANNEL_CREATION, KIND_CHANNEL_HIDE_MESSAGE, KIND_CHANNEL_MESSAGE,
    KIND_CHANNEL_METADATA, KIND_CHANNEL_MUTE_USER, KIND_ENCRYPTED_DIRECT_MESSAGE,
    KIND_EVENT_DELETION, KIND_MUTE_LIST, KIND_REACTION,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::intake::IntakeBuffer;
use crate::relay_set::{RelayRole, RelaySetResolver};
use crate::transport::{RelayTransport, StreamItem};

pub const INBOX: &str = "inbox";
pub const MESSAGE_LISTENER: &str = "message-listener";
pub const CHANNELS: &str = "channels";

/// Kinds addressed to the identity through a `#p` tag.
const INBOX_KINDS: [u16; 10] = [
    KIND_ENCRYPTED_DIRECT_MESSAGE,
    KIND_EVENT_DELETION,
    KIND_REACTION,
    KIND_CHANNEL_CREATION,
    KIND_CHANNEL_METADATA,
    KIND_CHANNEL_MESSAGE,
    KIND_CHANNEL_HIDE_MESSAGE,
    KIND_CHANNEL_MUTE_USER,
    KIND_MUTE_LIST,
    KIND_APP_DATA,
];

pub fn channel_subscription_name(channel_id: &str) -> String {
    format!("channel-{channel_id}")
}

struct Live {
    wire_id: String,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct SubscriptionManager {
    transport: Arc<dyn RelayTransport>,
    resolver: Arc<RelaySetResolver>,
    intake: Arc<IntakeBuffer>,
    identity: Option<String>,
    chunk_size: usize,
    page_size: usize,
    active: Arc<Mutex<HashMap<String, Live>>>,
}

impl SubscriptionManager {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        resolver: Arc<RelaySetResolver>,
        intake: Arc<IntakeBuffer>,
        identity: Option<String>,
        chunk_size: usize,
        page_size: usize,
    ) -> Self {
        Self {
            transport,
            resolver,
            intake,
            identity,
            chunk_size: chunk_size.max(1),
            page_size,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Persistent subscription to everything addressed to the identity, plus
    /// its own mute list and read-mark map.
    pub async fn start_inbox(&self) -> bool {
        let Some(identity) = self.identity.clone() else {
            debug!("no identity, inbox not started");
            return false;
        };
        let filters = vec![
            Filter::new().kinds(INBOX_KINDS).pubkeys([identity.clone()]),
            Filter::new()
                .kinds([KIND_MUTE_LIST, KIND_APP_DATA])
                .authors([identity]),
        ];
        self.start(INBOX, filters, false).await
    }

    /// New messages in `channel_ids` since `since`. Closes once relays have
    /// sent what they store.
    pub async fn listen_channels(&self, channel_ids: &[String], since: u64) -> bool {
        if channel_ids.is_empty() {
            self.stop(CHANNELS).await;
            return false;
        }
        let filter = Filter::new()
            .kind(KIND_CHANNEL_MESSAGE)
            .events(channel_ids.iter().cloned())
            .since(since);
        self.start(CHANNELS, vec![filter], true).await
    }

    /// Replace the listener for replies, reactions and deletions of
    /// `message_ids`, and deletions of `reference_ids`.
    pub async fn listen_messages(&self, message_ids: &[String], reference_ids: &[String]) -> bool {
        self.stop(MESSAGE_LISTENER).await;
        if message_ids.is_empty() && reference_ids.is_empty() {
            return false;
        }

        let mut filters = Vec::new();
        if !message_ids.is_empty() {
            filters.push(
                Filter::new()
                    .kinds([KIND_EVENT_DELETION, KIND_CHANNEL_MESSAGE, KIND_REACTION])
                    .events(message_ids.iter().cloned()),
            );
        }
        for chunk in reference_ids.chunks(self.chunk_size) {
            filters.push(
                Filter::new()
                    .kind(KIND_EVENT_DELETION)
                    .events(chunk.iter().cloned()),
            );
        }
        self.start(MESSAGE_LISTENER, filters, false).await
    }

    /// Creation, metadata, deletions and the latest page of messages of one
    /// channel.
    pub async fn load_channel(&self, channel_id: &str) -> bool {
        let filters = vec![
            Filter::new()
                .kind(KIND_CHANNEL_CREATION)
                .ids([channel_id.to_string()]),
            Filter::new()
                .kinds([KIND_CHANNEL_METADATA, KIND_EVENT_DELETION])
                .events([channel_id.to_string()]),
            Filter::new()
                .kind(KIND_CHANNEL_MESSAGE)
                .events([channel_id.to_string()])
                .limit(self.page_size),
        ];
        self.start(&channel_subscription_name(channel_id), filters, true)
            .await
    }

    /// Stop `name`. Returns whether it was running.
    pub async fn stop(&self, name: &str) -> bool {
        let live = self.active.lock().await.remove(name);
        let Some(live) = live else {
            return false;
        };
        live.task.abort();
        self.transport.unsubscribe(&live.wire_id).await;
        debug!("stopped subscription {}", name);
        true
    }

    pub async fn stop_all(&self) {
        let drained: Vec<(String, Live)> = self.active.lock().await.drain().collect();
        for (name, live) in drained {
            live.task.abort();
            self.transport.unsubscribe(&live.wire_id).await;
            debug!("stopped subscription {}", name);
        }
    }

    /// Names of running subscriptions, sorted.
    pub async fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn start(&self, name: &str, filters: Vec<Filter>, close_on_eose: bool) -> bool {
        self.stop(name).await;

        let Some(read) = self
            .resolver
            .resolve(RelayRole::Read, self.transport.as_ref())
            .await
        else {
            debug!("no read relays, {} not started", name);
            return false;
        };

        let wire_id = Uuid::new_v4().simple().to_string();
        let mut stream = match self.transport.subscribe(&read.urls, &wire_id, filters).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!("subscription {} failed: {}", name, error);
                return false;
            }
        };

        // Held across spawn so a fast-finishing task cannot remove its entry
        // before it is inserted.
        let mut active = self.active.lock().await;
        let task = {
            let name = name.to_string();
            let wire_id = wire_id.clone();
            let intake = Arc::clone(&self.intake);
            let transport = Arc::clone(&self.transport);
            let registry = Arc::clone(&self.active);
            tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    match item {
                        StreamItem::Event { event, .. } => {
                            intake.push(event).await;
                        }
                        StreamItem::EndOfStored if close_on_eose => break,
                        StreamItem::EndOfStored => debug!("{} caught up", name),
                    }
                }
                transport.unsubscribe(&wire_id).await;
                let mut registry = registry.lock().await;
                if registry
                    .get(&name)
                    .is_some_and(|live| live.wire_id == wire_id)
                {
                    registry.remove(&name);
                }
                debug!("subscription {} finished", name);
            })
        };
        info!("subscription {} open on {} relays", name, read.urls.len());
        // A concurrent start of the same name may have won the race.
        if let Some(replaced) = active.insert(name.to_string(), Live { wire_id, task }) {
            replaced.task.abort();
            self.transport.unsubscribe(&replaced.wire_id).await;
            debug!("replaced concurrent subscription {}", name);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayEntry;
    use crate::transport::memory::MemoryTransport;
    use nostr::Event;
    use std::time::Duration;

    const RELAY: &str = "wss://relay.example";

    fn message(id: &str, channel: &str) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "aa".repeat(32),
            created_at: 50,
            kind: KIND_CHANNEL_MESSAGE,
            tags: vec![vec!["e".to_string(), channel.to_string(), String::new(), "root".to_string()]],
            content: "hi".to_string(),
            sig: String::new(),
        }
    }

    async fn manager(identity: Option<&str>) -> (SubscriptionManager, Arc<MemoryTransport>, Arc<IntakeBuffer>) {
        let transport = Arc::new(MemoryTransport::new());
        transport.add_connected_relay(RELAY).await;
        let intake = Arc::new(IntakeBuffer::new(Duration::from_millis(100), None));
        let manager = SubscriptionManager::new(
            transport.clone(),
            Arc::new(RelaySetResolver::new(&[RelayEntry::read_write(RELAY)])),
            intake.clone(),
            identity.map(str::to_string),
            10,
            30,
        );
        (manager, transport, intake)
    }

    #[tokio::test]
    async fn inbox_needs_identity() {
        let (manager, transport, _) = manager(None).await;
        assert!(!manager.start_inbox().await);
        assert_eq!(transport.subscribe_calls().await, 0);
    }

    #[tokio::test]
    async fn starting_a_name_replaces_it() {
        let (manager, transport, _) = manager(Some("me")).await;
        assert!(manager.start_inbox().await);
        assert!(manager.start_inbox().await);

        assert_eq!(manager.active().await, vec![INBOX.to_string()]);
        assert_eq!(transport.open_subscriptions().await.len(), 1);

        assert!(manager.stop(INBOX).await);
        assert!(!manager.stop(INBOX).await);
        assert!(transport.open_subscriptions().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_leave_one_wire_subscription() {
        let (manager, transport, _) = manager(Some("me")).await;
        for round in 0..100 {
            let first = tokio::spawn({
                let manager = manager.clone();
                async move { manager.start_inbox().await }
            });
            let second = tokio::spawn({
                let manager = manager.clone();
                async move { manager.start_inbox().await }
            });
            let (first, second) = (first.await, second.await);
            assert!(matches!((first, second), (Ok(true), Ok(true))), "round {round}");

            assert_eq!(manager.active().await, vec![INBOX.to_string()], "round {round}");
            assert_eq!(transport.open_subscriptions().await.len(), 1, "round {round}");
        }
        manager.stop_all().await;
        assert!(transport.open_subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn bounded_subscription_feeds_intake_and_removes_itself() {
        let (manager, transport, intake) = manager(Some("me")).await;
        transport
            .store(RELAY, [message("m1", "chan1"), message("m2", "chan2")])
            .await;

        assert!(manager.listen_channels(&["chan1".to_string()], 10).await);
        for _ in 0..50 {
            if manager.active().await.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(manager.active().await.is_empty());
        assert_eq!(intake.len().await, 1);
        assert!(transport.open_subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn empty_message_listener_only_stops_the_old_one() {
        let (manager, _, _) = manager(Some("me")).await;
        assert!(manager.listen_messages(&["m1".to_string()], &[]).await);
        assert_eq!(manager.active().await, vec![MESSAGE_LISTENER.to_string()]);

        assert!(!manager.listen_messages(&[], &[]).await);
        assert!(manager.active().await.is_empty());
    }

    #[tokio::test]
    async fn stop_all_is_idempotent() {
        let (manager, transport, _) = manager(Some("me")).await;
        manager.start_inbox().await;
        manager.listen_messages(&[], &["r1".to_string()]).await;
        manager.stop_all().await;
        manager.stop_all().await;
        assert!(manager.active().await.is_empty());
        assert!(transport.open_subscriptions().await.is_empty());
    }
}
