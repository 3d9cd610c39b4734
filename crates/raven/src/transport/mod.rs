//! The relay I/O boundary the engine is written against.
//!
//! [`RelayTransport`] is implemented for [`nostr_client::RelayPool`] for real
//! relays and by [`memory::MemoryTransport`] for tests and offline use.

pub mod memory;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, Filter};
use nostr_client::{
    ClientError, PoolConfig, PublishConfirmation, RelayPool, SubscriptionMessage,
    SubscriptionStream,
};
use tokio::sync::mpsc;
use tracing::debug;

pub use nostr_client::ConnectReport;

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// URLs with a live connection.
    async fn connected_relays(&self) -> Vec<String>;

    /// Connect `urls`, each bounded by `limit`. Partial failure is reported,
    /// not returned as an error.
    async fn connect(&self, urls: &[String], limit: Duration) -> ConnectReport;

    /// Open subscription `id` on `relays`. Fails only if no relay accepts it.
    async fn subscribe(
        &self,
        relays: &[String],
        id: &str,
        filters: Vec<Filter>,
    ) -> Result<EventStream, ClientError>;

    /// Close subscription `id` everywhere. Unknown ids are a no-op.
    async fn unsubscribe(&self, id: &str);

    /// Publish to `relays`; one confirmation per relay.
    async fn publish(&self, relays: &[String], event: &Event) -> Vec<PublishConfirmation>;

    /// Add `url` if needed and make sure it is connected.
    async fn ensure_relay(&self, url: &str) -> Result<(), ClientError>;

    async fn shutdown(&self);
}

/// Item yielded by an [`EventStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Event { relay_url: String, event: Event },
    /// Every relay serving the stream has sent EOSE or CLOSED. Yielded once.
    EndOfStored,
}

/// Events of one subscription merged across relays.
#[derive(Debug)]
pub struct EventStream {
    pub id: String,
    relays: Vec<String>,
    receiver: mpsc::Receiver<SubscriptionMessage>,
    awaiting_eose: HashSet<String>,
    open: HashSet<String>,
    end_sent: bool,
}

impl EventStream {
    pub fn new(
        id: impl Into<String>,
        relays: Vec<String>,
        receiver: mpsc::Receiver<SubscriptionMessage>,
    ) -> Self {
        let awaiting_eose: HashSet<String> = relays.iter().cloned().collect();
        Self {
            id: id.into(),
            open: awaiting_eose.clone(),
            awaiting_eose,
            relays,
            receiver,
            end_sent: false,
        }
    }

    /// Relays that accepted the subscription.
    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Next event or end-of-stored marker. `None` once every relay has
    /// closed the subscription or the transport dropped it.
    pub async fn next(&mut self) -> Option<StreamItem> {
        loop {
            if !self.end_sent && self.awaiting_eose.is_empty() {
                self.end_sent = true;
                return Some(StreamItem::EndOfStored);
            }
            if self.end_sent && self.open.is_empty() {
                return None;
            }

            match self.receiver.recv().await? {
                SubscriptionMessage::Event { relay_url, event } => {
                    return Some(StreamItem::Event { relay_url, event });
                }
                SubscriptionMessage::Eose { relay_url } => {
                    self.awaiting_eose.remove(&relay_url);
                }
                SubscriptionMessage::Closed { relay_url, reason } => {
                    debug!("{} closed by {}: {}", self.id, relay_url, reason);
                    self.awaiting_eose.remove(&relay_url);
                    self.open.remove(&relay_url);
                }
            }
        }
    }
}

impl From<SubscriptionStream> for EventStream {
    fn from(stream: SubscriptionStream) -> Self {
        Self::new(stream.id, stream.relays, stream.receiver)
    }
}

#[async_trait]
impl RelayTransport for RelayPool {
    async fn connected_relays(&self) -> Vec<String> {
        RelayPool::connected_relays(self).await
    }

    async fn connect(&self, urls: &[String], limit: Duration) -> ConnectReport {
        RelayPool::connect(self, urls, limit).await
    }

    async fn subscribe(
        &self,
        relays: &[String],
        id: &str,
        filters: Vec<Filter>,
    ) -> Result<EventStream, ClientError> {
        RelayPool::subscribe_to(self, relays, id, filters)
            .await
            .map(EventStream::from)
    }

    async fn unsubscribe(&self, id: &str) {
        RelayPool::unsubscribe(self, id).await;
    }

    async fn publish(&self, relays: &[String], event: &Event) -> Vec<PublishConfirmation> {
        RelayPool::publish_to(self, relays, event).await
    }

    async fn ensure_relay(&self, url: &str) -> Result<(), ClientError> {
        RelayPool::ensure_relay(self, url).await
    }

    async fn shutdown(&self) {
        RelayPool::disconnect_all(self).await;
    }
}

/// A WebSocket relay pool behind the transport trait.
pub fn pool(config: PoolConfig) -> Arc<dyn RelayTransport> {
    Arc::new(RelayPool::new(config))
}
