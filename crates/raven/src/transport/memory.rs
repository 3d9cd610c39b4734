//! In-process relays for tests and offline use.
//!
//! Each relay keeps the events published to it and answers subscriptions
//! from that store, then follows with EOSE unless it is stalled. Live
//! subscriptions also receive later publishes and [`MemoryTransport::inject`]ed
//! events.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, Filter};
use nostr_client::{ClientError, PublishConfirmation, Subscription, SubscriptionMessage};
use tokio::sync::Mutex;

use super::{ConnectReport, EventStream, RelayTransport};

#[derive(Debug, Default)]
struct RelayState {
    events: Vec<Event>,
    connected: bool,
    unreachable: bool,
    stalled: bool,
    rejecting: Option<String>,
}

#[derive(Debug)]
struct LiveSubscription {
    subscription: Subscription,
    relays: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    relays: BTreeMap<String, RelayState>,
    subscriptions: HashMap<String, LiveSubscription>,
    subscribe_calls: usize,
    publish_calls: usize,
    shutdowns: usize,
}

#[derive(Debug, Default)]
pub struct MemoryTransport {
    inner: Mutex<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reachable relay. It is connected by `connect` or
    /// `ensure_relay`.
    pub async fn add_relay(&self, url: &str) {
        self.inner
            .lock()
            .await
            .relays
            .entry(url.to_string())
            .or_default();
    }

    /// Register a relay and mark it connected.
    pub async fn add_connected_relay(&self, url: &str) {
        self.inner
            .lock()
            .await
            .relays
            .entry(url.to_string())
            .or_default()
            .connected = true;
    }

    /// Connection attempts to `url` fail from now on.
    pub async fn set_unreachable(&self, url: &str) {
        let mut inner = self.inner.lock().await;
        let relay = inner.relays.entry(url.to_string()).or_default();
        relay.unreachable = true;
        relay.connected = false;
    }

    /// `url` answers subscriptions but never sends EOSE.
    pub async fn stall(&self, url: &str) {
        self.inner
            .lock()
            .await
            .relays
            .entry(url.to_string())
            .or_default()
            .stalled = true;
    }

    /// `url` answers every publish with `OK false`.
    pub async fn reject_publishes(&self, url: &str, message: &str) {
        self.inner
            .lock()
            .await
            .relays
            .entry(url.to_string())
            .or_default()
            .rejecting = Some(message.to_string());
    }

    /// Seed stored events on `url` without touching live subscriptions.
    pub async fn store(&self, url: &str, events: impl IntoIterator<Item = Event>) {
        let mut inner = self.inner.lock().await;
        let relay = inner.relays.entry(url.to_string()).or_default();
        for event in events {
            if !relay.events.iter().any(|stored| stored.id == event.id) {
                relay.events.push(event);
            }
        }
    }

    /// Store `event` on `url` and push it to matching live subscriptions.
    pub async fn inject(&self, url: &str, event: Event) {
        self.store(url, [event.clone()]).await;
        let deliveries = self.live_matches(url, &event).await;
        deliver_all(deliveries).await;
    }

    pub async fn subscribe_calls(&self) -> usize {
        self.inner.lock().await.subscribe_calls
    }

    pub async fn publish_calls(&self) -> usize {
        self.inner.lock().await.publish_calls
    }

    pub async fn shutdowns(&self) -> usize {
        self.inner.lock().await.shutdowns
    }

    /// Ids of subscriptions not yet closed, sorted.
    pub async fn open_subscriptions(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner.subscriptions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Events stored on `url`.
    pub async fn stored(&self, url: &str) -> Vec<Event> {
        self.inner
            .lock()
            .await
            .relays
            .get(url)
            .map(|relay| relay.events.clone())
            .unwrap_or_default()
    }

    async fn live_matches(&self, url: &str, event: &Event) -> Vec<(Subscription, SubscriptionMessage)> {
        let inner = self.inner.lock().await;
        inner
            .subscriptions
            .values()
            .filter(|live| live.relays.iter().any(|relay| relay == url))
            .filter(|live| live.subscription.filters.iter().any(|filter| filter.matches(event)))
            .map(|live| {
                (
                    live.subscription.clone(),
                    SubscriptionMessage::Event {
                        relay_url: url.to_string(),
                        event: event.clone(),
                    },
                )
            })
            .collect()
    }
}

async fn deliver_all(deliveries: Vec<(Subscription, SubscriptionMessage)>) {
    for (subscription, message) in deliveries {
        // A dropped consumer just means nobody is listening any more.
        let _ = subscription.deliver(message).await;
    }
}

fn stored_matches(events: &[Event], filters: &[Filter]) -> Vec<Event> {
    let mut matched: Vec<Event> = Vec::new();
    for filter in filters {
        let mut hits: Vec<&Event> = events.iter().filter(|event| filter.matches(event)).collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            hits.truncate(limit);
        }
        for event in hits {
            if !matched.iter().any(|existing| existing.id == event.id) {
                matched.push(event.clone());
            }
        }
    }
    matched
}

#[async_trait]
impl RelayTransport for MemoryTransport {
    async fn connected_relays(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .relays
            .iter()
            .filter(|(_, relay)| relay.connected)
            .map(|(url, _)| url.clone())
            .collect()
    }

    async fn connect(&self, urls: &[String], _limit: Duration) -> ConnectReport {
        let mut report = ConnectReport::default();
        for url in urls {
            match self.ensure_relay(url).await {
                Ok(()) => report.connected.push(url.clone()),
                Err(error) => report.failed.push((url.clone(), error.to_string())),
            }
        }
        report
    }

    async fn subscribe(
        &self,
        relays: &[String],
        id: &str,
        filters: Vec<Filter>,
    ) -> Result<EventStream, ClientError> {
        let (subscription, receiver) = Subscription::with_channel(id, filters);
        let mut accepted = Vec::new();
        let mut backlog = Vec::new();

        {
            let mut inner = self.inner.lock().await;
            inner.subscribe_calls += 1;
            for url in relays {
                let Some(relay) = inner.relays.get(url) else {
                    continue;
                };
                if !relay.connected {
                    continue;
                }
                accepted.push(url.clone());
                for event in stored_matches(&relay.events, &subscription.filters) {
                    backlog.push(SubscriptionMessage::Event {
                        relay_url: url.clone(),
                        event,
                    });
                }
                if !relay.stalled {
                    backlog.push(SubscriptionMessage::Eose {
                        relay_url: url.clone(),
                    });
                }
            }

            if accepted.is_empty() {
                return Err(ClientError::NotConnected);
            }
            inner.subscriptions.insert(
                id.to_string(),
                LiveSubscription {
                    subscription: subscription.clone(),
                    relays: accepted.clone(),
                },
            );
        }

        tokio::spawn(async move {
            for message in backlog {
                if subscription.deliver(message).await.is_err() {
                    break;
                }
            }
        });

        Ok(EventStream::new(id, accepted, receiver))
    }

    async fn unsubscribe(&self, id: &str) {
        self.inner.lock().await.subscriptions.remove(id);
    }

    async fn publish(&self, relays: &[String], event: &Event) -> Vec<PublishConfirmation> {
        let mut confirmations = Vec::new();
        let mut stored_on = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            inner.publish_calls += 1;
            for url in relays {
                let confirmation = match inner.relays.get_mut(url) {
                    Some(relay) if relay.connected => match &relay.rejecting {
                        Some(message) => PublishConfirmation::rejected(url, &event.id, message),
                        None => {
                            if !relay.events.iter().any(|stored| stored.id == event.id) {
                                relay.events.push(event.clone());
                            }
                            stored_on.push(url.clone());
                            PublishConfirmation {
                                relay_url: url.clone(),
                                event_id: event.id.clone(),
                                accepted: true,
                                message: String::new(),
                            }
                        }
                    },
                    _ => PublishConfirmation::rejected(url, &event.id, "not connected"),
                };
                confirmations.push(confirmation);
            }
        }

        for url in stored_on {
            let deliveries = self.live_matches(&url, event).await;
            deliver_all(deliveries).await;
        }
        confirmations
    }

    async fn ensure_relay(&self, url: &str) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        let relay = inner.relays.entry(url.to_string()).or_default();
        if relay.unreachable {
            return Err(ClientError::Connection(format!("{url} is unreachable")));
        }
        relay.connected = true;
        Ok(())
    }

    async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.shutdowns += 1;
        inner.subscriptions.clear();
        for relay in inner.relays.values_mut() {
            relay.connected = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamItem;

    fn event(id: &str, kind: u16, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "aa".repeat(32),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[tokio::test]
    async fn stored_events_then_end_of_stored() -> Result<(), ClientError> {
        let transport = MemoryTransport::new();
        transport.add_connected_relay("wss://a").await;
        transport
            .store("wss://a", [event("1", 42, 10), event("2", 7, 11)])
            .await;

        let mut stream = transport
            .subscribe(&["wss://a".to_string()], "sub", vec![Filter::new().kind(42)])
            .await?;

        assert!(matches!(
            stream.next().await,
            Some(StreamItem::Event { event, .. }) if event.id == "1"
        ));
        assert_eq!(stream.next().await, Some(StreamItem::EndOfStored));
        Ok(())
    }

    #[tokio::test]
    async fn subscribe_requires_a_connected_relay() {
        let transport = MemoryTransport::new();
        transport.add_relay("wss://a").await;
        let result = transport
            .subscribe(&["wss://a".to_string()], "sub", vec![Filter::new()])
            .await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[test]
    fn limit_keeps_newest() {
        let stored = vec![event("old", 42, 1), event("new", 42, 5), event("mid", 42, 3)];
        let matched = stored_matches(&stored, &[Filter::new().limit(2)]);
        let ids: Vec<&str> = matched.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[tokio::test]
    async fn publish_feeds_live_subscriptions() -> Result<(), ClientError> {
        let transport = MemoryTransport::new();
        transport.add_connected_relay("wss://a").await;
        let relays = vec!["wss://a".to_string()];
        let mut stream = transport
            .subscribe(&relays, "live", vec![Filter::new().kind(42)])
            .await?;
        assert_eq!(stream.next().await, Some(StreamItem::EndOfStored));

        let confirmations = transport.publish(&relays, &event("x", 42, 1)).await;
        assert!(confirmations[0].accepted);
        assert!(matches!(
            stream.next().await,
            Some(StreamItem::Event { event, .. }) if event.id == "x"
        ));
        assert_eq!(transport.publish_calls().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_relays_fail_to_connect() {
        let transport = MemoryTransport::new();
        transport.add_relay("wss://up").await;
        transport.set_unreachable("wss://down").await;

        let report = transport
            .connect(
                &["wss://up".to_string(), "wss://down".to_string()],
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(report.connected, vec!["wss://up".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(transport.connected_relays().await, vec!["wss://up".to_string()]);
    }
}
