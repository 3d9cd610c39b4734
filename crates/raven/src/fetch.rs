//! Bounded one-shot queries against the read relay set.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use nostr::{Event, Filter};
use nostr_client::ClientError;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::relay_set::{RelayRole, RelaySetResolver};
use crate::transport::{EventStream, RelayTransport, StreamItem};

/// How one filter's query ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Every read relay sent EOSE or CLOSED.
    Complete,
    /// The bound elapsed first; results are partial.
    TimedOut,
    /// No read relay was connected.
    Unavailable,
    /// The transport refused the subscription.
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub events: Vec<Event>,
    /// One outcome per filter, in filter order.
    pub outcomes: Vec<FetchOutcome>,
}

impl FetchReport {
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| *outcome == FetchOutcome::Complete)
    }
}

/// Whether filters of one fetch are queried one after another or overlapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    Sequential,
    /// At most this many filters in flight.
    Concurrent(usize),
}

impl FetchStrategy {
    pub fn from_concurrency(in_flight: usize) -> Self {
        if in_flight <= 1 {
            FetchStrategy::Sequential
        } else {
            FetchStrategy::Concurrent(in_flight)
        }
    }
}

#[derive(Clone)]
pub struct FetchEngine {
    transport: Arc<dyn RelayTransport>,
    resolver: Arc<RelaySetResolver>,
    default_timeout: Duration,
    strategy: FetchStrategy,
}

impl FetchEngine {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        resolver: Arc<RelaySetResolver>,
        default_timeout: Duration,
        strategy: FetchStrategy,
    ) -> Self {
        Self {
            transport,
            resolver,
            default_timeout,
            strategy,
        }
    }

    /// Events matching any of `filters`, in no particular order. Relay
    /// trouble shrinks the result instead of failing it.
    pub async fn fetch(&self, filters: Vec<Filter>, limit: Option<Duration>) -> Vec<Event> {
        self.fetch_report(filters, limit).await.events
    }

    pub async fn fetch_report(&self, filters: Vec<Filter>, limit: Option<Duration>) -> FetchReport {
        if filters.is_empty() {
            return FetchReport::default();
        }
        let limit = limit.unwrap_or(self.default_timeout);

        let Some(read) = self
            .resolver
            .resolve(RelayRole::Read, self.transport.as_ref())
            .await
        else {
            debug!("no read relays connected, skipping {} filters", filters.len());
            return FetchReport {
                events: Vec::new(),
                outcomes: vec![FetchOutcome::Unavailable; filters.len()],
            };
        };

        let results: Vec<(Vec<Event>, FetchOutcome)> = match self.strategy {
            FetchStrategy::Sequential => {
                let mut results = Vec::with_capacity(filters.len());
                for filter in filters {
                    results.push(self.fetch_one(&read.urls, filter, limit).await);
                }
                results
            }
            FetchStrategy::Concurrent(in_flight) => {
                stream::iter(filters)
                    .map(|filter| self.fetch_one(&read.urls, filter, limit))
                    .buffered(in_flight)
                    .collect()
                    .await
            }
        };

        let mut report = FetchReport::default();
        for (events, outcome) in results {
            report.events.extend(events);
            report.outcomes.push(outcome);
        }
        report
    }

    async fn fetch_one(
        &self,
        relays: &[String],
        filter: Filter,
        limit: Duration,
    ) -> (Vec<Event>, FetchOutcome) {
        let id = format!("fetch-{}", Uuid::new_v4());
        let mut events = Vec::new();
        // The bound covers opening the subscription as well as reading it.
        let collected = timeout(limit, async {
            let mut stream = self.transport.subscribe(relays, &id, vec![filter]).await?;
            collect_stored(&mut stream, &mut events).await;
            Ok::<(), ClientError>(())
        })
        .await;

        let outcome = match collected {
            Ok(Ok(())) => FetchOutcome::Complete,
            Ok(Err(error)) => {
                warn!("fetch {} could not subscribe: {}", id, error);
                FetchOutcome::Failed(error.to_string())
            }
            Err(_) => {
                debug!(
                    "fetch {} timed out after {:?} with {} events",
                    id,
                    limit,
                    events.len()
                );
                FetchOutcome::TimedOut
            }
        };
        self.transport.unsubscribe(&id).await;
        (events, outcome)
    }
}

async fn collect_stored(stream: &mut EventStream, events: &mut Vec<Event>) {
    while let Some(item) = stream.next().await {
        match item {
            StreamItem::Event { event, .. } => events.push(event),
            StreamItem::EndOfStored => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayEntry;
    use crate::transport::memory::MemoryTransport;

    fn event(id: &str, kind: u16) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "aa".repeat(32),
            created_at: 1,
            kind,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    fn engine(transport: Arc<MemoryTransport>, relays: &[&str], strategy: FetchStrategy) -> FetchEngine {
        let entries: Vec<RelayEntry> = relays.iter().map(|url| RelayEntry::read_write(*url)).collect();
        FetchEngine::new(
            transport,
            Arc::new(RelaySetResolver::new(&entries)),
            Duration::from_secs(30),
            strategy,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_relay_yields_partial_results_at_the_bound() {
        let transport = Arc::new(MemoryTransport::new());
        transport.add_connected_relay("wss://fast").await;
        transport.add_connected_relay("wss://slow").await;
        transport.store("wss://fast", [event("a", 42)]).await;
        transport.stall("wss://slow").await;

        let fetcher = engine(transport.clone(), &["wss://fast", "wss://slow"], FetchStrategy::Sequential);
        let started = tokio::time::Instant::now();
        let report = fetcher
            .fetch_report(vec![Filter::new().kind(42)], Some(Duration::from_secs(2)))
            .await;

        assert_eq!(report.outcomes, vec![FetchOutcome::TimedOut]);
        assert_eq!(report.events.len(), 1);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(transport.open_subscriptions().await.is_empty());
    }

    /// Delegates to a memory transport but never finishes opening a subscription.
    struct HangingSubscribe(Arc<MemoryTransport>);

    #[async_trait::async_trait]
    impl RelayTransport for HangingSubscribe {
        async fn connected_relays(&self) -> Vec<String> {
            self.0.connected_relays().await
        }

        async fn connect(&self, urls: &[String], limit: Duration) -> crate::transport::ConnectReport {
            self.0.connect(urls, limit).await
        }

        async fn subscribe(
            &self,
            _relays: &[String],
            _id: &str,
            _filters: Vec<Filter>,
        ) -> Result<EventStream, ClientError> {
            std::future::pending().await
        }

        async fn unsubscribe(&self, id: &str) {
            self.0.unsubscribe(id).await;
        }

        async fn publish(
            &self,
            relays: &[String],
            event: &Event,
        ) -> Vec<nostr_client::PublishConfirmation> {
            self.0.publish(relays, event).await
        }

        async fn ensure_relay(&self, url: &str) -> Result<(), ClientError> {
            self.0.ensure_relay(url).await
        }

        async fn shutdown(&self) {
            self.0.shutdown().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_that_never_returns_is_bounded() {
        let inner = Arc::new(MemoryTransport::new());
        inner.add_connected_relay("wss://a").await;
        let fetcher = FetchEngine::new(
            Arc::new(HangingSubscribe(inner)),
            Arc::new(RelaySetResolver::new(&[RelayEntry::read_write("wss://a")])),
            Duration::from_secs(30),
            FetchStrategy::Sequential,
        );

        let started = tokio::time::Instant::now();
        let report = fetcher
            .fetch_report(vec![Filter::new().kind(0)], Some(Duration::from_secs(3)))
            .await;

        assert_eq!(report.outcomes, vec![FetchOutcome::TimedOut]);
        assert!(report.events.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn no_connected_read_relay_is_unavailable() {
        let transport = Arc::new(MemoryTransport::new());
        transport.add_relay("wss://a").await;

        let fetcher = engine(transport.clone(), &["wss://a"], FetchStrategy::Sequential);
        let report = fetcher
            .fetch_report(vec![Filter::new(), Filter::new()], None)
            .await;

        assert!(report.events.is_empty());
        assert_eq!(report.outcomes, vec![FetchOutcome::Unavailable; 2]);
        assert_eq!(transport.subscribe_calls().await, 0);
    }

    #[tokio::test]
    async fn concurrent_strategy_keeps_outcome_order() {
        let transport = Arc::new(MemoryTransport::new());
        transport.add_connected_relay("wss://a").await;
        transport
            .store("wss://a", [event("m", 42), event("r", 7)])
            .await;

        let fetcher = engine(transport, &["wss://a"], FetchStrategy::from_concurrency(3));
        let report = fetcher
            .fetch_report(
                vec![Filter::new().kind(42), Filter::new().kind(7), Filter::new().kind(0)],
                None,
            )
            .await;

        assert!(report.is_complete());
        assert_eq!(report.outcomes.len(), 3);
        let mut ids: Vec<String> = report.events.into_iter().map(|e| e.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["m", "r"]);
    }

    #[test]
    fn strategy_from_concurrency() {
        assert_eq!(FetchStrategy::from_concurrency(0), FetchStrategy::Sequential);
        assert_eq!(FetchStrategy::from_concurrency(1), FetchStrategy::Sequential);
        assert_eq!(FetchStrategy::from_concurrency(4), FetchStrategy::Concurrent(4));
    }
}
