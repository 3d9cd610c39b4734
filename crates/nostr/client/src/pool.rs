//! Relay pool for multi-relay fanout.

use crate::error::{ClientError, Result};
use crate::relay::{PublishConfirmation, RelayConfig, RelayConnection};
use crate::subscription::{Subscription, SubscriptionStream};
use futures_util::future::join_all;
use nostr::{Event, Filter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of relays in the pool.
    pub max_relays: usize,
    /// Relay configuration template.
    pub relay_config: RelayConfig,
    /// Capacity of each subscription's delivery channel.
    pub subscription_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_relays: 16,
            relay_config: RelayConfig::default(),
            subscription_capacity: crate::subscription::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Outcome of connecting a batch of relays. Partial failure is normal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ConnectReport {
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }
}

/// Minimal multi-relay pool.
pub struct RelayPool {
    relays: Arc<RwLock<HashMap<String, Arc<RelayConnection>>>>,
    config: PoolConfig,
}

impl RelayPool {
    /// Create new relay pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            relays: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Add relay URL to pool (not connected until `connect` or `connect_relay`).
    pub async fn add_relay(&self, url: &str) -> Result<()> {
        let mut relays = self.relays.write().await;
        if relays.contains_key(url) {
            return Ok(());
        }
        if relays.len() >= self.config.max_relays {
            return Err(ClientError::Internal(format!(
                "maximum relay limit ({}) reached",
                self.config.max_relays
            )));
        }
        let relay = RelayConnection::with_config(url, self.config.relay_config.clone())?;
        relays.insert(url.to_string(), Arc::new(relay));
        Ok(())
    }

    /// Connect a specific relay. Already connected counts as success.
    pub async fn connect_relay(&self, url: &str) -> Result<()> {
        let relay = self
            .relay(url)
            .await
            .ok_or_else(|| ClientError::InvalidRequest(format!("unknown relay: {}", url)))?;
        match relay.connect().await {
            Ok(()) | Err(ClientError::AlreadyConnected) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Add and connect `urls` concurrently, each bounded by `limit`.
    pub async fn connect(&self, urls: &[String], limit: Duration) -> ConnectReport {
        let mut report = ConnectReport::default();
        let mut pending = Vec::new();
        for url in urls {
            match self.add_relay(url).await {
                Ok(()) => pending.push(url.clone()),
                Err(error) => report.failed.push((url.clone(), error.to_string())),
            }
        }

        let attempts = pending.into_iter().map(|url| async move {
            let result = match timeout(limit, self.connect_relay(&url)).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(format!(
                    "connect to {} exceeded {:?}",
                    url, limit
                ))),
            };
            (url, result)
        });

        for (url, result) in join_all(attempts).await {
            match result {
                Ok(()) => report.connected.push(url),
                Err(error) => {
                    warn!("relay connect failed for {}: {}", url, error);
                    report.failed.push((url, error.to_string()));
                }
            }
        }

        info!(
            "connected {} relays ({} failed)",
            report.connected.len(),
            report.failed.len()
        );
        report
    }

    /// Connect all known relays.
    pub async fn connect_all(&self) -> Result<()> {
        let urls: Vec<String> = self.relays.read().await.keys().cloned().collect();
        let report = self
            .connect(&urls, self.config.relay_config.connect_timeout)
            .await;
        if report.is_empty() {
            return Err(ClientError::Connection(
                "failed to connect to any relay".to_string(),
            ));
        }
        Ok(())
    }

    /// Disconnect all relays. Failures are logged, not returned.
    pub async fn disconnect_all(&self) {
        for relay in self.all_relays().await {
            if let Err(error) = relay.disconnect().await {
                debug!("disconnect of {} failed: {}", relay.url(), error);
            }
        }
    }

    /// URLs of relays with a live connection.
    pub async fn connected_relays(&self) -> Vec<String> {
        let mut connected = Vec::new();
        for relay in self.all_relays().await {
            if relay.is_connected().await {
                connected.push(relay.url().to_string());
            }
        }
        connected
    }

    /// Make sure `url` is in the pool and connected.
    pub async fn ensure_relay(&self, url: &str) -> Result<()> {
        self.add_relay(url).await?;
        self.connect_relay(url).await
    }

    /// Publish event to all relays.
    pub async fn publish(&self, event: &Event) -> Result<Vec<PublishConfirmation>> {
        let urls: Vec<String> = self.relays.read().await.keys().cloned().collect();
        if urls.is_empty() {
            return Err(ClientError::NotConnected);
        }
        Ok(self.publish_to(&urls, event).await)
    }

    /// Publish to the given relays concurrently. Every URL gets a confirmation.
    pub async fn publish_to(&self, urls: &[String], event: &Event) -> Vec<PublishConfirmation> {
        let attempts = urls.iter().map(|url| async move {
            let Some(relay) = self.relay(url).await else {
                return PublishConfirmation::rejected(url, &event.id, "unknown relay");
            };
            match relay.publish(event).await {
                Ok(confirmation) => confirmation,
                Err(error) => PublishConfirmation::rejected(url, &event.id, error.to_string()),
            }
        });
        join_all(attempts).await
    }

    /// Subscribe on every connected relay.
    pub async fn subscribe(
        &self,
        subscription_id: impl Into<String>,
        filters: Vec<Filter>,
    ) -> Result<SubscriptionStream> {
        let urls = self.connected_relays().await;
        self.subscribe_to(&urls, subscription_id, filters).await
    }

    /// Subscribe on the given relays. Relays that refuse the request are
    /// skipped; it is an error only if none accept it.
    pub async fn subscribe_to(
        &self,
        urls: &[String],
        subscription_id: impl Into<String>,
        filters: Vec<Filter>,
    ) -> Result<SubscriptionStream> {
        let (subscription, receiver) = Subscription::with_capacity(
            subscription_id,
            filters,
            self.config.subscription_capacity,
        );

        let mut accepted = Vec::new();
        for url in urls {
            let Some(relay) = self.relay(url).await else {
                debug!("skipping unknown relay {} for {}", url, subscription.id);
                continue;
            };
            match relay.subscribe(subscription.clone()).await {
                Ok(()) => accepted.push(url.clone()),
                Err(error) => warn!("subscribe {} on {} failed: {}", subscription.id, url, error),
            }
        }

        if accepted.is_empty() {
            return Err(ClientError::NotConnected);
        }

        debug!("subscription {} open on {} relays", subscription.id, accepted.len());
        Ok(SubscriptionStream {
            id: subscription.id,
            relays: accepted,
            receiver,
        })
    }

    /// Close subscription on all relays. Unknown ids are a no-op.
    pub async fn unsubscribe(&self, subscription_id: &str) {
        for relay in self.all_relays().await {
            if let Err(error) = relay.unsubscribe(subscription_id).await {
                debug!("close of {} on {} failed: {}", subscription_id, relay.url(), error);
            }
        }
    }

    /// Get relay by URL.
    pub async fn relay(&self, url: &str) -> Option<Arc<RelayConnection>> {
        self.relays.read().await.get(url).cloned()
    }

    async fn all_relays(&self) -> Vec<Arc<RelayConnection>> {
        self.relays.read().await.values().cloned().collect()
    }
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_relay_enforces_limit_and_dedups() -> Result<()> {
        let pool = RelayPool::new(PoolConfig {
            max_relays: 1,
            ..PoolConfig::default()
        });
        pool.add_relay("wss://a.example").await?;
        pool.add_relay("wss://a.example").await?;

        let result = pool.add_relay("wss://b.example").await;
        assert!(matches!(result, Err(ClientError::Internal(_))));
        Ok(())
    }

    #[tokio::test]
    async fn nothing_is_connected_before_connect() -> Result<()> {
        let pool = RelayPool::default();
        pool.add_relay("wss://a.example").await?;
        assert!(pool.connected_relays().await.is_empty());

        let result = pool.subscribe("sub", vec![Filter::new()]).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
        Ok(())
    }

    #[tokio::test]
    async fn publish_to_unknown_relay_is_rejected() {
        let pool = RelayPool::default();
        let event = Event {
            id: "id".to_string(),
            pubkey: "pk".to_string(),
            created_at: 1,
            kind: 42,
            tags: vec![],
            content: String::new(),
            sig: "sig".to_string(),
        };

        let confirmations = pool
            .publish_to(&["wss://nowhere.example".to_string()], &event)
            .await;
        assert_eq!(confirmations.len(), 1);
        assert!(!confirmations[0].accepted);
        assert_eq!(confirmations[0].message, "unknown relay");
    }

    #[tokio::test]
    async fn connect_reports_invalid_urls() {
        let pool = RelayPool::default();
        let report = pool
            .connect(&["http://not-a-relay".to_string()], Duration::from_millis(50))
            .await;
        assert!(report.connected.is_empty());
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_is_noop() -> Result<()> {
        let pool = RelayPool::default();
        pool.add_relay("wss://a.example").await?;
        pool.unsubscribe("missing").await;
        Ok(())
    }
}
