//! Subscription management for receiving filtered events.

use crate::error::{ClientError, Result};
use nostr::{Event, Filter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Capacity of the channel shared by every relay serving one subscription.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Message delivered to the consumer of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMessage {
    /// A stored or live event sent by `relay_url`.
    Event { relay_url: String, event: Event },
    /// `relay_url` has sent every stored event.
    Eose { relay_url: String },
    /// `relay_url` refused or ended the subscription.
    Closed { relay_url: String, reason: String },
}

impl SubscriptionMessage {
    pub fn relay_url(&self) -> &str {
        match self {
            SubscriptionMessage::Event { relay_url, .. }
            | SubscriptionMessage::Eose { relay_url }
            | SubscriptionMessage::Closed { relay_url, .. } => relay_url,
        }
    }
}

/// A subscription to filtered events. Cloned once per relay; all clones feed
/// the same bounded channel.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscription ID.
    pub id: String,
    /// Filters for this subscription.
    pub filters: Vec<Filter>,
    sender: mpsc::Sender<SubscriptionMessage>,
}

impl Subscription {
    /// Create a subscription that delivers on a bounded channel.
    pub fn with_channel(
        id: impl Into<String>,
        filters: Vec<Filter>,
    ) -> (Self, mpsc::Receiver<SubscriptionMessage>) {
        Self::with_capacity(id, filters, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(
        id: impl Into<String>,
        filters: Vec<Filter>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<SubscriptionMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let subscription = Self {
            id: id.into(),
            filters,
            sender,
        };
        (subscription, receiver)
    }

    /// Forward a message, waiting for channel capacity.
    pub async fn deliver(&self, message: SubscriptionMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ClientError::Subscription(format!("subscription {} dropped", self.id)))
    }

    /// Forward without waiting. Used on teardown where a stalled consumer
    /// must not block the relay.
    pub fn try_deliver(&self, message: SubscriptionMessage) -> Result<()> {
        self.sender
            .try_send(message)
            .map_err(|error| ClientError::Subscription(format!("{}: {}", self.id, error)))
    }

    /// Forward if the channel has room. A full channel hands the message
    /// back so the caller can decide whether it may be dropped.
    pub fn offer(
        &self,
        message: SubscriptionMessage,
    ) -> std::result::Result<(), TrySendError<SubscriptionMessage>> {
        self.sender.try_send(message)
    }

    /// Whether the consumer has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Receiving side of a pool subscription, with the relays that accepted it.
#[derive(Debug)]
pub struct SubscriptionStream {
    pub id: String,
    pub relays: Vec<String>,
    pub receiver: mpsc::Receiver<SubscriptionMessage>,
}
