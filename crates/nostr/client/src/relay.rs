//! Single relay connection management.

use crate::error::{ClientError, Result};
use crate::subscription::{Subscription, SubscriptionMessage};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use nostr::{Event, Filter};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type PendingPublishes = Arc<Mutex<HashMap<String, oneshot::Sender<(bool, String)>>>>;
type Subscriptions = Arc<Mutex<HashMap<String, Subscription>>>;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Relay message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event(String, Event),
    Ok(String, bool, String),
    Eose(String),
    Closed(String, String),
    Notice(String),
    Auth(String),
}

/// Publish confirmation from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    pub relay_url: String,
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

impl PublishConfirmation {
    pub fn rejected(relay_url: &str, event_id: &str, message: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            event_id: event_id.to_string(),
            accepted: false,
            message: message.into(),
        }
    }
}

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    /// How long `publish` waits for the relay's `OK`.
    pub publish_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

/// Relay connection.
pub struct RelayConnection {
    url: String,
    parsed_url: Url,
    config: RelayConfig,
    state: Arc<RwLock<ConnectionState>>,
    writer: Arc<Mutex<Option<WsWriter>>>,
    subscriptions: Subscriptions,
    pending: PendingPublishes,
    recv_task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl RelayConnection {
    /// Create a new relay connection with default config.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config.
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        let parsed_url = Url::parse(url)?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }

        Ok(Self {
            url: url.to_string(),
            parsed_url,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            writer: Arc::new(Mutex::new(None)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            recv_task: Arc::new(Mutex::new(None)),
        })
    }

    /// Relay URL exactly as it was configured.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Connect to relay and start background receive loop.
    pub async fn connect(&self) -> Result<()> {
        let mut state_guard = self.state.write().await;
        if *state_guard == ConnectionState::Connected {
            return Err(ClientError::AlreadyConnected);
        }
        *state_guard = ConnectionState::Connecting;
        drop(state_guard);

        let connect_result = match timeout(
            self.config.connect_timeout,
            connect_async(self.parsed_url.as_str()),
        )
        .await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(error)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::WebSocket(error.to_string()));
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.config.connect_timeout
                )));
            }
        };

        let (stream, _response) = connect_result;
        let (writer, mut reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        *self.state.write().await = ConnectionState::Connected;

        let subscriptions = Arc::clone(&self.subscriptions);
        let pending = Arc::clone(&self.pending);
        let state = Arc::clone(&self.state);
        let relay_url = self.url.clone();

        let task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match parse_relay_message(text.as_str()) {
                        Ok(Some(message)) => {
                            dispatch(&relay_url, message, &subscriptions, &pending).await;
                        }
                        Ok(None) => {}
                        Err(error) => {
                            warn!("protocol parse error on {}: {}", relay_url, error);
                        }
                    },
                    Ok(Message::Ping(payload)) => {
                        debug!("received ping from {} ({} bytes)", relay_url, payload.len());
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Binary(_)) => {}
                    Ok(Message::Frame(_)) => {}
                    Err(error) => {
                        warn!("websocket read error on {}: {}", relay_url, error);
                        break;
                    }
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            close_all(&relay_url, &subscriptions, &pending, "connection closed").await;
        });

        *self.recv_task.lock().await = Some(task);
        Ok(())
    }

    /// Disconnect from relay and stop background tasks.
    pub async fn disconnect(&self) -> Result<()> {
        let writer = self.writer.lock().await.take();
        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
        close_all(&self.url, &self.subscriptions, &self.pending, "disconnected").await;

        if let Some(mut writer) = writer {
            writer
                .send(Message::Close(None))
                .await
                .map_err(|error| ClientError::WebSocket(error.to_string()))?;
        }
        Ok(())
    }

    /// Publish event to relay and wait for its `OK`.
    pub async fn publish(&self, event: &Event) -> Result<PublishConfirmation> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().await.insert(event.id.clone(), ack_tx);

        if let Err(error) = self.send_json(&json!(["EVENT", event])).await {
            self.pending.lock().await.remove(&event.id);
            return Err(error);
        }

        match timeout(self.config.publish_timeout, ack_rx).await {
            Ok(Ok((accepted, message))) => Ok(PublishConfirmation {
                relay_url: self.url.clone(),
                event_id: event.id.clone(),
                accepted,
                message,
            }),
            Ok(Err(_)) => Err(ClientError::Connection(format!(
                "{} closed before acknowledging {}",
                self.url, event.id
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&event.id);
                Err(ClientError::Timeout(format!(
                    "no OK from {} after {:?}",
                    self.url, self.config.publish_timeout
                )))
            }
        }
    }

    /// Register and send subscription request.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        let request = req_frame(&subscription);
        self.subscriptions
            .lock()
            .await
            .insert(subscription.id.clone(), subscription.clone());

        if let Err(error) = self.send_json(&request).await {
            self.subscriptions.lock().await.remove(&subscription.id);
            return Err(error);
        }
        Ok(())
    }

    /// Close subscription on relay. Unknown ids are a no-op.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        if self
            .subscriptions
            .lock()
            .await
            .remove(subscription_id)
            .is_none()
        {
            return Ok(());
        }
        if !self.is_connected().await {
            return Ok(());
        }
        self.send_json(&json!(["CLOSE", subscription_id])).await
    }

    pub async fn has_subscription(&self, subscription_id: &str) -> bool {
        self.subscriptions.lock().await.contains_key(subscription_id)
    }

    async fn send_json(&self, value: &Value) -> Result<()> {
        if self.state().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let text = serde_json::to_string(value)?;
        self.send_text(text).await
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }
}

async fn dispatch(
    relay_url: &str,
    message: RelayMessage,
    subscriptions: &Subscriptions,
    pending: &PendingPublishes,
) {
    match message {
        RelayMessage::Event(subscription_id, event) => {
            let subscription = { subscriptions.lock().await.get(&subscription_id).cloned() };
            let Some(subscription) = subscription else {
                debug!("event for unknown subscription {} on {}", subscription_id, relay_url);
                return;
            };
            let offered = subscription.offer(SubscriptionMessage::Event {
                relay_url: relay_url.to_string(),
                event,
            });
            match offered {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("consumer of {} is behind; dropped event from {}", subscription_id, relay_url);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("consumer of {} on {} went away", subscription_id, relay_url);
                    subscriptions.lock().await.remove(&subscription_id);
                }
            }
        }
        RelayMessage::Eose(subscription_id) => {
            let subscription = { subscriptions.lock().await.get(&subscription_id).cloned() };
            if let Some(subscription) = subscription {
                deliver_control(
                    subscription,
                    SubscriptionMessage::Eose {
                        relay_url: relay_url.to_string(),
                    },
                );
            }
        }
        RelayMessage::Closed(subscription_id, reason) => {
            debug!("{} closed {}: {}", relay_url, subscription_id, reason);
            let subscription = { subscriptions.lock().await.remove(&subscription_id) };
            if let Some(subscription) = subscription {
                deliver_control(
                    subscription,
                    SubscriptionMessage::Closed {
                        relay_url: relay_url.to_string(),
                        reason,
                    },
                );
            }
        }
        RelayMessage::Ok(event_id, accepted, message) => {
            if let Some(ack) = pending.lock().await.remove(&event_id) {
                let _ = ack.send((accepted, message));
            }
        }
        RelayMessage::Notice(message) => warn!("notice from {}: {}", relay_url, message),
        RelayMessage::Auth(_) => debug!("{} requested auth; not supported", relay_url),
    }
}

/// EOSE and CLOSED must reach the consumer. When its channel is full the
/// message is handed to a task so the receive loop keeps reading.
fn deliver_control(subscription: Subscription, message: SubscriptionMessage) {
    if let Err(TrySendError::Full(message)) = subscription.offer(message) {
        tokio::spawn(async move {
            let _ = subscription.deliver(message).await;
        });
    }
}

/// Signal every live subscription that the relay is gone and fail pending publishes.
async fn close_all(
    relay_url: &str,
    subscriptions: &Subscriptions,
    pending: &PendingPublishes,
    reason: &str,
) {
    let drained: Vec<Subscription> = {
        let mut guard = subscriptions.lock().await;
        guard.drain().map(|(_, subscription)| subscription).collect()
    };
    for subscription in drained {
        if let Err(error) = subscription.try_deliver(SubscriptionMessage::Closed {
            relay_url: relay_url.to_string(),
            reason: reason.to_string(),
        }) {
            debug!("dropping close notice on {}: {}", relay_url, error);
        }
    }
    pending.lock().await.clear();
}

/// `["REQ", id, filter...]` with each filter as its own element.
fn req_frame(subscription: &Subscription) -> Value {
    let mut frame = vec![json!("REQ"), json!(subscription.id)];
    frame.extend(subscription.filters.iter().map(Filter::to_json));
    Value::Array(frame)
}

fn text_at<'a>(frame: &'a [Value], index: usize, what: &str) -> Result<&'a str> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::Protocol(format!("invalid {what}")))
}

/// Parse one inbound text frame. Unknown message kinds yield `None`.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let frame = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
    let Some(kind) = frame.first() else {
        return Ok(None);
    };
    let kind = kind
        .as_str()
        .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

    let message = match kind {
        "EVENT" => {
            let subscription_id = text_at(frame, 1, "EVENT subscription id")?.to_string();
            let payload = frame
                .get(2)
                .cloned()
                .ok_or_else(|| ClientError::Protocol("invalid EVENT message".to_string()))?;
            let event: Event = serde_json::from_value(payload)
                .map_err(|error| ClientError::Protocol(format!("invalid EVENT payload: {error}")))?;
            RelayMessage::Event(subscription_id, event)
        }
        "OK" => {
            let event_id = text_at(frame, 1, "OK event id")?.to_string();
            let accepted = frame
                .get(2)
                .and_then(Value::as_bool)
                .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
            // Some relays omit the message on success.
            let message = frame.get(3).and_then(Value::as_str).unwrap_or_default();
            RelayMessage::Ok(event_id, accepted, message.to_string())
        }
        "EOSE" => RelayMessage::Eose(text_at(frame, 1, "EOSE subscription id")?.to_string()),
        "CLOSED" => {
            let subscription_id = text_at(frame, 1, "CLOSED subscription id")?.to_string();
            let reason = frame.get(2).and_then(Value::as_str).unwrap_or_default();
            RelayMessage::Closed(subscription_id, reason.to_string())
        }
        "NOTICE" => RelayMessage::Notice(text_at(frame, 1, "NOTICE text")?.to_string()),
        "AUTH" => RelayMessage::Auth(text_at(frame, 1, "AUTH challenge")?.to_string()),
        _ => return Ok(None),
    };
    Ok(Some(message))
}
