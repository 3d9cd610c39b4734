//! Background sync bridge.
//!
//! An actor task that owns its own transport, recycled after a fixed TTL,
//! and answers fetch, subscribe and relay-location requests sent through a
//! cloneable [`BridgeHandle`]. Every event it sees records which relay
//! delivered it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, Filter};
use nostr_client::{PoolConfig, RelayPool};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RavenConfig;
use crate::transport::{RelayTransport, StreamItem};

const LOCATE_ATTEMPTS: usize = 3;
const SUBSCRIPTION_CAPACITY: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("event {0} was not seen on any relay")]
    NotFound(String),
    #[error("no reachable relay carries event {0}")]
    NoHealthyRelay(String),
    #[error("background bridge has stopped")]
    Closed,
}

/// Builds a fresh, connected transport for the bridge.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, relays: &[String]) -> Arc<dyn RelayTransport>;
}

/// WebSocket pools, one per TTL period.
#[derive(Debug, Clone)]
pub struct PoolFactory {
    pool_config: PoolConfig,
    connect_timeout: Duration,
}

impl PoolFactory {
    pub fn new(pool_config: PoolConfig, connect_timeout: Duration) -> Self {
        Self {
            pool_config,
            connect_timeout,
        }
    }
}

#[async_trait]
impl TransportFactory for PoolFactory {
    async fn create(&self, relays: &[String]) -> Arc<dyn RelayTransport> {
        let pool = RelayPool::new(self.pool_config.clone());
        let report = pool.connect(relays, self.connect_timeout).await;
        debug!(
            "bridge pool connected {} of {} relays",
            report.connected.len(),
            relays.len()
        );
        Arc::new(pool)
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub relays: Vec<String>,
    /// Age after which the transport is replaced.
    pub ttl: Duration,
    /// Idle bound for each lookup attempt of `locate_relay`.
    pub locate_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(relays: Vec<String>) -> Self {
        Self {
            relays,
            ttl: Duration::from_secs(120),
            locate_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &RavenConfig, relays: Vec<String>) -> Self {
        Self {
            relays,
            ttl: config.pool_ttl,
            locate_timeout: config.profile_timeout,
        }
    }
}

type Reply<T> = oneshot::Sender<T>;
type SeenOn = Arc<Mutex<HashMap<String, Vec<String>>>>;

enum Command {
    Fetch {
        filters: Vec<Filter>,
        quit: Option<Duration>,
        reply: Reply<Vec<Event>>,
    },
    Subscribe {
        filters: Vec<Filter>,
        close_on_eose: bool,
        reply: Reply<(String, mpsc::Receiver<Event>)>,
    },
    Unsubscribe {
        id: String,
        reply: Reply<()>,
    },
    Locate {
        event_id: String,
        reply: Reply<Result<String, BridgeError>>,
    },
    SeenOn {
        event_id: String,
        reply: Reply<Vec<String>>,
    },
    SetRelays {
        relays: Vec<String>,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl BridgeHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, BridgeError> {
        let (reply, response) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| BridgeError::Closed)?;
        response.await.map_err(|_| BridgeError::Closed)
    }

    /// One-shot query. With `quit = None` it ends when relays have sent what
    /// they store; with `Some(idle)` it ends once no event has arrived for
    /// `idle`.
    pub async fn fetch(&self, filters: Vec<Filter>, quit: Option<Duration>) -> Result<Vec<Event>, BridgeError> {
        self.request(|reply| Command::Fetch {
            filters,
            quit,
            reply,
        })
        .await
    }

    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        close_on_eose: bool,
    ) -> Result<(String, mpsc::Receiver<Event>), BridgeError> {
        self.request(|reply| Command::Subscribe {
            filters,
            close_on_eose,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(&self, id: &str) -> Result<(), BridgeError> {
        let id = id.to_string();
        self.request(|reply| Command::Unsubscribe { id, reply }).await
    }

    /// A reachable relay known to carry `event_id`.
    pub async fn locate_relay(&self, event_id: &str) -> Result<String, BridgeError> {
        let event_id = event_id.to_string();
        self.request(|reply| Command::Locate { event_id, reply })
            .await?
    }

    /// Relays that have delivered `event_id` so far.
    pub async fn seen_on(&self, event_id: &str) -> Result<Vec<String>, BridgeError> {
        let event_id = event_id.to_string();
        self.request(|reply| Command::SeenOn { event_id, reply })
            .await
    }

    /// Use `relays` from the next transport on; the current one is retired.
    pub async fn set_relays(&self, relays: Vec<String>) -> Result<(), BridgeError> {
        self.request(|reply| Command::SetRelays { relays, reply })
            .await
    }

    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct BridgeSubscription {
    transport: Arc<dyn RelayTransport>,
    task: JoinHandle<()>,
}

pub struct BackgroundBridge {
    config: BridgeConfig,
    factory: Arc<dyn TransportFactory>,
    transport: Option<(Arc<dyn RelayTransport>, Instant)>,
    seen_on: SeenOn,
    subscriptions: Arc<Mutex<HashMap<String, BridgeSubscription>>>,
}

impl BackgroundBridge {
    /// Start the actor on its own task.
    pub fn spawn(config: BridgeConfig, factory: Arc<dyn TransportFactory>) -> BridgeHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = Self {
            config,
            factory,
            transport: None,
            seen_on: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        };
        tokio::spawn(bridge.run(rx));
        BridgeHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Fetch {
                    filters,
                    quit,
                    reply,
                } => {
                    let transport = self.transport().await;
                    let relays = self.config.relays.clone();
                    let seen_on = Arc::clone(&self.seen_on);
                    tokio::spawn(async move {
                        let stop_at_eose = quit.is_none();
                        let events =
                            collect(transport, relays, filters, quit, stop_at_eose, seen_on).await;
                        let _ = reply.send(events);
                    });
                }
                Command::Subscribe {
                    filters,
                    close_on_eose,
                    reply,
                } => {
                    let subscription = self.subscribe(filters, close_on_eose).await;
                    let _ = reply.send(subscription);
                }
                Command::Unsubscribe { id, reply } => {
                    let removed = self.subscriptions.lock().await.remove(&id);
                    if let Some(subscription) = removed {
                        subscription.task.abort();
                        subscription.transport.unsubscribe(&id).await;
                    }
                    let _ = reply.send(());
                }
                Command::Locate { event_id, reply } => {
                    let transport = self.transport().await;
                    let relays = self.config.relays.clone();
                    let seen_on = Arc::clone(&self.seen_on);
                    let idle = self.config.locate_timeout;
                    tokio::spawn(async move {
                        let located = locate(transport, relays, event_id, idle, seen_on).await;
                        let _ = reply.send(located);
                    });
                }
                Command::SeenOn { event_id, reply } => {
                    let relays = self
                        .seen_on
                        .lock()
                        .await
                        .get(&event_id)
                        .cloned()
                        .unwrap_or_default();
                    let _ = reply.send(relays);
                }
                Command::SetRelays { relays, reply } => {
                    self.config.relays = relays;
                    self.retire().await;
                    let _ = reply.send(());
                }
                Command::Shutdown { reply } => {
                    self.close_subscriptions().await;
                    self.retire().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("background bridge stopped");
    }

    /// The live transport, replaced once it is older than the TTL.
    async fn transport(&mut self) -> Arc<dyn RelayTransport> {
        if let Some((transport, created)) = &self.transport {
            if created.elapsed() < self.config.ttl {
                return Arc::clone(transport);
            }
            info!("recycling bridge transport after {:?}", self.config.ttl);
            // Provenance is only kept for the lifetime of one transport.
            self.seen_on.lock().await.clear();
        }
        self.retire().await;

        let transport = self.factory.create(&self.config.relays).await;
        self.transport = Some((Arc::clone(&transport), Instant::now()));
        transport
    }

    async fn retire(&mut self) {
        if let Some((old, _)) = self.transport.take() {
            old.shutdown().await;
        }
    }

    async fn close_subscriptions(&self) {
        let drained: Vec<(String, BridgeSubscription)> =
            self.subscriptions.lock().await.drain().collect();
        for (id, subscription) in drained {
            subscription.task.abort();
            subscription.transport.unsubscribe(&id).await;
        }
    }

    async fn subscribe(
        &mut self,
        filters: Vec<Filter>,
        close_on_eose: bool,
    ) -> (String, mpsc::Receiver<Event>) {
        let id = Uuid::new_v4().simple().to_string();
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let transport = self.transport().await;

        let mut stream = match transport.subscribe(&self.config.relays, &id, filters).await {
            Ok(stream) => stream,
            Err(error) => {
                // Dropping the sender ends the receiver straight away.
                warn!("bridge subscription {} failed: {}", id, error);
                return (id, receiver);
            }
        };

        let mut registry = self.subscriptions.lock().await;
        let task = {
            let id = id.clone();
            let transport = Arc::clone(&transport);
            let seen_on = Arc::clone(&self.seen_on);
            let subscriptions = Arc::clone(&self.subscriptions);
            tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    match item {
                        StreamItem::Event { relay_url, event } => {
                            record(&seen_on, &event.id, relay_url).await;
                            if sender.send(event).await.is_err() {
                                break;
                            }
                        }
                        StreamItem::EndOfStored if close_on_eose => break,
                        StreamItem::EndOfStored => {}
                    }
                }
                transport.unsubscribe(&id).await;
                subscriptions.lock().await.remove(&id);
            })
        };
        registry.insert(id.clone(), BridgeSubscription { transport, task });
        (id, receiver)
    }
}

async fn record(seen_on: &SeenOn, event_id: &str, relay_url: String) {
    let mut seen_on = seen_on.lock().await;
    let relays = seen_on.entry(event_id.to_string()).or_default();
    if !relays.contains(&relay_url) {
        relays.push(relay_url);
    }
}

async fn collect(
    transport: Arc<dyn RelayTransport>,
    relays: Vec<String>,
    filters: Vec<Filter>,
    quit: Option<Duration>,
    stop_at_eose: bool,
    seen_on: SeenOn,
) -> Vec<Event> {
    let id = Uuid::new_v4().simple().to_string();
    let mut stream = match transport.subscribe(&relays, &id, filters).await {
        Ok(stream) => stream,
        Err(error) => {
            debug!("bridge fetch {} failed: {}", id, error);
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    loop {
        let item = match quit {
            Some(idle) => match timeout(idle, stream.next()).await {
                Ok(item) => item,
                Err(_) => break,
            },
            None => stream.next().await,
        };
        match item {
            Some(StreamItem::Event { relay_url, event }) => {
                record(&seen_on, &event.id, relay_url).await;
                events.push(event);
            }
            Some(StreamItem::EndOfStored) if stop_at_eose => break,
            Some(StreamItem::EndOfStored) => {}
            None => break,
        }
    }
    transport.unsubscribe(&id).await;
    events
}

async fn locate(
    transport: Arc<dyn RelayTransport>,
    relays: Vec<String>,
    event_id: String,
    idle: Duration,
    seen_on: SeenOn,
) -> Result<String, BridgeError> {
    let mut candidates = seen_on.lock().await.get(&event_id).cloned();
    let mut attempts = 0;
    while candidates.is_none() && attempts < LOCATE_ATTEMPTS {
        attempts += 1;
        let filter = Filter::new().ids([event_id.clone()]);
        collect(
            Arc::clone(&transport),
            relays.clone(),
            vec![filter],
            Some(idle),
            true,
            Arc::clone(&seen_on),
        )
        .await;
        candidates = seen_on.lock().await.get(&event_id).cloned();
    }

    let Some(candidates) = candidates else {
        return Err(BridgeError::NotFound(event_id));
    };
    for relay in candidates {
        match transport.ensure_relay(&relay).await {
            Ok(()) => return Ok(relay),
            Err(error) => debug!("{} is not healthy: {}", relay, error),
        }
    }
    Err(BridgeError::NoHealthyRelay(event_id))
}
