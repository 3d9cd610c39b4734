use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, Filter};
use raven::{
    BackgroundBridge, BridgeConfig, KeySigner, MemoryTransport, Metadata, NoSigner,
    PassthroughCipher, Raven, RavenConfig, RavenError, RavenEvent, RelayEntry, RelayTransport,
    TransportFactory, subscriptions,
};
use tokio::sync::broadcast;

const RELAY_A: &str = "wss://a.example";
const RELAY_B: &str = "wss://b.example";
const PEER: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

fn key() -> KeySigner {
    KeySigner::from_hex(&"01".repeat(32)).unwrap()
}

fn config(relays: &[&str]) -> RavenConfig {
    let mut config = RavenConfig::default();
    for relay in relays {
        config.add_relay(RelayEntry::read_write(*relay));
    }
    config
}

fn raw(id: &str, kind: u16, pubkey: &str, created_at: u64, tags: &[&[&str]], content: &str) -> Event {
    Event {
        id: id.to_string(),
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags: tags
            .iter()
            .map(|tag| tag.iter().map(|part| (*part).to_string()).collect())
            .collect(),
        content: content.to_string(),
        sig: String::new(),
    }
}

async fn transport(relays: &[&str]) -> Arc<MemoryTransport> {
    let transport = Arc::new(MemoryTransport::new());
    for relay in relays {
        transport.add_relay(relay).await;
    }
    transport
}

/// Receive until an event with `label` arrives, or fail after a minute of
/// (virtual) silence.
async fn wait_for(events: &mut broadcast::Receiver<RavenEvent>, label: &str) -> RavenEvent {
    loop {
        match tokio::time::timeout(Duration::from_secs(60), events.recv()).await {
            Ok(Ok(event)) if event.label() == label => return event,
            Ok(Ok(_)) => {}
            Ok(Err(error)) => panic!("event stream failed while waiting for {label}: {error}"),
            Err(_) => panic!("timed out waiting for {label}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_init_without_identity_only_signals_lifecycle() {
    let transport = transport(&[RELAY_A]).await;
    let raven = Raven::new(
        config(&[RELAY_A]),
        transport.clone(),
        Arc::new(NoSigner::new()),
        Arc::new(PassthroughCipher),
    );
    let mut events = raven.events();

    raven.connect().await;
    raven.init().await;

    assert_eq!(events.recv().await.unwrap(), RavenEvent::Ready);
    assert_eq!(events.recv().await.unwrap(), RavenEvent::DmsDone);
    assert_eq!(events.recv().await.unwrap(), RavenEvent::SyncDone);
    assert_eq!(transport.subscribe_calls().await, 0);
    assert!(!raven.start_inbox().await);
}

#[tokio::test(start_paused = true)]
async fn test_init_syncs_own_channels_and_direct_messages() {
    let signer = key();
    let me = signer.public_key().to_string();
    let transport = transport(&[RELAY_A]).await;
    transport
        .store(
            RELAY_A,
            [
                raw("chan1", 40, &me, 10, &[], r#"{"name":"rust","about":"","picture":""}"#),
                raw("m1", 42, PEER, 20, &[&["e", "chan1", "", "root"]], "hello"),
                raw("dm1", 4, PEER, 30, &[&["p", me.as_str()]], "psst"),
            ],
        )
        .await;

    let raven = Raven::new(
        config(&[RELAY_A]),
        transport.clone(),
        Arc::new(signer),
        Arc::new(PassthroughCipher),
    );
    let mut lifecycle = raven.events();
    let mut channels = raven.events();
    let mut messages = raven.events();
    let mut dms = raven.events();

    raven.connect().await;
    raven.init().await;

    wait_for(&mut lifecycle, "ready").await;
    wait_for(&mut lifecycle, "dms_done").await;
    wait_for(&mut lifecycle, "sync_done").await;

    let RavenEvent::ChannelCreation(created) = wait_for(&mut channels, "channel_creation").await else {
        unreachable!()
    };
    assert_eq!(created[0].id, "chan1");
    assert_eq!(created[0].name, "rust");

    let RavenEvent::PublicMessage(posted) = wait_for(&mut messages, "public_message").await else {
        unreachable!()
    };
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].root, "chan1");

    let RavenEvent::DirectMessage(received) = wait_for(&mut dms, "direct_message").await else {
        unreachable!()
    };
    assert_eq!(received[0].peer, PEER);
    assert_eq!(received[0].content, "psst");
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_events_from_two_relays_form_one_object() {
    let transport = transport(&[RELAY_A, RELAY_B]).await;
    let message = raw("m1", 42, PEER, 20, &[&["e", "chan1", "", "root"]], "hello");
    transport.store(RELAY_A, [message.clone()]).await;
    transport.store(RELAY_B, [message]).await;

    let raven = Raven::new(
        config(&[RELAY_A, RELAY_B]),
        transport.clone(),
        Arc::new(NoSigner::new()),
        Arc::new(PassthroughCipher),
    );
    let mut events = raven.events();
    raven.connect().await;

    // Both copies come back from the fetch; intake keeps one.
    let fetched = raven.fetch_prev_messages("chan1", 100).await;
    assert_eq!(fetched.len(), 2);

    let RavenEvent::PublicMessage(posted) = wait_for(&mut events, "public_message").await else {
        unreachable!()
    };
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].id, "m1");
}

#[tokio::test(start_paused = true)]
async fn test_fetch_from_stalled_relay_is_bounded() {
    let transport = transport(&[RELAY_A]).await;
    transport
        .store(RELAY_A, [raw("p1", 0, PEER, 5, &[], r#"{"name":"bob"}"#)])
        .await;
    transport.stall(RELAY_A).await;

    let raven = Raven::new(
        config(&[RELAY_A]),
        transport.clone(),
        Arc::new(NoSigner::new()),
        Arc::new(PassthroughCipher),
    );
    raven.connect().await;

    let started = tokio::time::Instant::now();
    let events = raven
        .fetch_events(vec![Filter::new().kind(0)], Some(Duration::from_secs(2)))
        .await;
    assert_eq!(events.len(), 1);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(transport.open_subscriptions().await.is_empty());

    let profile = raven.fetch_profile(PEER).await.unwrap();
    assert_eq!(profile.name, "bob");
}

#[tokio::test]
async fn test_publishing_without_key_fails_without_io() {
    let transport = transport(&[RELAY_A]).await;
    let raven = Raven::new(
        config(&[RELAY_A]),
        transport.clone(),
        Arc::new(NoSigner::watching(PEER)),
        Arc::new(PassthroughCipher),
    );
    raven.connect().await;
    assert!(!raven.can_publish());

    let result = raven.send_public_message("chan1", "hi", &[], None).await;
    assert!(matches!(result, Err(RavenError::CannotPublish)));
    let result = raven.create_channel(Metadata::new("x", "", "")).await;
    assert!(matches!(result, Err(RavenError::CannotPublish)));
    assert_eq!(transport.publish_calls().await, 0);
}

#[tokio::test]
async fn test_created_channel_round_trips() {
    let transport = transport(&[RELAY_A]).await;
    let raven = Raven::new(
        config(&[RELAY_A]),
        transport.clone(),
        Arc::new(key()),
        Arc::new(PassthroughCipher),
    );
    raven.connect().await;

    let created = raven
        .create_channel(Metadata::new("rust", "systems talk", "https://example.com/r.png"))
        .await
        .unwrap();
    let fetched = raven.fetch_channel(&created.id).await;
    assert_eq!(fetched, Some(created.clone()));

    raven
        .update_channel(&created, Metadata::new("rust-lang", "", ""))
        .await
        .unwrap();
    let updated = raven.fetch_channel(&created.id).await.unwrap();
    assert_eq!(updated.name, "rust-lang");
    assert_eq!(updated.creator, created.creator);
}

#[tokio::test(start_paused = true)]
async fn test_inbox_delivers_live_direct_messages() {
    let signer = key();
    let me = signer.public_key().to_string();
    let transport = transport(&[RELAY_A]).await;
    let raven = Raven::new(
        config(&[RELAY_A]),
        transport.clone(),
        Arc::new(signer),
        Arc::new(PassthroughCipher),
    );
    let mut events = raven.events();
    raven.connect().await;

    assert!(raven.start_inbox().await);
    assert_eq!(raven.active_subscriptions().await, vec![subscriptions::INBOX.to_string()]);

    transport
        .inject(RELAY_A, raw("dm1", 4, PEER, 30, &[&["p", me.as_str()]], "live"))
        .await;
    let RavenEvent::DirectMessage(received) = wait_for(&mut events, "direct_message").await else {
        unreachable!()
    };
    assert_eq!(received[0].content, "live");

    raven.shutdown().await;
    assert!(raven.active_subscriptions().await.is_empty());
    assert_eq!(transport.shutdowns().await, 1);
}

struct MemoryFactory(Arc<MemoryTransport>);

#[async_trait]
impl TransportFactory for MemoryFactory {
    async fn create(&self, relays: &[String]) -> Arc<dyn RelayTransport> {
        self.0.connect(relays, Duration::from_secs(1)).await;
        self.0.clone()
    }
}

#[tokio::test(start_paused = true)]
async fn test_bridge_locates_the_relay_carrying_an_event() {
    let transport = transport(&[RELAY_A, RELAY_B]).await;
    transport
        .store(RELAY_B, [raw("e1", 1, PEER, 1, &[], "note")])
        .await;

    let bridge = BackgroundBridge::spawn(
        BridgeConfig::new(vec![RELAY_A.to_string(), RELAY_B.to_string()]),
        Arc::new(MemoryFactory(transport)),
    );
    assert_eq!(bridge.locate_relay("e1").await.unwrap(), RELAY_B);
    bridge.shutdown().await.unwrap();
}
