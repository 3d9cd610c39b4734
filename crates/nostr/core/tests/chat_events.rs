//! Integration tests for signed NIP-28 chat events.

use nostr::nip28::{
    ChannelMetadata, KIND_CHANNEL_CREATION, KIND_CHANNEL_MESSAGE, channel_address,
    channel_root_tag, reply_tag,
};
use nostr::{
    EventTemplate, Filter, Marker, find_marked_reference, finalize_event, get_public_key_hex,
    verify_event,
};

const SECRET_KEY: [u8; 32] = [7u8; 32];

#[test]
fn test_channel_creation_and_reply_thread() {
    let meta = ChannelMetadata::new("rust", "systems chat", "");
    let creation = finalize_event(
        &EventTemplate {
            created_at: 1_700_000_000,
            kind: KIND_CHANNEL_CREATION,
            tags: vec![],
            content: meta.to_content(),
        },
        &SECRET_KEY,
    )
    .unwrap();
    assert!(verify_event(&creation).unwrap());
    assert_eq!(ChannelMetadata::from_content(&creation.content), meta);

    let message = finalize_event(
        &EventTemplate {
            created_at: 1_700_000_010,
            kind: KIND_CHANNEL_MESSAGE,
            tags: vec![
                channel_root_tag(&creation.id),
                reply_tag("parent-message"),
                vec!["p".to_string(), creation.pubkey.clone()],
            ],
            content: "hello".to_string(),
        },
        &SECRET_KEY,
    )
    .unwrap();

    assert_eq!(
        find_marked_reference(&message.tags, Marker::Root),
        Some(creation.id.as_str())
    );
    assert_eq!(
        find_marked_reference(&message.tags, Marker::Reply),
        Some("parent-message")
    );

    let by_channel = Filter::new()
        .kind(KIND_CHANNEL_MESSAGE)
        .events([creation.id.clone()]);
    assert!(by_channel.matches(&message));
    assert!(!by_channel.matches(&creation));

    let by_author = Filter::new().authors([get_public_key_hex(&SECRET_KEY).unwrap()]);
    assert!(by_author.matches(&message));
    assert!(by_author.matches(&creation));

    assert_eq!(channel_address(&creation.id), format!("40:{}", creation.id));
}

#[test]
fn test_signed_event_survives_relay_json() {
    let event = finalize_event(
        &EventTemplate::now(KIND_CHANNEL_MESSAGE, vec![channel_root_tag("c")], "gm"),
        &SECRET_KEY,
    )
    .unwrap();

    let wire = serde_json::json!(["EVENT", "sub", event]).to_string();
    let parsed: serde_json::Value = serde_json::from_str(&wire).unwrap();
    let decoded: nostr::Event = serde_json::from_value(parsed[2].clone()).unwrap();

    assert_eq!(decoded, event);
    assert!(verify_event(&decoded).unwrap());
}
