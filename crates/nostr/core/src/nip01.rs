//! NIP-01: event structure, serialization, signing and verification.
//!
//! Events are content-addressed: the id is the sha256 of
//! `[0, pubkey, created_at, kind, tags, content]` and the signature is a
//! BIP-340 Schnorr signature over that id.

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A template for creating events. The pubkey comes from the signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

impl EventTemplate {
    /// Template stamped with the current time.
    pub fn now(kind: u16, tags: Vec<Vec<String>>, content: impl Into<String>) -> Self {
        Self {
            created_at: now_unix_seconds(),
            kind,
            tags,
            content: content.into(),
        }
    }
}

/// Current unix time in seconds. A clock before the epoch reads as zero.
pub fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

fn parse_secret_key(secret_key: &[u8; 32]) -> Result<SecretKey, Nip01Error> {
    SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::InvalidPublicKey(e.to_string()))
}

/// Get the public key as a hex string (x-only, 32 bytes) from a secret key.
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    let secp = Secp256k1::new();
    let sk = parse_secret_key(secret_key)?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(hex::encode(xonly.serialize()))
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !is_lower_hex(&event.pubkey, 64) {
        return Err(Nip01Error::InvalidEvent(
            "can't serialize event with wrong or missing properties".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

fn event_digest(event: &UnsignedEvent) -> Result<[u8; 32], Nip01Error> {
    let serialized = serialize_event(event)?;
    Ok(sha256::Hash::hash(serialized.as_bytes()).to_byte_array())
}

/// Get the event hash (id) from an unsigned event.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    Ok(hex::encode(event_digest(event)?))
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Validate a signed event's shape (not including signature verification).
pub fn validate_event(event: &Event) -> bool {
    is_lower_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_lower_hex(&event.sig, 128)
}

/// Sign an event template with a secret key, producing a complete signed event.
pub fn finalize_event(
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly_pk, _parity) = keypair.x_only_public_key();

    let unsigned = UnsignedEvent {
        pubkey: hex::encode(xonly_pk.serialize()),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };

    let digest = event_digest(&unsigned)?;
    let message = Message::from_digest(digest);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);

    Ok(Event {
        id: hex::encode(digest),
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: hex::encode(sig.serialize()),
    })
}

/// Verify an event's id and signature.
pub fn verify_event(event: &Event) -> Result<bool, Nip01Error> {
    if !validate_event(event) {
        return Ok(false);
    }

    let unsigned = UnsignedEvent {
        pubkey: event.pubkey.clone(),
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    let digest = event_digest(&unsigned)?;
    if hex::encode(digest) != event.id {
        return Ok(false);
    }

    let sig_bytes = hex::decode(&event.sig)
        .map_err(|e| Nip01Error::Verification(format!("invalid sig hex: {}", e)))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid signature: {}", e)))?;
    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| Nip01Error::Verification(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid pubkey: {}", e)))?;

    let secp = Secp256k1::verification_only();
    Ok(secp
        .verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PRIVATE_KEY: &str =
        "d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf";

    fn test_private_key() -> Result<[u8; 32], Box<dyn std::error::Error>> {
        let bytes = hex::decode(TEST_PRIVATE_KEY)?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    }

    fn channel_message_template() -> EventTemplate {
        EventTemplate {
            created_at: 1_617_932_115,
            kind: 42,
            tags: vec![vec![
                "e".to_string(),
                "chan".to_string(),
                String::new(),
                "root".to_string(),
            ]],
            content: "gm".to_string(),
        }
    }

    #[test]
    fn serialize_event_matches_canonical_form() -> Result<(), Box<dyn std::error::Error>> {
        let public_key = get_public_key_hex(&test_private_key()?)?;
        let unsigned = UnsignedEvent {
            pubkey: public_key.clone(),
            created_at: 1_617_932_115,
            kind: 1,
            tags: vec![],
            content: "Hello, world!".to_string(),
        };

        let expected = format!("[0,\"{}\",1617932115,1,[],\"Hello, world!\"]", public_key);
        assert_eq!(serialize_event(&unsigned)?, expected);
        Ok(())
    }

    #[test]
    fn serialize_event_rejects_uppercase_pubkey() -> Result<(), Box<dyn std::error::Error>> {
        let unsigned = UnsignedEvent {
            pubkey: get_public_key_hex(&test_private_key()?)?.to_uppercase(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
        };
        assert!(serialize_event(&unsigned).is_err());
        Ok(())
    }

    #[test]
    fn finalized_event_verifies() -> Result<(), Box<dyn std::error::Error>> {
        let key = test_private_key()?;
        let template = channel_message_template();
        let event = finalize_event(&template, &key)?;

        assert_eq!(event.pubkey, get_public_key_hex(&key)?);
        assert_eq!(event.tags, template.tags);
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        assert!(verify_event(&event)?);
        Ok(())
    }

    #[test]
    fn tampered_content_fails_verification() -> Result<(), Box<dyn std::error::Error>> {
        let mut event = finalize_event(&channel_message_template(), &test_private_key()?)?;
        event.content = "gn".to_string();
        assert!(!verify_event(&event)?);
        Ok(())
    }

    #[test]
    fn event_id_is_deterministic() -> Result<(), Box<dyn std::error::Error>> {
        let key = test_private_key()?;
        let first = finalize_event(&channel_message_template(), &key)?;
        let second = finalize_event(&channel_message_template(), &key)?;
        assert_eq!(first.id, second.id);
        Ok(())
    }

    #[test]
    fn event_json_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let event = finalize_event(&channel_message_template(), &test_private_key()?)?;
        let decoded: Event = serde_json::from_str(&serde_json::to_string(&event)?)?;
        assert_eq!(decoded, event);
        Ok(())
    }
}
