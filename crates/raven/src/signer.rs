//! Signing and encryption capabilities consumed by the engine.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use nostr::{Event, EventTemplate, Nip01Error, finalize_event, get_public_key_hex};

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("no signing key available")]
    NoKey,
    #[error("signing is delegated to an external extension")]
    External,
    #[error("invalid secret key: {0}")]
    InvalidKey(String),
    #[error(transparent)]
    Event(#[from] Nip01Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// The identity the engine acts as.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex public key, if known.
    fn identity(&self) -> Option<String>;

    /// Placeholder identities (no key, or a key held by an extension) can
    /// read but never author events.
    fn is_synthetic(&self) -> bool;

    async fn sign(&self, template: EventTemplate) -> Result<Event, SignerError>;
}

/// Direct-message encryption boundary.
#[async_trait]
pub trait Cipher: Send + Sync {
    async fn encrypt(&self, peer: &str, plaintext: &str) -> Result<String, CipherError>;
    async fn decrypt(&self, peer: &str, ciphertext: &str) -> Result<String, CipherError>;
}

/// Signs locally with a raw secp256k1 key.
pub struct KeySigner {
    secret_key: [u8; 32],
    public_key: String,
}

impl KeySigner {
    pub fn from_bytes(secret_key: [u8; 32]) -> Result<Self, SignerError> {
        let public_key = get_public_key_hex(&secret_key)
            .map_err(|error| SignerError::InvalidKey(error.to_string()))?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    pub fn from_hex(secret_key_hex: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(secret_key_hex.trim())
            .map_err(|error| SignerError::InvalidKey(error.to_string()))?;
        let secret_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignerError::InvalidKey("expected 32 bytes".to_string()))?;
        Self::from_bytes(secret_key)
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

impl fmt::Debug for KeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySigner")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for KeySigner {
    fn identity(&self) -> Option<String> {
        Some(self.public_key.clone())
    }

    fn is_synthetic(&self) -> bool {
        false
    }

    async fn sign(&self, template: EventTemplate) -> Result<Event, SignerError> {
        Ok(finalize_event(&template, &self.secret_key)?)
    }
}

/// Read-only identity: may know a public key to sync for, never signs.
#[derive(Debug, Clone, Default)]
pub struct NoSigner {
    identity: Option<String>,
}

impl NoSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watching(pubkey: impl Into<String>) -> Self {
        Self {
            identity: Some(pubkey.into()),
        }
    }
}

#[async_trait]
impl Signer for NoSigner {
    fn identity(&self) -> Option<String> {
        self.identity.clone()
    }

    fn is_synthetic(&self) -> bool {
        true
    }

    async fn sign(&self, _template: EventTemplate) -> Result<Event, SignerError> {
        Err(SignerError::NoKey)
    }
}

/// Identity whose key lives in an external signer this engine cannot reach.
#[derive(Debug, Clone)]
pub struct ExtensionSigner {
    pubkey: String,
}

impl ExtensionSigner {
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
        }
    }
}

#[async_trait]
impl Signer for ExtensionSigner {
    fn identity(&self) -> Option<String> {
        Some(self.pubkey.clone())
    }

    fn is_synthetic(&self) -> bool {
        true
    }

    async fn sign(&self, _template: EventTemplate) -> Result<Event, SignerError> {
        Err(SignerError::External)
    }
}

/// Map a stored key string to a signer: `"none"`, `"nip07"` or 64 hex chars.
///
/// `pubkey` supplies the identity for the two placeholder forms.
pub fn signer_from_priv(
    priv_key: &str,
    pubkey: Option<&str>,
) -> Result<Arc<dyn Signer>, SignerError> {
    match priv_key.trim() {
        "" | "none" => Ok(Arc::new(match pubkey {
            Some(pubkey) => NoSigner::watching(pubkey),
            None => NoSigner::new(),
        })),
        "nip07" => pubkey
            .map(|pubkey| Arc::new(ExtensionSigner::new(pubkey)) as Arc<dyn Signer>)
            .ok_or_else(|| SignerError::InvalidKey("nip07 requires a public key".to_string())),
        key if key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit()) => {
            Ok(Arc::new(KeySigner::from_hex(key)?))
        }
        _ => Err(SignerError::InvalidKey(
            "expected 'none', 'nip07' or a 64-character hex key".to_string(),
        )),
    }
}

/// Returns its input unchanged in both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCipher;

#[async_trait]
impl Cipher for PassthroughCipher {
    async fn encrypt(&self, _peer: &str, plaintext: &str) -> Result<String, CipherError> {
        Ok(plaintext.to_string())
    }

    async fn decrypt(&self, _peer: &str, ciphertext: &str) -> Result<String, CipherError> {
        Ok(ciphertext.to_string())
    }
}
