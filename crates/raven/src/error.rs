//! Engine error types.
//!
//! Only write paths and explicit lookups return these. Read paths degrade to
//! empty results and log instead.

use crate::bridge::BridgeError;
use crate::signer::{CipherError, SignerError};
use nostr_client::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RavenError {
    #[error("cannot publish: no signing identity or identity is synthetic")]
    CannotPublish,

    #[error("no write relays available")]
    NoWriteRelays,

    #[error("no relay accepted the event: {0}")]
    PublishRejected(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] ClientError),

    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

pub type Result<T> = std::result::Result<T, RavenError>;
