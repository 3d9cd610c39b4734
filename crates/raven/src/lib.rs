//! Raven: relay synchronization and event reconstruction for Nostr public chat.
//!
//! Raw events arrive from relays through one-shot fetches and live
//! subscriptions, are staged and deduplicated in the intake buffer, and are
//! rebuilt into typed domain objects that subscribers receive as
//! [`RavenEvent`] batches. The [`Publisher`] signs and broadcasts new events
//! and echoes the resulting objects locally.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod intake;
pub mod model;
pub mod publisher;
pub mod reconstruct;
pub mod relay_set;
pub mod signer;
pub mod subscriptions;
pub mod transport;

pub use bridge::{BackgroundBridge, BridgeConfig, BridgeError, BridgeHandle, PoolFactory, TransportFactory};
pub use config::{ConfigError, RavenConfig, RelayEntry};
pub use engine::Raven;
pub use error::{RavenError, Result};
pub use fetch::{FetchEngine, FetchOutcome, FetchReport, FetchStrategy};
pub use intake::{DebounceTimer, IntakeBuffer};
pub use model::{
    Channel, ChannelMessageHide, ChannelUpdate, ChannelUserMute, DirectMessage, EventDeletion,
    Metadata, MuteList, Profile, PublicMessage, RavenEvent, Reaction, ReadMarkMap,
};
pub use publisher::Publisher;
pub use reconstruct::{EventKind, ReconstructionPipeline};
pub use relay_set::{BOOTSTRAP_RELAYS, RelayRole, RelaySet, RelaySetResolver};
pub use signer::{
    Cipher, CipherError, ExtensionSigner, KeySigner, NoSigner, PassthroughCipher, Signer,
    SignerError, signer_from_priv,
};
pub use subscriptions::SubscriptionManager;
pub use transport::memory::MemoryTransport;
pub use transport::{ConnectReport, EventStream, RelayTransport, StreamItem};
