//! Minimal Nostr relay client transport.
//!
//! This crate intentionally exposes a small surface:
//! - relay publish (with `OK` acknowledgement) and subscribe over WebSocket
//! - multi-relay pool fanout with per-relay EOSE/CLOSED signalling

pub mod error;
pub mod pool;
pub mod relay;
pub mod subscription;

pub use error::{ClientError, Result};
pub use pool::{ConnectReport, PoolConfig, RelayPool};
pub use relay::{ConnectionState, PublishConfirmation, RelayConfig, RelayConnection, RelayMessage};
pub use subscription::{Subscription, SubscriptionMessage, SubscriptionStream};
