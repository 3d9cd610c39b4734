//! Event kinds handled by the chat engine outside of NIP-28.

/// Kind 0: user metadata (NIP-01).
pub const KIND_METADATA: u16 = 0;

/// Kind 2: recommend relay (deprecated NIP-01 kind still used by chat clients).
pub const KIND_RECOMMEND_RELAY: u16 = 2;

/// Kind 4: encrypted direct message (NIP-04).
pub const KIND_ENCRYPTED_DIRECT_MESSAGE: u16 = 4;

/// Kind 5: event deletion (NIP-09).
pub const KIND_EVENT_DELETION: u16 = 5;

/// Kind 7: reaction (NIP-25).
pub const KIND_REACTION: u16 = 7;

/// Kind 10000: mute list (NIP-51).
pub const KIND_MUTE_LIST: u16 = 10000;

/// Kind 30078: application-specific data (NIP-78).
pub const KIND_APP_DATA: u16 = 30078;

/// `d` identifier of the app-data event holding per-chat read marks.
pub const READ_MARK_MAP_IDENTIFIER: &str = "read-mark-map";
