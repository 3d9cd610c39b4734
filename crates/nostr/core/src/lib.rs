pub mod filter;
pub mod kinds;
pub mod nip01;
pub mod nip10;
pub mod nip28;
pub mod tag_parsing;

pub use filter::Filter;
pub use kinds::*;
pub use nip01::{
    Event, EventTemplate, Nip01Error, UnsignedEvent, finalize_event, get_event_hash,
    get_public_key_hex, now_unix_seconds, serialize_event, validate_event, verify_event,
};
pub use nip10::{EventReference, Marker, find_marked_reference};
pub use nip28::{
    ChannelMetadata, KIND_CHANNEL_CREATION, KIND_CHANNEL_HIDE_MESSAGE, KIND_CHANNEL_MESSAGE,
    KIND_CHANNEL_METADATA, KIND_CHANNEL_MUTE_USER,
};
