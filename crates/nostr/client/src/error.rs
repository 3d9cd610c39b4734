use thiserror::Error;

/// Failures talking to relays.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("cannot connect: {0}")]
    Connection(String),

    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    #[error("subscription: {0}")]
    Subscription(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A frame that does not follow NIP-01.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
