use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// A configured relay and the roles it serves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayEntry {
    pub url: String,
    pub read: bool,
    pub write: bool,
}

impl RelayEntry {
    pub fn read_write(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            read: true,
            write: true,
        }
    }
}

impl FromStr for RelayEntry {
    type Err = String;

    /// `wss://relay`, `wss://relay#read` or `wss://relay#write`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (url, role) = match raw.rsplit_once('#') {
            Some((url, role)) => (url.trim(), Some(role.trim())),
            None => (raw, None),
        };
        if !(url.starts_with("wss://") || url.starts_with("ws://")) {
            return Err(format!("{url}: relay URL must use ws:// or wss://"));
        }
        let (read, write) = match role {
            None => (true, true),
            Some("read") => (true, false),
            Some("write") => (false, true),
            Some(other) => return Err(format!("{url}: unknown relay role '{other}'")),
        };
        Ok(Self {
            url: url.to_string(),
            read,
            write,
        })
    }
}

#[derive(Clone, Debug)]
pub struct RavenConfig {
    pub relays: Vec<RelayEntry>,
    /// Channels synced on `init` whether or not the identity has touched them.
    pub default_channels: Vec<String>,
    pub fetch_timeout: Duration,
    pub profile_timeout: Duration,
    pub connect_timeout: Duration,
    pub batch_delay: Duration,
    /// Flush the intake buffer early once this many events are staged.
    pub max_batch_size: Option<usize>,
    /// Filters in flight per fetch; 1 keeps filters sequential.
    pub fetch_concurrency: usize,
    pub messages_per_page: usize,
    pub filter_chunk_size: usize,
    pub pool_ttl: Duration,
    pub event_capacity: usize,
}

impl Default for RavenConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            default_channels: Vec::new(),
            fetch_timeout: Duration::from_millis(30_000),
            profile_timeout: Duration::from_millis(10_000),
            connect_timeout: Duration::from_millis(10_000),
            batch_delay: Duration::from_millis(100),
            max_batch_size: None,
            fetch_concurrency: 1,
            messages_per_page: 30,
            filter_chunk_size: 10,
            pool_ttl: Duration::from_secs(120),
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid RAVEN_RELAYS: {0}")]
    InvalidRelays(String),
    #[error("invalid RAVEN_FETCH_TIMEOUT_MS: {0}")]
    InvalidFetchTimeoutMs(String),
    #[error("invalid RAVEN_PROFILE_TIMEOUT_MS: {0}")]
    InvalidProfileTimeoutMs(String),
    #[error("invalid RAVEN_CONNECT_TIMEOUT_MS: {0}")]
    InvalidConnectTimeoutMs(String),
    #[error("invalid RAVEN_BATCH_DELAY_MS: {0}")]
    InvalidBatchDelayMs(String),
    #[error("invalid RAVEN_MAX_BATCH_SIZE: {0}")]
    InvalidMaxBatchSize(String),
    #[error("invalid RAVEN_FETCH_CONCURRENCY: {0}")]
    InvalidFetchConcurrency(String),
    #[error("invalid RAVEN_MESSAGES_PER_PAGE: {0}")]
    InvalidMessagesPerPage(String),
    #[error("invalid RAVEN_FILTER_CHUNK_SIZE: {0}")]
    InvalidFilterChunkSize(String),
    #[error("invalid RAVEN_POOL_TTL_SECS: {0}")]
    InvalidPoolTtlSecs(String),
    #[error("invalid RAVEN_EVENT_CAPACITY: {0}")]
    InvalidEventCapacity(String),
}

impl RavenConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let relays = lookup("RAVEN_RELAYS")
            .map(|raw| parse_relays(&raw))
            .transpose()
            .map_err(ConfigError::InvalidRelays)?
            .unwrap_or(defaults.relays);
        let default_channels = lookup("RAVEN_DEFAULT_CHANNELS")
            .map(|raw| split_list(&raw))
            .unwrap_or(defaults.default_channels);

        let fetch_timeout = parse_millis(
            &lookup,
            "RAVEN_FETCH_TIMEOUT_MS",
            defaults.fetch_timeout,
            ConfigError::InvalidFetchTimeoutMs,
        )?;
        let profile_timeout = parse_millis(
            &lookup,
            "RAVEN_PROFILE_TIMEOUT_MS",
            defaults.profile_timeout,
            ConfigError::InvalidProfileTimeoutMs,
        )?;
        let connect_timeout = parse_millis(
            &lookup,
            "RAVEN_CONNECT_TIMEOUT_MS",
            defaults.connect_timeout,
            ConfigError::InvalidConnectTimeoutMs,
        )?;
        let batch_delay = parse_millis(
            &lookup,
            "RAVEN_BATCH_DELAY_MS",
            defaults.batch_delay,
            ConfigError::InvalidBatchDelayMs,
        )?;
        let max_batch_size = lookup("RAVEN_MAX_BATCH_SIZE")
            .unwrap_or_else(|| "0".to_string())
            .trim()
            .parse::<usize>()
            .map_err(|error| ConfigError::InvalidMaxBatchSize(error.to_string()))
            .map(|size| (size > 0).then_some(size))?;
        let fetch_concurrency = parse_positive(
            &lookup,
            "RAVEN_FETCH_CONCURRENCY",
            defaults.fetch_concurrency,
            ConfigError::InvalidFetchConcurrency,
        )?;
        let messages_per_page = parse_positive(
            &lookup,
            "RAVEN_MESSAGES_PER_PAGE",
            defaults.messages_per_page,
            ConfigError::InvalidMessagesPerPage,
        )?;
        let filter_chunk_size = parse_positive(
            &lookup,
            "RAVEN_FILTER_CHUNK_SIZE",
            defaults.filter_chunk_size,
            ConfigError::InvalidFilterChunkSize,
        )?;
        let pool_ttl = lookup("RAVEN_POOL_TTL_SECS")
            .unwrap_or_else(|| defaults.pool_ttl.as_secs().to_string())
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|error| ConfigError::InvalidPoolTtlSecs(error.to_string()))?;
        let event_capacity = parse_positive(
            &lookup,
            "RAVEN_EVENT_CAPACITY",
            defaults.event_capacity,
            ConfigError::InvalidEventCapacity,
        )?;

        Ok(Self {
            relays,
            default_channels,
            fetch_timeout,
            profile_timeout,
            connect_timeout,
            batch_delay,
            max_batch_size,
            fetch_concurrency,
            messages_per_page,
            filter_chunk_size,
            pool_ttl,
            event_capacity,
        })
    }

    /// Add a relay unless its URL is already configured.
    pub fn add_relay(&mut self, entry: RelayEntry) {
        if !self.relays.iter().any(|existing| existing.url == entry.url) {
            self.relays.push(entry);
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_relays(raw: &str) -> Result<Vec<RelayEntry>, String> {
    split_list(raw)
        .iter()
        .map(|entry| entry.parse::<RelayEntry>())
        .collect()
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
    error: fn(String) -> ConfigError,
) -> Result<Duration, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|parse_error| error(parse_error.to_string())),
        None => Ok(default),
    }
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: usize,
    error: fn(String) -> ConfigError,
) -> Result<usize, ConfigError> {
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(0) => Err(error("must be greater than zero".to_string())),
            Ok(value) => Ok(value),
            Err(parse_error) => Err(error(parse_error.to_string())),
        },
        None => Ok(default),
    }
}
