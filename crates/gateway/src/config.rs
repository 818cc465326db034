//! Gateway configuration, read from the environment.

use crate::backoff::BackoffPolicy;
use crate::error::{GatewayError, Result};
use crate::layout::TopicLayout;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Client actor settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Outbound mailbox capacity.
    pub mailbox: usize,
    /// Deadline for writing one data frame to the socket.
    pub write_timeout: Duration,
    /// Deadline for answering a ping.
    pub pong_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mailbox: 256,
            write_timeout: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(300),
        }
    }
}

/// Tail reader settings.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Maximum time one blocking read waits for new entries.
    pub block_timeout: Duration,
    /// Maximum entries per sub-stream per read.
    pub read_count: usize,
    /// Retry policy after a failed read.
    pub backoff: BackoffPolicy,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_secs(300),
            read_count: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Topic actor settings.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub layout: TopicLayout,
    /// Register/unregister/stop mailbox capacity.
    pub command_mailbox: usize,
    /// Reader → topic payload mailbox capacity.
    pub delivery_mailbox: usize,
    /// How long a delivery may wait on a full client mailbox before the
    /// client is evicted.
    pub send_timeout: Duration,
    /// Panics tolerated before the topic is abandoned.
    pub max_restarts: u32,
    /// Upper bound on store lookups outside the tail read: cache seeding as a
    /// whole, and each existence check.
    pub store_timeout: Duration,
    pub reader: ReaderConfig,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            layout: TopicLayout::default(),
            command_mailbox: 64,
            delivery_mailbox: 256,
            send_timeout: Duration::from_secs(2),
            max_restarts: 3,
            store_timeout: Duration::from_secs(5),
            reader: ReaderConfig::default(),
        }
    }
}

/// Hub actor settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Operation mailbox capacity.
    pub mailbox: usize,
    /// How long the hub waits on a full topic mailbox before evicting the
    /// topic as stuck. Should exceed `topic.store_timeout`.
    pub command_timeout: Duration,
    pub topic: TopicConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox: 64,
            command_timeout: Duration::from_secs(10),
            topic: TopicConfig::default(),
        }
    }
}

/// Full gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    pub redis_url: String,
    pub hub: HubConfig,
    pub client: ClientConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 3080,
            metrics_port: 9093,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            hub: HubConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let topic = &defaults.hub.topic;

        let backoff = BackoffPolicy {
            first: millis(&lookup, "BACKOFF_FIRST_MS", topic.reader.backoff.first)?,
            max: millis(&lookup, "BACKOFF_MAX_MS", topic.reader.backoff.max)?,
            ..topic.reader.backoff
        };
        let reader = ReaderConfig {
            block_timeout: secs(&lookup, "BLOCK_TIMEOUT_SECS", topic.reader.block_timeout)?,
            read_count: parse(&lookup, "READ_COUNT", topic.reader.read_count)?,
            backoff,
        };
        let topic = TopicConfig {
            layout: topic.layout.clone(),
            command_mailbox: parse(&lookup, "TOPIC_MAILBOX", topic.command_mailbox)?,
            delivery_mailbox: parse(&lookup, "DELIVERY_MAILBOX", topic.delivery_mailbox)?,
            send_timeout: millis(&lookup, "SEND_TIMEOUT_MS", topic.send_timeout)?,
            max_restarts: parse(&lookup, "MAX_TOPIC_RESTARTS", topic.max_restarts)?,
            store_timeout: millis(&lookup, "STORE_TIMEOUT_MS", topic.store_timeout)?,
            reader,
        };
        let hub = HubConfig {
            mailbox: parse(&lookup, "HUB_MAILBOX", defaults.hub.mailbox)?,
            command_timeout: millis(&lookup, "COMMAND_TIMEOUT_MS", defaults.hub.command_timeout)?,
            topic,
        };
        let client = ClientConfig {
            mailbox: parse(&lookup, "CLIENT_MAILBOX", defaults.client.mailbox)?,
            write_timeout: secs(&lookup, "WRITE_TIMEOUT_SECS", defaults.client.write_timeout)?,
            pong_timeout: secs(&lookup, "PONG_TIMEOUT_SECS", defaults.client.pong_timeout)?,
        };

        let config = Self {
            http_port: parse(&lookup, "HTTP_PORT", defaults.http_port)?,
            metrics_port: parse(&lookup, "METRICS_PORT", defaults.metrics_port)?,
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            hub,
            client,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        // tokio::sync::mpsc panics on zero-capacity channels.
        let mailboxes = [
            ("HUB_MAILBOX", self.hub.mailbox),
            ("TOPIC_MAILBOX", self.hub.topic.command_mailbox),
            ("DELIVERY_MAILBOX", self.hub.topic.delivery_mailbox),
            ("CLIENT_MAILBOX", self.client.mailbox),
            ("READ_COUNT", self.hub.topic.reader.read_count),
        ];
        for (key, value) in mailboxes {
            if value == 0 {
                return Err(GatewayError::Config(format!("{} must be greater than 0", key)));
            }
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| GatewayError::Config(format!("{} must be a number, got '{}'", key, raw))),
        None => Ok(default),
    }
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, key, default.as_secs()).map(Duration::from_secs)
}
