use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use serde::Serialize;
use url::Url;

use crate::Result;
use crate::error::Error;
use crate::traits::CredentialLookup;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_ACK_TIMEOUT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_RECONNECT_STEP_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_CREDENTIAL_RETRY_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Configuration for a [`crate::ConnectionManager`].
///
/// ```
/// use std::time::Duration;
///
/// use resilient_ws::config::{Config, HeartbeatConfig, ReconnectConfig};
///
/// let config = Config::builder()
///     .endpoint("wss://example.com/feed")
///     .heartbeat(HeartbeatConfig::new(Duration::from_secs(10), Duration::from_secs(3)))
///     .reconnect(ReconnectConfig::linear(Duration::ZERO, Duration::from_secs(5)))
///     .build();
///
/// assert!(config.auto_reconnect);
/// ```
#[non_exhaustive]
#[derive(Clone, Builder)]
pub struct Config {
    /// Destination address, `ws://` or `wss://`
    #[builder(into)]
    pub endpoint: String,
    /// Query parameters appended to `endpoint`
    #[builder(default)]
    pub query: Vec<(String, String)>,
    /// Source of the connection-scoped token. Without it no token is sent.
    pub credentials: Option<Arc<dyn CredentialLookup>>,
    /// Frame [`crate::ConnectionManager::send_json`] payloads and text heartbeat probes as binary
    #[builder(default)]
    pub binary_mode: bool,
    #[builder(default)]
    pub heartbeat: HeartbeatConfig,
    /// Reconnect after an unexpected close
    #[builder(default = true)]
    pub auto_reconnect: bool,
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    #[builder(default)]
    pub queue: QueueConfig,
    /// Delay before asking [`CredentialLookup`] again when it had no token
    #[builder(default = DEFAULT_CREDENTIAL_RETRY_DURATION)]
    pub credential_retry: Duration,
    /// Start connecting as soon as the manager is created
    #[builder(default = true)]
    pub connect_on_create: bool,
}

impl Config {
    /// Check the configuration and return the parsed endpoint.
    pub(crate) fn validate(&self) -> Result<Url> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::validation("endpoint is required"));
        }

        let mut url = Url::parse(&self.endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported endpoint scheme `{}`, expected ws or wss",
                url.scheme()
            )));
        }

        if self.heartbeat.enabled
            && (self.heartbeat.interval.is_zero() || self.heartbeat.ack_timeout.is_zero())
        {
            return Err(Error::validation(
                "heartbeat interval and ack timeout must be non-zero",
            ));
        }

        if self.queue.capacity == 0 {
            return Err(Error::validation("queue capacity must be non-zero"));
        }

        self.reconnect.policy.validate()?;

        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("endpoint", &self.endpoint)
            .field("query", &self.query)
            .field("credentials", &self.credentials.is_some())
            .field("binary_mode", &self.binary_mode)
            .field("heartbeat", &self.heartbeat)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("reconnect", &self.reconnect)
            .field("queue", &self.queue)
            .field("credential_retry", &self.credential_retry)
            .field("connect_on_create", &self.connect_on_create)
            .finish()
    }
}

/// Heartbeat watchdog settings.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Idle time without inbound traffic before a probe is sent
    pub interval: Duration,
    /// Maximum time to wait for the acknowledgment before the channel is considered dead
    pub ack_timeout: Duration,
    pub probe: HeartbeatProbe,
}

impl HeartbeatConfig {
    #[must_use]
    pub fn new(interval: Duration, ack_timeout: Duration) -> Self {
        Self {
            enabled: true,
            interval,
            ack_timeout,
            probe: HeartbeatProbe::Control,
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: HeartbeatProbe) -> Self {
        self.probe = probe;
        self
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            DEFAULT_HEARTBEAT_ACK_TIMEOUT_DURATION,
        )
    }
}

/// What the watchdog sends and what it accepts as the answer.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HeartbeatProbe {
    /// WebSocket Ping control frame, answered by a Pong
    #[default]
    Control,
    /// Application-level sentinels, matched by exact equality on a text frame
    Text { probe: String, ack: String },
}

impl HeartbeatProbe {
    #[must_use]
    pub fn text<P: Into<String>, A: Into<String>>(probe: P, ack: A) -> Self {
        Self::Text {
            probe: probe.into(),
            ack: ack.into(),
        }
    }

    /// Text sentinels from structured content, serialized as JSON.
    pub fn json<P: Serialize, A: Serialize>(probe: &P, ack: &A) -> Result<Self> {
        Ok(Self::Text {
            probe: serde_json::to_string(probe)?,
            ack: serde_json::to_string(ack)?,
        })
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub policy: BackoffPolicy,
    /// Maximum number of consecutive reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
}

impl ReconnectConfig {
    #[must_use]
    pub fn linear(base: Duration, step: Duration) -> Self {
        Self {
            policy: BackoffPolicy::Linear {
                base,
                step,
                max: None,
            },
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            policy: BackoffPolicy::Exponential {
                initial,
                multiplier,
                max,
            },
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::linear(Duration::ZERO, DEFAULT_RECONNECT_STEP_DURATION)
    }
}

/// Growth of the delay between consecutive reconnection attempts. Both policies never decrease
/// until reset by a successful open.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// `delay = base + attempt * step`, capped at `max`
    Linear {
        base: Duration,
        step: Duration,
        max: Option<Duration>,
    },
    /// `delay = initial * multiplier ^ attempt`, capped at `max`, without jitter
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffPolicy {
    /// Reject parameters under which a delay could be shorter than the one before it.
    pub(crate) fn validate(&self) -> Result<()> {
        if let Self::Exponential {
            initial,
            multiplier,
            max,
        } = *self
        {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(Error::validation(format!(
                    "exponential backoff multiplier must be finite and at least 1.0, got {multiplier}"
                )));
            }
            if initial > max {
                return Err(Error::validation(format!(
                    "exponential backoff initial delay {initial:?} exceeds max {max:?}"
                )));
            }
        }

        Ok(())
    }
}

/// Outbound queue bounds.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl QueueConfig {
    #[must_use]
    pub const fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self { capacity, overflow }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, OverflowPolicy::DropOldest)
    }
}

/// What happens to a payload submitted to a full outbound queue.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued payload to make room
    #[default]
    DropOldest,
    /// Keep the queue as is and discard the new payload
    RejectNew,
}
