//! Configuration management for a sync session.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Session configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// User that authors local mutations
    pub user_id: String,
    /// Identifier of this device, used in logs
    pub node_id: String,
    /// Budget for a bulk fetch
    pub fetch_timeout: Duration,
    /// Budget for a remote write before it is rolled back
    pub write_timeout: Duration,
    /// Delay after which a still-pending write is reported as stalled
    pub pending_notice: Duration,
    /// First reconnect delay; doubled per failed attempt
    pub reconnect_backoff: Duration,
    /// Reconnect attempts before a subscription gives up
    pub max_reconnect_attempts: u32,
    /// Capacity of the mirror event channel
    pub event_capacity: usize,
}

impl ClientConfig {
    /// Defaults for everything but the user.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            node_id: uuid::Uuid::new_v4().to_string(),
            fetch_timeout: Duration::from_millis(8_000),
            write_timeout: Duration::from_millis(15_000),
            pending_notice: Duration::from_millis(3_000),
            reconnect_backoff: Duration::from_millis(250),
            max_reconnect_attempts: 8,
            event_capacity: 256,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let user_id = lookup("TANDEM_USER_ID")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingUserId)?;
        let mut config = Self::new(user_id);

        if let Some(node_id) = lookup("TANDEM_NODE_ID") {
            config.node_id = node_id;
        }
        config.fetch_timeout = millis(&lookup, "TANDEM_FETCH_TIMEOUT_MS", config.fetch_timeout)?;
        config.write_timeout = millis(&lookup, "TANDEM_WRITE_TIMEOUT_MS", config.write_timeout)?;
        config.pending_notice =
            millis(&lookup, "TANDEM_PENDING_NOTICE_MS", config.pending_notice)?;
        config.reconnect_backoff =
            millis(&lookup, "TANDEM_RECONNECT_BACKOFF_MS", config.reconnect_backoff)?;
        config.max_reconnect_attempts = number(
            &lookup,
            "TANDEM_MAX_RECONNECT_ATTEMPTS",
            config.max_reconnect_attempts,
        )?;
        config.event_capacity = number(&lookup, "TANDEM_EVENT_CAPACITY", config.event_capacity)?;
        if config.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                var: "TANDEM_EVENT_CAPACITY",
                value: "0".into(),
            });
        }

        Ok(config)
    }

    /// Builder-style method to set the fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Builder-style method to set the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Builder-style method to set the stalled-write notice delay.
    pub fn with_pending_notice(mut self, delay: Duration) -> Self {
        self.pending_notice = delay;
        self
    }

    /// Builder-style method to set the reconnect backoff.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }
}

fn number<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    number(lookup, var, default_ms).map(Duration::from_millis)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("TANDEM_USER_ID environment variable is required")]
    MissingUserId,

    #[error("Invalid {var} value: {value:?}")]
    Invalid { var: &'static str, value: String },
}
