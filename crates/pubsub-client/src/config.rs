//! Client configuration.
//!
//! [`Config`] is frozen once a [`Client`](crate::Client) is built. The small
//! set of fields that may change at runtime (UUID, auth key, filter
//! expression) is copied into [`SharedConfig`] and guarded by one lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub(crate) const DEFAULT_ORIGIN: &str = "ps.pndsn.com";
pub(crate) const SERVER_LONG_POLL_WINDOW: Duration = Duration::from_secs(280);
const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(310);
const DEFAULT_NON_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(300);
const MIN_PRESENCE_TIMEOUT: Duration = Duration::from_secs(20);
pub(crate) const DEFAULT_MESSAGE_QUEUE_OVERFLOW_COUNT: usize = 100;

/// Reconnection strategy for the subscribe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectionPolicy {
    None,
    Linear,
    #[default]
    Exponential,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub publish_key: String,
    pub subscribe_key: String,
    /// Enables request signing and access-manager operations.
    pub secret_key: Option<String>,
    /// Service host, without scheme.
    pub origin: String,
    pub secure: bool,
    /// Identity of this client within the service.
    pub uuid: String,
    pub auth_key: Option<String>,
    #[serde(with = "duration_secs")]
    pub subscribe_request_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub non_subscribe_request_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub presence_timeout: Duration,
    /// Overrides the derived heartbeat interval. `Some(0)` disables heartbeats.
    #[serde(with = "duration_secs_opt")]
    pub heartbeat_interval: Option<Duration>,
    pub reconnection_policy: ReconnectionPolicy,
    /// `-1` retries forever.
    pub maximum_reconnection_retries: i32,
    pub message_queue_overflow_count: usize,
    /// Concurrent one-shot requests; `0` means unbounded.
    pub max_workers: usize,
    pub use_http2: bool,
    pub suppress_leave_events: bool,
    pub announce_failed_heartbeats: bool,
    pub announce_successful_heartbeats: bool,
    pub filter_expression: Option<String>,
    pub cipher_key: Option<String>,
    pub use_random_initialization_vector: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            publish_key: String::new(),
            subscribe_key: String::new(),
            secret_key: None,
            origin: DEFAULT_ORIGIN.to_string(),
            secure: true,
            uuid: format!("pn-{}", uuid::Uuid::new_v4()),
            auth_key: None,
            subscribe_request_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            non_subscribe_request_timeout: DEFAULT_NON_SUBSCRIBE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
            heartbeat_interval: None,
            reconnection_policy: ReconnectionPolicy::default(),
            maximum_reconnection_retries: -1,
            message_queue_overflow_count: DEFAULT_MESSAGE_QUEUE_OVERFLOW_COUNT,
            max_workers: 0,
            use_http2: false,
            suppress_leave_events: false,
            announce_failed_heartbeats: true,
            announce_successful_heartbeats: false,
            filter_expression: None,
            cipher_key: None,
            use_random_initialization_vector: true,
        }
    }
}

impl Config {
    pub fn new(
        publish_key: impl Into<String>,
        subscribe_key: impl Into<String>,
        uuid: impl Into<String>,
    ) -> Self {
        Self {
            publish_key: publish_key.into(),
            subscribe_key: subscribe_key.into(),
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    /// Set the presence timeout and drop any explicit heartbeat interval so
    /// the interval is derived again.
    pub fn set_presence_timeout(&mut self, timeout: Duration) {
        self.presence_timeout = timeout;
        self.heartbeat_interval = None;
    }

    /// Interval between heartbeats: `presence_timeout / 2 - 1s` unless
    /// overridden. A zero interval disables the heartbeat loop.
    pub fn presence_announce_interval(&self) -> Duration {
        if let Some(interval) = self.heartbeat_interval {
            return interval.min(self.presence_timeout / 2);
        }
        (self.presence_timeout / 2).saturating_sub(Duration::from_secs(1))
    }

    /// Scheme + origin, e.g. `https://ps.pndsn.com`.
    pub fn base_url(&self) -> Result<url::Url> {
        let scheme = if self.secure { "https" } else { "http" };
        url::Url::parse(&format!("{scheme}://{}", self.origin))
            .map_err(|e| Error::validation(format!("invalid origin {:?}: {e}", self.origin)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.subscribe_key.trim().is_empty() {
            return Err(Error::validation("subscribe key is required"));
        }
        if self.uuid.trim().is_empty() {
            return Err(Error::validation("uuid must not be empty"));
        }
        if self.maximum_reconnection_retries < -1 {
            return Err(Error::validation(
                "maximum_reconnection_retries must be -1 (unlimited) or non-negative",
            ));
        }
        if !self.presence_timeout.is_zero() && self.presence_timeout < MIN_PRESENCE_TIMEOUT {
            return Err(Error::validation(format!(
                "presence timeout must be at least {}s",
                MIN_PRESENCE_TIMEOUT.as_secs()
            )));
        }
        if self.message_queue_overflow_count == 0 {
            return Err(Error::validation(
                "message_queue_overflow_count must be positive",
            ));
        }
        self.base_url()?;
        if self.subscribe_request_timeout <= SERVER_LONG_POLL_WINDOW {
            tracing::warn!(
                timeout_secs = self.subscribe_request_timeout.as_secs(),
                "subscribe timeout does not exceed the server long-poll window; \
                 healthy polls will be treated as disconnects"
            );
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(v: &Option<String>) -> Option<&'static str> {
            v.as_ref().map(|_| "<redacted>")
        }
        f.debug_struct("Config")
            .field("publish_key", &self.publish_key)
            .field("subscribe_key", &self.subscribe_key)
            .field("secret_key", &redact(&self.secret_key))
            .field("origin", &self.origin)
            .field("secure", &self.secure)
            .field("uuid", &self.uuid)
            .field("auth_key", &redact(&self.auth_key))
            .field("subscribe_request_timeout", &self.subscribe_request_timeout)
            .field(
                "non_subscribe_request_timeout",
                &self.non_subscribe_request_timeout,
            )
            .field("presence_timeout", &self.presence_timeout)
            .field("reconnection_policy", &self.reconnection_policy)
            .field(
                "maximum_reconnection_retries",
                &self.maximum_reconnection_retries,
            )
            .field("max_workers", &self.max_workers)
            .field("suppress_leave_events", &self.suppress_leave_events)
            .field("filter_expression", &self.filter_expression)
            .field("cipher_key", &redact(&self.cipher_key))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Runtime-mutable settings
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Mutable {
    uuid: String,
    auth_key: Option<String>,
    filter_expression: Option<String>,
}

/// Frozen [`Config`] plus the runtime-mutable allow-list.
///
/// Clone is a cheap Arc refcount bump.
#[derive(Debug, Clone)]
pub(crate) struct SharedConfig {
    config: Arc<Config>,
    mutable: Arc<RwLock<Mutable>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        let mutable = Mutable {
            uuid: config.uuid.clone(),
            auth_key: config.auth_key.clone(),
            filter_expression: config.filter_expression.clone(),
        };
        Self {
            config: Arc::new(config),
            mutable: Arc::new(RwLock::new(mutable)),
        }
    }

    pub fn get(&self) -> &Config {
        &self.config
    }

    pub fn uuid(&self) -> String {
        self.mutable.read().uuid.clone()
    }

    pub fn auth_key(&self) -> Option<String> {
        self.mutable.read().auth_key.clone()
    }

    pub fn filter_expression(&self) -> Option<String> {
        self.mutable.read().filter_expression.clone()
    }

    pub fn set_uuid(&self, uuid: String) {
        self.mutable.write().uuid = uuid;
    }

    pub fn set_auth_key(&self, auth_key: Option<String>) {
        self.mutable.write().auth_key = auth_key;
    }

    pub fn set_filter_expression(&self, filter: Option<String>) {
        self.mutable.write().filter_expression = filter;
    }
}

// ---------------------------------------------------------------------------
// Serde helpers: durations as whole seconds
// ---------------------------------------------------------------------------

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_secs_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new("pub", "sub", "me");
        assert_eq!(config.origin, DEFAULT_ORIGIN);
        assert_eq!(config.subscribe_request_timeout, Duration::from_secs(310));
        assert_eq!(config.maximum_reconnection_retries, -1);
        assert_eq!(config.reconnection_policy, ReconnectionPolicy::Exponential);
        assert_eq!(config.message_queue_overflow_count, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_uuid_is_generated() {
        let a = Config::default();
        let b = Config::default();
        assert!(a.uuid.starts_with("pn-"));
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn announce_interval_is_derived_from_presence_timeout() {
        let mut config = Config::new("pub", "sub", "me");
        config.set_presence_timeout(Duration::from_secs(120));
        assert_eq!(config.presence_announce_interval(), Duration::from_secs(59));

        config.heartbeat_interval = Some(Duration::from_secs(500));
        assert_eq!(config.presence_announce_interval(), Duration::from_secs(60));

        config.heartbeat_interval = Some(Duration::ZERO);
        assert!(config.presence_announce_interval().is_zero());
    }

    #[test]
    fn validate_rejects_missing_subscribe_key() {
        let config = Config::new("pub", "", "me");
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn validate_rejects_short_presence_timeout() {
        let mut config = Config::new("pub", "sub", "me");
        config.presence_timeout = Duration::from_secs(5);
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn base_url_follows_secure_flag() {
        let mut config = Config::new("pub", "sub", "me");
        config.origin = "127.0.0.1:8080".into();
        config.secure = false;
        assert_eq!(config.base_url().unwrap().as_str(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn json_round_trip_uses_seconds() {
        let json = r#"{"subscribe_key":"sub","uuid":"me","presence_timeout":60,
                       "reconnection_policy":"linear","heartbeat_interval":10}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.presence_timeout, Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.reconnection_policy, ReconnectionPolicy::Linear);
        assert_eq!(config.origin, DEFAULT_ORIGIN);

        let out = serde_json::to_value(&config).unwrap();
        assert_eq!(out["presence_timeout"], 60);
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = Config::new("pub", "sub", "me");
        config.secret_key = Some("very-secret".into());
        config.cipher_key = Some("cipher".into());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("very-secret"));
        assert!(!rendered.contains("\"cipher\""));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn shared_config_mutation() {
        let shared = SharedConfig::new(Config::new("pub", "sub", "me"));
        let clone = shared.clone();
        clone.set_uuid("other".into());
        clone.set_auth_key(Some("auth".into()));
        assert_eq!(shared.uuid(), "other");
        assert_eq!(shared.auth_key().as_deref(), Some("auth"));
        // The frozen copy is untouched.
        assert_eq!(shared.get().uuid, "me");
    }
}
