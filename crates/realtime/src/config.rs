//! Client configuration.
//!
//! Field names and defaults match the dashboard's client options, so a
//! JSON file written for the web client loads unchanged:
//!
//! ```json
//! { "url": "ws://localhost:8000/ws/events",
//!   "reconnection": { "initialDelay": 1000, "maxDelay": 30000 },
//!   "maxQueueSize": 1000, "debug": true }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tunedeck_protocol::constants::{DEFAULT_LOCAL_WS_URL, DEFAULT_REMOTE_WS_URL};

/// Environment variable overriding the socket URL.
pub const ENV_WS_URL: &str = "TUNEDECK_WS_URL";

/// Environment variable selecting the deployment (`production` → remote URL).
pub const ENV_DEPLOYMENT: &str = "TUNEDECK_ENV";

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Attempt budget; 0 means unlimited.
    pub max_attempts: u32,
    /// Random perturbation as a fraction of the delay, within 0..=1.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
            max_attempts: 0,
            jitter: 0.1,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay.is_zero() {
            return Err(ConfigError::Invalid("initialDelay must be > 0".into()));
        }
        if self.multiplier.is_nan() || self.multiplier <= 1.0 {
            return Err(ConfigError::Invalid("multiplier must be > 1".into()));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::Invalid(
                "maxDelay must be >= initialDelay".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid("jitter must be within 0..=1".into()));
        }
        Ok(())
    }

    fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.initial_delay.is_zero() {
            self.initial_delay = defaults.initial_delay;
        }
        if self.multiplier.is_nan() || self.multiplier <= 1.0 {
            self.multiplier = defaults.multiplier;
        }
        if self.max_delay < self.initial_delay {
            self.max_delay = self.initial_delay.max(defaults.max_delay);
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            self.jitter = defaults.jitter;
        }
    }
}

/// Options for a [`RealtimeClient`](crate::RealtimeClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Socket URL. When unset it is resolved from the environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub reconnection: ReconnectConfig,
    /// Capacity of the inbound redelivery queue.
    pub max_queue_size: usize,
    pub enable_deduplication: bool,
    /// Accepted for compatibility with dashboard configs. The seen-id
    /// history is bounded by `max_event_history`, not by time.
    #[serde(with = "duration_ms")]
    pub deduplication_window: Duration,
    /// Number of event ids remembered for deduplication.
    pub max_event_history: usize,
    /// Logs every inbound event and dispatch at `debug` level.
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: None,
            reconnection: ReconnectConfig::default(),
            max_queue_size: 1000,
            enable_deduplication: true,
            deduplication_window: Duration::from_millis(5000),
            max_event_history: 1000,
            debug: false,
        }
    }
}

impl ClientConfig {
    /// Defaults with the URL resolved from the environment.
    pub fn from_env() -> Self {
        Self {
            url: Some(env_url()),
            ..Self::default()
        }
    }

    /// Loads a JSON configuration file and validates it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "client configuration loaded");
        Ok(config)
    }

    /// Sets an explicit socket URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// The socket URL this client connects to.
    pub fn resolved_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => env_url(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reconnection.validate()?;
        if self.max_queue_size == 0 {
            return Err(ConfigError::Invalid("maxQueueSize must be > 0".into()));
        }
        if self.max_event_history == 0 {
            return Err(ConfigError::Invalid("maxEventHistory must be > 0".into()));
        }
        Ok(())
    }

    /// Replaces every value [`validate`](Self::validate) would reject with
    /// its default, keeping the rest.
    pub fn sanitized(mut self) -> Self {
        self.reconnection.sanitize();
        let defaults = Self::default();
        if self.max_queue_size == 0 {
            self.max_queue_size = defaults.max_queue_size;
        }
        if self.max_event_history == 0 {
            self.max_event_history = defaults.max_event_history;
        }
        self
    }
}

fn env_url() -> String {
    resolve_url(
        std::env::var(ENV_WS_URL).ok(),
        std::env::var(ENV_DEPLOYMENT).ok(),
    )
}

/// Picks the socket URL: explicit override first, then the remote default
/// for production deployments, else the local backend.
pub(crate) fn resolve_url(override_url: Option<String>, deployment: Option<String>) -> String {
    if let Some(url) = override_url.filter(|u| !u.trim().is_empty()) {
        return url;
    }
    match deployment.as_deref() {
        Some("production") => DEFAULT_REMOTE_WS_URL.into(),
        _ => DEFAULT_LOCAL_WS_URL.into(),
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
