//! Client configuration
//!
//! Only the credentials are required; everything else has defaults. The same
//! struct can be built in code or loaded from TOML:
//!
//! ```toml
//! client_id = "12345678-1234-1234-1234-123456789abc"
//! client_secret = "12345678-1234-1234-1234-123456789abc"
//! channels = ["gossip", "secrets"]
//!
//! [timeouts]
//! request_ms = 10000
//!
//! [backoff]
//! max_ms = 30000
//! ```

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::DEFAULT_ENDPOINT;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub client_id: String,
    pub client_secret: String,
    /// Hub WebSocket endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Protocol feature sets announced during authentication
    #[serde(default = "default_supports")]
    pub supports: Vec<String>,
    /// Channels subscribed at authentication
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
    /// Protocol version announced during authentication
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

/// Timer settings, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// How long a request waits for its reply
    pub request_ms: u64,
    /// Budget for opening the transport, and separately for the
    /// authentication reply
    pub connect_ms: u64,
    /// Heartbeat watchdog period
    pub heartbeat_interval_ms: u64,
    /// Consecutive watchdog periods without a hub heartbeat before the
    /// connection is considered dead
    pub heartbeat_miss_limit: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request_ms: 10_000,
            connect_ms: 10_000,
            heartbeat_interval_ms: 15_000,
            heartbeat_miss_limit: 3,
        }
    }
}

/// Reconnect delay policy: exponential with a cap and optional jitter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, 0.0..=1.0
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(64) as i32);
        let base = (self.initial_ms as f64 * exp).min(self.max_ms as f64);

        let jittered = if self.jitter > 0.0 {
            let spread = base * self.jitter;
            base + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            base
        };

        Duration::from_millis(jittered.clamp(0.0, self.max_ms as f64) as u64)
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_supports() -> Vec<String> {
    ["channels", "players", "tells", "games"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_channels() -> Vec<String> {
    vec!["gossip".to_string()]
}

fn default_version() -> String {
    "2.3.0".to_string()
}

fn default_user_agent() -> String {
    format!("grapevine-net {}", env!("CARGO_PKG_VERSION"))
}

impl Config {
    /// Configuration with default settings for the given credentials
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            endpoint: default_endpoint(),
            supports: default_supports(),
            channels: default_channels(),
            version: default_version(),
            user_agent: default_user_agent(),
            timeouts: Timeouts::default(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Configuration(format!("Invalid config: {}", e)))
    }

    /// Load a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Check the settings the client cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Configuration("client_id is required".into()));
        }
        if self.client_secret.trim().is_empty() {
            return Err(Error::Configuration("client_secret is required".into()));
        }
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(Error::Configuration(format!(
                "endpoint must be a ws:// or wss:// URL, got '{}'",
                self.endpoint
            )));
        }

        let t = &self.timeouts;
        if t.request_ms == 0 || t.connect_ms == 0 || t.heartbeat_interval_ms == 0 {
            return Err(Error::Configuration("timeouts must be non-zero".into()));
        }
        if t.heartbeat_miss_limit == 0 {
            return Err(Error::Configuration(
                "heartbeat_miss_limit must be at least 1".into(),
            ));
        }

        let b = &self.backoff;
        if b.initial_ms == 0 || b.max_ms < b.initial_ms {
            return Err(Error::Configuration(
                "backoff requires 0 < initial_ms <= max_ms".into(),
            ));
        }
        if b.multiplier.is_nan() || b.multiplier < 1.0 {
            return Err(Error::Configuration(
                "backoff multiplier must be >= 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&b.jitter) {
            return Err(Error::Configuration(
                "backoff jitter must be within 0.0..=1.0".into(),
            ));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.heartbeat_interval_ms)
    }
}
