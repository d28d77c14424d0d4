//! Client and reconnect configuration.

use derp_wire::NodePrivate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::transport::RelayUrl;

/// Default bound on dial plus handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a ping round trip
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Our node identity
    pub private_key: NodePrivate,
    /// Relay to connect to
    pub url: RelayUrl,
    /// Shared mesh secret, presented in ClientInfo
    pub mesh_key: Option<String>,
    /// Subscribe to peer presence on every new connection
    pub is_watcher: bool,
    /// Identify as a prober
    pub is_prober: bool,
    /// Advertise that we answer relay pings
    pub can_ack_pings: bool,
    /// Bound on dial plus handshake for [`crate::Client::connect`]
    pub connect_timeout: Duration,
    /// Default bound used by [`crate::Client::ping`] callers
    pub ping_timeout: Duration,
}

impl ClientConfig {
    /// Configuration for a regular client
    pub fn new(private_key: NodePrivate, url: RelayUrl) -> Self {
        Self {
            private_key,
            url,
            mesh_key: None,
            is_watcher: false,
            is_prober: false,
            can_ack_pings: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    /// Present `mesh_key` and subscribe to peer presence
    pub fn with_watcher(mut self, mesh_key: impl Into<String>) -> Self {
        self.mesh_key = Some(mesh_key.into());
        self.is_watcher = true;
        self
    }

    /// Present `mesh_key` without subscribing
    pub fn with_mesh_key(mut self, mesh_key: impl Into<String>) -> Self {
        self.mesh_key = Some(mesh_key.into());
        self
    }

    /// Override the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Mark as a prober
    pub fn with_prober(mut self, is_prober: bool) -> Self {
        self.is_prober = is_prober;
        self
    }
}

/// Exponential backoff settings for reconnect loops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Ceiling for any single delay, in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Growth factor per failed attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0) applied symmetrically around the delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    5000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.1
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffConfig {
    /// Delay to wait after `attempt` consecutive failures (0-based)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let ceiling = self.max_backoff_ms as f64;
        let capped = base.min(ceiling);

        let jitter_range = capped * self.jitter.clamp(0.0, 1.0);
        let jitter_offset = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let final_ms = (capped + jitter_offset).clamp(0.0, ceiling);

        Duration::from_millis(final_ms as u64)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_backoff_ms == 0 {
            return Err("initial_backoff_ms must be > 0".to_string());
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err("max_backoff_ms must be >= initial_backoff_ms".to_string());
        }
        if !(1.0..=16.0).contains(&self.multiplier) {
            return Err("multiplier must be within [1.0, 16.0]".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be within [0.0, 1.0]".to_string());
        }
        Ok(())
    }
}

/// Watch loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchLoopConfig {
    /// Reconnect backoff
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Interval of the peer count status line, in milliseconds
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,
}

fn default_status_interval() -> u64 {
    10_000
}

impl Default for WatchLoopConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            status_interval_ms: default_status_interval(),
        }
    }
}

impl WatchLoopConfig {
    /// Status line interval
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }
}
