//! Configuration handling for the watch service.
//!
//! Settings come from the `derp` section of a YAML file, then `DERP_*`
//! environment variables, then command line flags.

use anyhow::{bail, Context, Result};
use derp_client::{RelayUrl, WatchLoopConfig};
use derp_wire::{NodePrivate, NodePublic};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Watch service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Node private key, `privkey:<hex>`; generated when absent
    pub private_key: Option<String>,
    /// Mesh key presented to every relay
    pub mesh_key: String,
    /// Relays to watch
    pub relays: Vec<String>,
    /// Key of the local relay, never watched; `nodekey:<hex>`
    pub ignore_server_key: Option<String>,
    /// Dial plus handshake timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Backoff and status settings for each watch loop
    pub watch: WatchLoopConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            mesh_key: String::new(),
            relays: Vec::new(),
            ignore_server_key: None,
            connect_timeout_ms: 10_000,
            watch: WatchLoopConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    derp: Option<WatchConfig>,
}

impl WatchConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.derp.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply `DERP_*` overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(private_key) = lookup("DERP_PRIVATE_KEY") {
            self.private_key = Some(private_key);
            info!("Private key overridden by environment");
        }

        if let Some(mesh_key) = lookup("DERP_MESH_KEY") {
            self.mesh_key = mesh_key;
            info!("Mesh key overridden by environment");
        }

        if let Some(relays) = lookup("DERP_RELAYS") {
            self.relays = relays
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            info!("Relays overridden by environment: {:?}", self.relays);
        }

        if let Some(key) = lookup("DERP_IGNORE_SERVER_KEY") {
            self.ignore_server_key = Some(key);
            info!("Ignored server key overridden by environment");
        }

        if let Some(timeout) = lookup("DERP_CONNECT_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => {
                    self.connect_timeout_ms = ms;
                    info!("Connect timeout overridden by environment: {}ms", ms);
                }
                Err(_) => warn!("Ignoring invalid DERP_CONNECT_TIMEOUT_MS {:?}", timeout),
            }
        }
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.relays.is_empty() {
            bail!("no relays configured");
        }
        if self.mesh_key.is_empty() {
            bail!("mesh_key is required to watch relays");
        }
        if self.connect_timeout_ms == 0 {
            bail!("connect_timeout_ms must be > 0");
        }
        self.relay_urls()?;
        self.ignore_server_key()?;
        self.watch
            .backoff
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid backoff: {}", e))?;
        Ok(())
    }

    /// Parsed relay URLs
    pub fn relay_urls(&self) -> Result<Vec<RelayUrl>> {
        self.relays
            .iter()
            .map(|url| url.parse::<RelayUrl>().map_err(anyhow::Error::from))
            .collect()
    }

    /// Configured private key, or a freshly generated one
    pub fn private_key(&self) -> Result<NodePrivate> {
        match &self.private_key {
            Some(text) => text
                .parse::<NodePrivate>()
                .map_err(|e| anyhow::anyhow!("invalid private_key: {}", e)),
            None => {
                let key = NodePrivate::generate();
                info!("Generated node key {}", key.public());
                Ok(key)
            }
        }
    }

    /// Key of the relay to skip, if configured
    pub fn ignore_server_key(&self) -> Result<Option<NodePublic>> {
        self.ignore_server_key
            .as_deref()
            .map(|text| {
                text.parse::<NodePublic>()
                    .map_err(|e| anyhow::anyhow!("invalid ignore_server_key: {}", e))
            })
            .transpose()
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
