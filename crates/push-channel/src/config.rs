use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

pub(crate) const DEFAULT_USER_CHANNEL: &str = "/service/user";
pub(crate) const DEFAULT_DEVICE_CHANNEL: &str = "/service/device";
pub(crate) const DEFAULT_PROXY_PRINT_CHANNEL: &str = "/service/proxyprint";
pub(crate) const DEFAULT_HEARTBEAT_SECS: u64 = 10;
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub channels: ChannelNames,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub transport: TransportTiming,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bayeux endpoint, e.g. `https://print.example.com/cometd`.
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelNames {
    pub user: String,
    pub device: String,
    pub proxy_print: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER_CHANNEL.to_string(),
            device: DEFAULT_DEVICE_CHANNEL.to_string(),
            proxy_print: DEFAULT_PROXY_PRINT_CHANNEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub heartbeat_secs: u64,
    /// Elapsed time since the last heartbeat beyond which the runtime is
    /// assumed to have been suspended.
    pub timeout_secs: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportTiming {
    pub connect_timeout_secs: u64,
    /// Added to the server's long-poll hold time to size the HTTP timeout.
    pub long_poll_margin_secs: u64,
    pub initial_retry_ms: u64,
    pub max_retry_ms: u64,
}

impl Default for TransportTiming {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            long_poll_margin_secs: 10,
            initial_retry_ms: 1_000,
            max_retry_ms: 15_000,
        }
    }
}

impl TransportTiming {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn long_poll_margin(&self) -> Duration {
        Duration::from_secs(self.long_poll_margin_secs)
    }

    pub fn initial_retry(&self) -> Duration {
        Duration::from_millis(self.initial_retry_ms)
    }

    pub fn max_retry(&self) -> Duration {
        Duration::from_millis(self.max_retry_ms)
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            server: ServerConfig { url: url.into() },
            channels: ChannelNames::default(),
            watchdog: WatchdogSettings::default(),
            transport: TransportTiming::default(),
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Self::parse(content, "config")
    }

    fn parse(content: &str, source: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml_ng::from_str(content)
            .map_err(|e| Error::Config(format!("parse {source}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.server.url)
            .map_err(|e| Error::Config(format!("server.url {}: {e}", self.server.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "server.url must be http or https, got {}",
                url.scheme()
            )));
        }
        for (label, name) in [
            ("user", &self.channels.user),
            ("device", &self.channels.device),
            ("proxy_print", &self.channels.proxy_print),
        ] {
            if !name.starts_with('/') || name.starts_with("/meta/") {
                return Err(Error::Config(format!(
                    "channels.{label} is not a valid channel name: {name}"
                )));
            }
        }
        if self.watchdog.heartbeat_secs == 0 {
            return Err(Error::Config("watchdog.heartbeat_secs must be > 0".into()));
        }
        if self.watchdog.timeout_secs <= self.watchdog.heartbeat_secs {
            return Err(Error::Config(format!(
                "watchdog.timeout_secs ({}) must exceed heartbeat_secs ({})",
                self.watchdog.timeout_secs, self.watchdog.heartbeat_secs
            )));
        }
        if self.transport.initial_retry_ms > self.transport.max_retry_ms {
            return Err(Error::Config(
                "transport.initial_retry_ms must not exceed max_retry_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Load and validate a client config from a YAML file.
pub async fn load(path: &Path) -> Result<ClientConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    ClientConfig::parse(&content, &path.display().to_string())
}
