//! Link and playback configuration.
//!
//! Both structures deserialize from YAML with every field optional, so a host
//! can ship a partial file and fall back to the defaults for the rest.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::{LinkError, Result};

/// Port the studio listens on.
pub const DEFAULT_STUDIO_PORT: u16 = 34729;

/// Delay between reconnect attempts.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 5000;

/// Largest payload accepted from the wire (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Frame rate timelines are authored against.
pub const DEFAULT_NOMINAL_FPS: u32 = 50;

/// Connection settings for the studio link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Studio address; loopback in every real deployment.
    pub address: SocketAddr,

    /// Constant backoff between reconnect attempts, in milliseconds.
    pub retry_interval_ms: u64,

    /// Upper bound on a single inbound payload.
    pub max_payload_len: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_STUDIO_PORT)),
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

impl LinkConfig {
    /// Parse a configuration from YAML text and validate it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| LinkError::config(format!("link config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loopback address on a custom port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        self
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_payload_len(mut self, max: u32) -> Self {
        self.max_payload_len = max;
        self
    }

    /// Backoff between reconnect attempts.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_payload_len == 0 {
            return Err(LinkError::config("max_payload_len must be greater than zero"));
        }
        Ok(())
    }
}

/// Playback settings for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Frames per second at a breakpoint speed factor of 1.0.
    pub nominal_fps: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { nominal_fps: DEFAULT_NOMINAL_FPS }
    }
}

impl PlaybackConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| LinkError::config(format!("playback config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_nominal_fps(mut self, fps: u32) -> Self {
        self.nominal_fps = fps;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.nominal_fps == 0 {
            return Err(LinkError::config("nominal_fps must be greater than zero"));
        }
        Ok(())
    }
}
