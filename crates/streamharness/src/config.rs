//! Harness configuration.
//!
//! Only the broker endpoint is read from the environment:
//!
//! - `BROKER_HOST`: broker host (default: `localhost`)
//! - `BROKER_PORT`: broker stream port (default: `5552`)
//!
//! Credentials are fixed to the broker's default `guest` identity. Everything
//! else is a code-level default that embedders and tests can override on the
//! struct directly.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use streamharness_client::{ConnectionSettings, RetryPolicy, StreamOptions};

/// Environment variable holding the broker host.
pub const BROKER_HOST_ENV: &str = "BROKER_HOST";

/// Environment variable holding the broker port.
pub const BROKER_PORT_ENV: &str = "BROKER_PORT";

/// Full harness configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Broker endpoint and credentials
    pub connection: ConnectionSettings,

    /// Stream all producers and consumers attach to
    pub stream_name: String,

    /// Options used when the stream has to be created
    pub stream_options: StreamOptions,

    /// Pause after provisioning, letting the stream propagate in a cluster
    pub stream_settle_delay: Duration,

    /// Number of producer loops (one connection each)
    pub producers: usize,

    /// Number of consumers (one connection each)
    pub consumers: usize,

    /// Pause between two sends of the same producer
    pub send_interval: Duration,

    /// Stop each producer after this many sends; `None` runs until shutdown
    pub messages_per_producer: Option<u64>,

    /// Period of the progress line
    pub report_interval: Duration,

    /// Upper bound on waiting for consumers to catch up at shutdown
    pub drain_timeout: Duration,

    /// How often the drain condition is checked
    pub drain_poll_interval: Duration,

    /// Connection retry policy
    pub retry: RetryPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            stream_name: "streamharness".to_string(),
            stream_options: StreamOptions::default(),
            stream_settle_delay: Duration::ZERO,
            producers: 2,
            consumers: 5,
            send_interval: Duration::from_millis(100),
            messages_per_producer: None,
            report_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            drain_poll_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}

impl HarnessConfig {
    /// Defaults overridden by `BROKER_HOST` / `BROKER_PORT`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`HarnessConfig::from_env`] with an injectable variable source.
    ///
    /// Empty values fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = non_empty(BROKER_HOST_ENV) {
            config.connection.host = host.trim().to_string();
        }

        if let Some(port) = non_empty(BROKER_PORT_ENV) {
            config.connection.port = port.trim().parse().map_err(|_| {
                HarnessError::Config(format!(
                    "{BROKER_PORT_ENV} must be a port number, got '{port}'"
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the harness cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.connection.host.is_empty() {
            return Err(HarnessError::Config("broker host is empty".to_string()));
        }
        if self.connection.port == 0 {
            return Err(HarnessError::Config("broker port must not be 0".to_string()));
        }
        if self.stream_name.trim().is_empty() {
            return Err(HarnessError::Config("stream name is empty".to_string()));
        }
        if self.report_interval.is_zero() {
            return Err(HarnessError::Config("report interval must be positive".to_string()));
        }
        if self.drain_poll_interval.is_zero() {
            return Err(HarnessError::Config(
                "drain poll interval must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(HarnessError::Config(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        Ok(())
    }
}
