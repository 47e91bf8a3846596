//! Configuration of the messaging layer.
//!
//! Every section has sensible defaults, so an empty document (or no document
//! at all) yields a working configuration. Values can be loaded from TOML:
//!
//! ```toml
//! [retransmission]
//! interval_ms = 500
//! cycles = 20
//!
//! [machine]
//! transition_check_interval_ms = 50
//! ```
use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub retransmission: RetransmissionConfig,
    pub channel: ChannelConfig,
    pub handshake: HandshakeConfig,
    pub machine: MachineConfig,
}

/// How outgoing messages get retransmitted.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetransmissionConfig {
    /// Time between two retransmission ticks.
    pub interval_ms: u64,
    /// Number of ticks the strategy gets consulted for, after the original send.
    pub cycles: u32,
}

impl Default for RetransmissionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            cycles: 10,
        }
    }
}

impl RetransmissionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Channel buffering and deduplication.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Capacity of the queue in front of each receive handler.
    pub handler_buffer: usize,
    /// Capacity of the queue between the transport and the validation loop.
    pub incoming_queue: usize,
    /// How long a fingerprint stays in the deduplication cache.
    pub dedup_window_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handler_buffer: 256,
            incoming_queue: 4096,
            dedup_window_secs: 120,
        }
    }
}

impl ChannelConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

/// Connection handshake parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Protocol identifier both sides of a handshake must agree on.
    pub protocol_id: String,
    /// Largest accepted handshake frame, in bytes.
    pub max_frame_size: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_id: "/threshold-net/handshake/1.0.0".to_string(),
            // Enough space for an encoded envelope with a message, peer id and signature.
            max_frame_size: 1024,
        }
    }
}

/// Protocol state machine scheduling.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Messages buffered while a state is busy initiating.
    pub receive_buffer: usize,
    /// How often an asynchronous state gets asked whether it can transition.
    pub transition_check_interval_ms: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            receive_buffer: 512,
            transition_check_interval_ms: 100,
        }
    }
}

impl MachineConfig {
    pub fn transition_check_interval(&self) -> Duration {
        Duration::from_millis(self.transition_check_interval_ms)
    }
}

impl Config {
    /// Parse a configuration from a TOML document, and validate it.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    ///
    /// A missing file is not an error: the defaults are returned instead.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        positive("retransmission.interval_ms", self.retransmission.interval_ms)?;
        positive("channel.handler_buffer", self.channel.handler_buffer as u64)?;
        positive("channel.incoming_queue", self.channel.incoming_queue as u64)?;
        positive("channel.dedup_window_secs", self.channel.dedup_window_secs)?;
        positive("handshake.max_frame_size", self.handshake.max_frame_size as u64)?;
        positive("machine.receive_buffer", self.machine.receive_buffer as u64)?;
        positive(
            "machine.transition_check_interval_ms",
            self.machine.transition_check_interval_ms,
        )?;
        if self.handshake.protocol_id.is_empty() {
            return Err(ConfigError::Invalid {
                field: "handshake.protocol_id",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
