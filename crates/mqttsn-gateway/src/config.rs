// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file is a
//! valid configuration. Command-line flags are applied on top by `main`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway name (for identification in logs).
    #[serde(default = "default_name")]
    pub name: String,

    /// Address the MQTT-SN UDP socket binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// MQTT-SN UDP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest datagram accepted or sent, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Seconds a pending message may wait for its REGACK.
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_secs: u64,

    /// Period of the pending/keep-alive sweeper (seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Statistics reporting interval (seconds, 0 disables).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Wait after the broker disconnect during shutdown (milliseconds).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Upstream broker connection.
    #[serde(default)]
    pub broker: BrokerConfig,
}

/// Connection to the upstream MQTT broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    /// MQTT client id of the single aggregated broker session.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Bound on connect and on every broker receipt (seconds).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// QoS used for broker publishes and subscriptions.
    #[serde(default = "default_broker_qos")]
    pub qos: u8,

    /// Capacity of the rumqttc request channel and of the delivery channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_name() -> String {
    "mqttsn-gateway".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1884
}

fn default_max_message_size() -> usize {
    1024
}

fn default_pending_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_stats_interval() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "mqttsn-gateway".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_timeout() -> u64 {
    10
}

fn default_broker_qos() -> u8 {
    2
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            bind_address: default_bind_address(),
            port: default_port(),
            max_message_size: default_max_message_size(),
            pending_timeout_secs: default_pending_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            stats_interval_secs: default_stats_interval(),
            shutdown_grace_ms: default_shutdown_grace(),
            log_level: default_log_level(),
            broker: BrokerConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            timeout_secs: default_timeout(),
            qos: default_broker_qos(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML (used by `gen-config`).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        // Smallest useful PUBLISH: 7 header bytes + 1 payload byte.
        if self.max_message_size < 8 {
            return Err(ConfigError::Invalid(
                "max_message_size must be >= 8".into(),
            ));
        }
        if self.max_message_size > crate::protocol::MAX_MESSAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_message_size must be <= {}",
                crate::protocol::MAX_MESSAGE_SIZE
            )));
        }
        if self.pending_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "pending_timeout_secs must be > 0".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_secs must be > 0".into(),
            ));
        }
        self.broker.validate()
    }

    /// Socket address for the UDP listener.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "Invalid bind address {}:{}",
                    self.bind_address, self.port
                ))
            })
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("broker.host is empty".into()));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::Invalid("broker.client_id is empty".into()));
        }
        if self.qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "broker.qos must be 0, 1 or 2 (got {})",
                self.qos
            )));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::Invalid(
                "broker.password requires broker.username".into(),
            ));
        }
        // rumqttc rejects keep-alives below 5 seconds.
        if self.keep_alive_secs < 5 {
            return Err(ConfigError::Invalid(
                "broker.keep_alive_secs must be >= 5".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("broker.timeout_secs must be > 0".into()));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broker.channel_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
