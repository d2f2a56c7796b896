//! Configuration management for the network layer

use crate::http::parse_url;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Network layer configuration
///
/// Nothing in the library reads the environment on its own; an embedding
/// application that wants environment-driven settings calls [`NetConfig::from_env`]
/// and hands the result to [`crate::NetworkRuntime::init`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetConfig {
    /// Worker slots for the async HTTP pool
    #[serde(default = "default_async_max_threads")]
    pub async_max_threads: u32,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Maximum HTTP header block size in bytes
    #[serde(default = "default_header_max")]
    pub header_max: usize,

    /// Maximum buffered HTTP response body in bytes
    #[serde(default = "default_response_max")]
    pub response_max: usize,

    /// Seconds between keep-alive pings on a WebSocket
    #[serde(default = "default_ws_ping_interval_secs")]
    pub ws_ping_interval_secs: u64,

    /// Seconds without a pong before a WebSocket peer is considered dead
    #[serde(default = "default_ws_pong_timeout_secs")]
    pub ws_pong_timeout_secs: u64,

    /// Largest WebSocket payload accepted on read
    #[serde(default = "default_ws_message_max")]
    pub ws_message_max: usize,

    /// Datagram MTU used for DTLS sessions
    #[serde(default = "default_dtls_mtu")]
    pub dtls_mtu: usize,

    /// User-Agent sent when the caller does not supply one
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Initial HTTP proxy URL
    #[serde(default)]
    pub proxy: Option<String>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            async_max_threads: default_async_max_threads(),
            connect_timeout_ms: default_connect_timeout_ms(),
            header_max: default_header_max(),
            response_max: default_response_max(),
            ws_ping_interval_secs: default_ws_ping_interval_secs(),
            ws_pong_timeout_secs: default_ws_pong_timeout_secs(),
            ws_message_max: default_ws_message_max(),
            dtls_mtu: default_dtls_mtu(),
            user_agent: default_user_agent(),
            proxy: None,
        }
    }
}

impl NetConfig {
    /// Load configuration from `TETHER_`-prefixed environment variables
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed("TETHER_").from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.async_max_threads == 0 {
            return Err(Error::Config("async_max_threads must be at least 1".to_string()));
        }

        if self.header_max < 64 {
            return Err(Error::Config("header_max must be at least 64 bytes".to_string()));
        }

        if self.response_max == 0 {
            return Err(Error::Config("response_max cannot be zero".to_string()));
        }

        if self.ws_ping_interval_secs == 0 {
            return Err(Error::Config("ws_ping_interval_secs cannot be zero".to_string()));
        }

        if self.ws_pong_timeout_secs <= self.ws_ping_interval_secs {
            return Err(Error::Config(
                "ws_pong_timeout_secs must exceed ws_ping_interval_secs".to_string(),
            ));
        }

        // Room for a DTLS header, AEAD tag and at least one byte of payload
        if self.dtls_mtu < 64 || self.dtls_mtu > 65_535 {
            return Err(Error::Config("dtls_mtu must be between 64 and 65535".to_string()));
        }

        if let Some(proxy) = &self.proxy {
            parse_url(proxy)
                .map_err(|e| Error::Config(format!("Invalid proxy URL '{}': {}", proxy, e)))?;
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ws_ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_secs)
    }

    pub fn ws_pong_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_pong_timeout_secs)
    }
}

// Default value functions
fn default_async_max_threads() -> u32 {
    8
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_header_max() -> usize {
    crate::MAX_HEADER_SIZE
}

fn default_response_max() -> usize {
    crate::MAX_RESPONSE_SIZE
}

fn default_ws_ping_interval_secs() -> u64 {
    60
}

fn default_ws_pong_timeout_secs() -> u64 {
    180
}

fn default_ws_message_max() -> usize {
    1024 * 1024
}

fn default_dtls_mtu() -> usize {
    1200
}

fn default_user_agent() -> String {
    format!("tether/{}", crate::VERSION)
}
