//! Broker session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::SessionSettings;

/// Gateway connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Gateway host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Gateway port (7497 paper TWS, 7496 live TWS, 4002/4001 gateway).
    #[serde(default = "default_port")]
    pub port: u16,
    /// API client id.
    #[serde(default = "default_client_id")]
    pub client_id: i32,
    /// Connect attempt cap.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Delay between connect attempts (ms).
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    /// Wait before reconnecting after an unsolicited disconnect (ms).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Bound on every request round-trip (ms).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Wait after a new realtime subscription before reading it (ms).
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl BrokerConfig {
    /// Session timing derived from this config.
    #[must_use]
    pub const fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect_attempts: self.connect_attempts,
            connect_retry_delay: Duration::from_millis(self.connect_retry_delay_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    /// Settle delay as a duration.
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    7497
}

const fn default_client_id() -> i32 {
    1
}

const fn default_connect_attempts() -> u32 {
    5
}

const fn default_connect_retry_delay_ms() -> u64 {
    2000
}

const fn default_reconnect_delay_ms() -> u64 {
    5000
}

const fn default_request_timeout_ms() -> u64 {
    10_000
}

const fn default_settle_delay_ms() -> u64 {
    500
}
