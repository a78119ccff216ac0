//! Options handed to the remote collaborator.
//!
//! Keys use the camelCase spelling socket.io clients expect, so the same
//! object can travel over the channel unchanged. Keys this crate does not
//! know about (`auth`, `query`, `path`, ...) are kept in `extra`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Transports, fastest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Websocket,
    Webtransport,
    Polling,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketOptions {
    /// The hub and the direct fallback both connect explicitly.
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default = "default_reconnection")]
    pub reconnection: bool,
    /// Milliseconds before the first reconnection attempt.
    #[serde(default = "default_reconnection_delay")]
    pub reconnection_delay: u64,
    /// Upper bound on the reconnection delay, in milliseconds.
    #[serde(default = "default_reconnection_delay_max")]
    pub reconnection_delay_max: u64,
    #[serde(default = "default_reconnection_attempts")]
    pub reconnection_attempts: u64,
    #[serde(default = "default_transports")]
    pub transports: Vec<Transport>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_reconnection() -> bool {
    true
}
fn default_reconnection_delay() -> u64 {
    500
}
fn default_reconnection_delay_max() -> u64 {
    5000
}
fn default_reconnection_attempts() -> u64 {
    1_000_000_000_000
}
fn default_transports() -> Vec<Transport> {
    vec![Transport::Websocket, Transport::Polling]
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            auto_connect: false,
            reconnection: default_reconnection(),
            reconnection_delay: default_reconnection_delay(),
            reconnection_delay_max: default_reconnection_delay_max(),
            reconnection_attempts: default_reconnection_attempts(),
            transports: default_transports(),
            extra: Map::new(),
        }
    }
}

impl SocketOptions {
    /// Overlay caller overrides key by key; an override wins on collision.
    pub fn merged(&self, overrides: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        let Value::Object(mut base) = serde_json::to_value(self)? else {
            return Err(serde::de::Error::custom("options did not serialize to an object"));
        };
        for (key, value) in overrides {
            base.insert(key.clone(), value.clone());
        }
        serde_json::from_value(Value::Object(base))
    }

    /// Delay before the `attempt`-th reconnection (0-based), doubling each
    /// time and capped at `reconnection_delay_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self
            .reconnection_delay
            .saturating_mul(factor)
            .min(self.reconnection_delay_max);
        Duration::from_millis(delay)
    }
}
