//! Session timing configuration shared by client and server cores.

use serde::Deserialize;

/// Server sweep runs every `SWEEP_PERIODS` heartbeat periods.
pub const SWEEP_PERIODS: u64 = 2;
/// Server evicts a peer silent for more than `STALE_PERIODS` heartbeat periods.
pub const STALE_PERIODS: u64 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Heartbeat period in ms (default 1000).
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,
    /// Connect-timeout watchdog in ms (default 5000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Unanswered heartbeats tolerated before the link is considered lost (default 3).
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
    /// Reconnect after heartbeat exhaustion or transport loss instead of disconnecting (default true).
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
}

fn default_heartbeat_period_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_max_missed_heartbeats() -> u32 {
    3
}
fn default_auto_reconnect() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_period_ms: default_heartbeat_period_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            auto_reconnect: default_auto_reconnect(),
        }
    }
}

impl SessionConfig {
    pub fn sweep_interval_ms(&self) -> u64 {
        self.heartbeat_period_ms.saturating_mul(SWEEP_PERIODS)
    }

    pub fn stale_after_ms(&self) -> u64 {
        self.heartbeat_period_ms.saturating_mul(STALE_PERIODS)
    }
}
