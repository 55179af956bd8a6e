use embassy_time::{Duration, Instant};
use serde::{Deserialize, Serialize};

/// Protocol family spoken by the connected scale.
///
/// Chosen once while the handshake enumerates characteristics and fixed for the
/// rest of that connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleType {
    /// Lunar before 2021, 10-byte weight frames on 0x2A80
    Old,
    /// Lunar 2021+, Pyxis, Pearl S
    New,
    /// Felicita Arc and other ASCII streamers
    Generic,
}

impl ScaleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleType::Old => "OLD",
            ScaleType::New => "NEW",
            ScaleType::Generic => "GENERIC",
        }
    }

    /// Only the Acaia families drop the link without a periodic heartbeat.
    pub fn needs_heartbeat(&self) -> bool {
        matches!(self, ScaleType::Old | ScaleType::New)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Subscribing,
    Identifying,
    Battery,
    Notifications,
    Connected,
    Failed,
    ReconnectDelay,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Scanning => "Scanning",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Discovering => "Discovering",
            ConnectionState::Subscribing => "Subscribing",
            ConnectionState::Identifying => "Identifying",
            ConnectionState::Battery => "Battery",
            ConnectionState::Notifications => "Notifications",
            ConnectionState::Connected => "Connected",
            ConnectionState::Failed => "Failed",
            ConnectionState::ReconnectDelay => "ReconnectDelay",
        }
    }

    /// Idle and Connected never time out.
    pub fn is_stable(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Connected)
    }

    /// Scanning through Notifications.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            ConnectionState::Scanning
                | ConnectionState::Connecting
                | ConnectionState::Discovering
                | ConnectionState::Subscribing
                | ConnectionState::Identifying
                | ConnectionState::Battery
                | ConnectionState::Notifications
        )
    }

    /// States in which a link to the peer exists or is being brought up.
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            ConnectionState::Discovering
                | ConnectionState::Subscribing
                | ConnectionState::Identifying
                | ConnectionState::Battery
                | ConnectionState::Notifications
                | ConnectionState::Connected
        )
    }
}

impl core::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest decoded weight, in grams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightSample {
    pub weight_g: f32,
    pub received_at: Instant,
    /// Gap since the previous valid sample, `None` for the first one after connecting.
    pub interval: Option<Duration>,
}

pub const HEARTBEAT_PERIOD_MS: u64 = 2750;
// Longer than the heartbeat so a pause around command responses is tolerated
pub const MAX_PACKET_PERIOD_MS: u64 = 8000;
pub const SETTLE_DELAY_MS: u64 = 200;
pub const RECONNECT_DELAY_MS: u64 = 500;
pub const STEP_INTERVAL_MS: u64 = 10;
