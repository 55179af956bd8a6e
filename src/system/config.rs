//! Link timing configuration

use crate::types::{HEARTBEAT_PERIOD_MS, MAX_PACKET_PERIOD_MS, RECONNECT_DELAY_MS, SETTLE_DELAY_MS};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Timing budgets for the connection handshake and the live link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub discover_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    pub identify_timeout_ms: u64,
    pub battery_timeout_ms: u64,
    pub notifications_timeout_ms: u64,
    /// Pause after each command before the next one is sent
    pub settle_delay_ms: u64,
    pub reconnect_delay_ms: u64,
    pub heartbeat_period_ms: u64,
    pub freshness_window_ms: u64,
    pub battery_response_window_ms: u64,
    pub health_log_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            discover_timeout_ms: 5_000,
            subscribe_timeout_ms: 5_000,
            identify_timeout_ms: 5_000,
            battery_timeout_ms: 2_000,
            notifications_timeout_ms: 2_000,
            settle_delay_ms: SETTLE_DELAY_MS,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            heartbeat_period_ms: HEARTBEAT_PERIOD_MS,
            freshness_window_ms: MAX_PACKET_PERIOD_MS,
            battery_response_window_ms: 1_000,
            health_log_interval_ms: 5_000,
        }
    }
}

impl LinkConfig {
    /// Parses a (possibly partial) JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: LinkConfig =
            serde_json::from_str(json).context("invalid scale link configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.freshness_window_ms <= self.heartbeat_period_ms {
            bail!(
                "freshness window ({}ms) must exceed the heartbeat period ({}ms)",
                self.freshness_window_ms,
                self.heartbeat_period_ms
            );
        }
        let command_stages = [
            ("identify", self.identify_timeout_ms),
            ("battery", self.battery_timeout_ms),
            ("notifications", self.notifications_timeout_ms),
        ];
        for (stage, budget) in command_stages {
            if self.settle_delay_ms >= budget {
                bail!(
                    "settle delay ({}ms) leaves no time for the {} stage ({}ms)",
                    self.settle_delay_ms,
                    stage,
                    budget
                );
            }
        }
        if self.scan_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            bail!("scan and connect timeouts must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan_timeout_ms, 10_000);
        assert_eq!(config.settle_delay_ms, 200);
        assert_eq!(config.reconnect_delay_ms, 500);
        assert!(config.freshness_window_ms > config.heartbeat_period_ms);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = LinkConfig::from_json(r#"{ "scan_timeout_ms": 15000 }"#).unwrap();
        assert_eq!(config.scan_timeout_ms, 15_000);
        assert_eq!(config.connect_timeout_ms, 5_000);
    }

    #[test]
    fn test_freshness_must_exceed_heartbeat() {
        let result = LinkConfig::from_json(r#"{ "freshness_window_ms": 2000 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_settle_must_fit_command_stages() {
        let config = LinkConfig {
            settle_delay_ms: 2_000,
            ..LinkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(LinkConfig::from_json("{ scan_timeout_ms: }").is_err());
    }
}
