use crate::system::config::LinkConfig;
use crate::types::ScaleType;
use embassy_time::{Duration, Instant};
use log::debug;

/// Packet-freshness and heartbeat bookkeeping for one connection.
///
/// The transport's own disconnect callback is not reliable enough on its own, so
/// a link that stops producing decodable frames for longer than the freshness
/// window is declared dead here.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    armed_at: Option<Instant>,
    last_packet: Option<Instant>,
    last_heartbeat: Option<Instant>,
    packet_period: Option<Duration>,
    last_health_log: Option<Instant>,
    freshness_window: Duration,
    heartbeat_period: Duration,
    health_log_interval: Duration,
}

impl LivenessMonitor {
    pub fn new(freshness_window: Duration, heartbeat_period: Duration) -> Self {
        Self {
            armed_at: None,
            last_packet: None,
            last_heartbeat: None,
            packet_period: None,
            last_health_log: None,
            freshness_window,
            heartbeat_period,
            health_log_interval: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        let mut monitor = Self::new(
            Duration::from_millis(config.freshness_window_ms),
            Duration::from_millis(config.heartbeat_period_ms),
        );
        monitor.health_log_interval = Duration::from_millis(config.health_log_interval_ms);
        monitor
    }

    /// Starts both clocks when the link becomes usable.
    pub fn arm(&mut self, now: Instant) {
        self.armed_at = Some(now);
        self.last_packet = None;
        self.packet_period = None;
        self.last_heartbeat = Some(now);
        self.last_health_log = Some(now);
    }

    pub fn reset(&mut self) {
        self.armed_at = None;
        self.last_packet = None;
        self.last_heartbeat = None;
        self.packet_period = None;
        self.last_health_log = None;
    }

    /// Records a successfully decoded frame and returns the gap since the previous one.
    pub fn record_packet(&mut self, now: Instant) -> Option<Duration> {
        let interval = self
            .last_packet
            .map(|previous| now.saturating_duration_since(previous));
        if interval.is_some() {
            self.packet_period = interval;
        }
        self.last_packet = Some(now);
        interval
    }

    pub fn record_heartbeat(&mut self, now: Instant) {
        self.last_heartbeat = Some(now);
    }

    /// True once the freshness window has passed without a decoded frame.
    pub fn is_stale(&self, now: Instant) -> bool {
        match self.last_packet.or(self.armed_at) {
            Some(reference) => now.saturating_duration_since(reference) > self.freshness_window,
            None => false,
        }
    }

    pub fn heartbeat_due(&self, now: Instant, scale_type: Option<ScaleType>) -> bool {
        if !scale_type.is_some_and(|t| t.needs_heartbeat()) {
            return false;
        }
        match self.last_heartbeat {
            Some(sent) => now.saturating_duration_since(sent) > self.heartbeat_period,
            None => true,
        }
    }

    pub fn since_last_packet(&self, now: Instant) -> Option<Duration> {
        self.last_packet
            .map(|t| now.saturating_duration_since(t))
    }

    pub fn since_last_heartbeat(&self, now: Instant) -> Option<Duration> {
        self.last_heartbeat
            .map(|t| now.saturating_duration_since(t))
    }

    pub fn packet_period(&self) -> Option<Duration> {
        self.packet_period
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// Emits the periodic packet-health line while connected.
    pub fn log_health(&mut self, now: Instant) {
        let due = self
            .last_health_log
            .map_or(true, |t| now.saturating_duration_since(t) >= self.health_log_interval);
        if !due {
            return;
        }
        self.last_health_log = Some(now);
        match self.since_last_packet(now) {
            Some(age) => debug!(
                "Packet health check: last packet {}ms ago (timeout at {}ms)",
                age.as_millis(),
                self.freshness_window.as_millis()
            ),
            None => debug!("Packet health check: no packets yet since connect"),
        }
    }
}
