use crate::types::{ConnectionState, ScaleType, WeightSample};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, mutex::Mutex};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MAX_LOG_MESSAGES: usize = 50;

/// What the UI core sees of the scale link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub scale_type: Option<ScaleType>,
    pub weight_g: f32,
    pub battery_percent: Option<u8>,
    pub packet_period_ms: Option<u64>,
    pub last_failure: Option<String>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            connected: false,
            scale_type: None,
            weight_g: 0.0,
            battery_percent: None,
            packet_period_ms: None,
            last_failure: None,
        }
    }
}

impl LinkStatus {
    /// Same connection picture, ignoring the fast-moving weight fields.
    pub fn same_link(&self, other: &LinkStatus) -> bool {
        self.state == other.state
            && self.connected == other.connected
            && self.scale_type == other.scale_type
            && self.battery_percent == other.battery_percent
            && self.last_failure == other.last_failure
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkState {
    pub status: LinkStatus,
    pub last_sample_g: Option<f32>,
    pub log_messages: heapless::Vec<String, MAX_LOG_MESSAGES>,
    log_counter: u32,
}

pub struct StateManager {
    state: Arc<Mutex<CriticalSectionRawMutex, LinkState>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LinkState::default())),
        }
    }

    pub async fn update_status(&self, status: LinkStatus) {
        let mut state = self.state.lock().await;
        if state.status.state != status.state {
            debug!("Link state changed: {} -> {}", state.status.state, status.state);
        }
        if state.status.connected != status.connected {
            info!(
                "Scale connection changed: {}",
                if status.connected { "Connected" } else { "Disconnected" }
            );
            let message = format!(
                "Scale: {}",
                if status.connected { "Connected" } else { "Disconnected" }
            );
            Self::add_log_message(&mut state, message);
        }
        if status.last_failure.is_some() && state.status.last_failure != status.last_failure {
            let message = format!("ERROR: {}", status.last_failure.as_deref().unwrap_or_default());
            Self::add_log_message(&mut state, message);
        }
        state.status = status;
    }

    pub async fn update_sample(&self, sample: WeightSample) {
        let mut state = self.state.lock().await;
        state.status.weight_g = sample.weight_g;
        state.last_sample_g = Some(sample.weight_g);
        if let Some(interval) = sample.interval {
            state.status.packet_period_ms = Some(interval.as_millis());
        }
    }

    fn add_log_message(state: &mut LinkState, message: String) {
        state.log_counter = state.log_counter.wrapping_add(1);
        let log_entry = format!("[{}] {}", state.log_counter, message);

        if state.log_messages.is_full() {
            state.log_messages.remove(0);
        }
        let _ = state.log_messages.push(log_entry);
    }

    pub async fn get_status(&self) -> LinkStatus {
        let state = self.state.lock().await;
        state.status.clone()
    }

    pub async fn get_current_weight(&self) -> Option<f32> {
        let state = self.state.lock().await;
        state.last_sample_g
    }

    pub async fn is_scale_connected(&self) -> bool {
        let state = self.state.lock().await;
        state.status.connected
    }

    pub async fn get_full_state(&self) -> LinkState {
        let state = self.state.lock().await;
        state.clone()
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
