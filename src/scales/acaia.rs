// acaia.rs - Non-blocking connection state machine for Acaia and Felicita scales
// Drives scan -> connect -> discover -> subscribe -> identify -> battery -> notifications
// one bounded slice per step() call, and owns the cached weight/battery state.

use crate::ble::{
    BleAddress, BleError, ConnectionParams, DiscoveredDevice, HandleSet, ScaleProfile,
    ScaleTransport, Service, SharedHandles, TransportContext, TransportEvent,
    TransportEventChannel, SCALE_PROFILES, TRANSPORT_EVENT_DEPTH,
};
use crate::protocol::{
    battery_request, decode_battery, decode_weight, tare_command, HEARTBEAT_COMMAND,
    IDENTIFY_COMMAND, NOTIFICATION_REQUEST, RESET_TIMER_COMMAND, START_TIMER_COMMAND,
    STOP_TIMER_COMMAND,
};
use crate::scales::discovery::DeviceFilter;
use crate::scales::liveness::LivenessMonitor;
use crate::system::clock::{Clock, SystemClock};
use crate::system::config::LinkConfig;
use crate::system::watchdog::{NoopWatchdog, Watchdog};
use crate::types::{ConnectionState, ScaleType, WeightSample};
use embassy_time::{Duration, Instant};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

pub const LIBRARY_VERSION: &str = "3.0.0";

/// Why the session last dropped into `Failed`. All causes recover the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Timeout(ConnectionState),
    TransportFailure,
    AsyncDisconnect,
    ProtocolMismatch,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FailureCause::Timeout(state) => write!(f, "timeout in {}", state),
            FailureCause::TransportFailure => write!(f, "transport operation failed"),
            FailureCause::AsyncDisconnect => write!(f, "scale disconnected"),
            FailureCause::ProtocolMismatch => write!(f, "no known characteristic set"),
        }
    }
}

#[derive(Debug)]
pub enum LinkError {
    /// A handshake is already running or the link is up.
    AlreadyActive(ConnectionState),
    NotConnected,
    Transport(BleError),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LinkError::AlreadyActive(state) => write!(f, "Connection already active ({})", state),
            LinkError::NotConnected => write!(f, "Not connected to scale"),
            LinkError::Transport(e) => write!(f, "BLE error: {}", e),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<BleError> for LinkError {
    fn from(error: BleError) -> Self {
        LinkError::Transport(error)
    }
}

/// Long-lived connection to one scale.
///
/// `step()` must be called from a single polling context on a fixed cadence.
/// Transport callbacks never touch this struct; they post into the event queue
/// drained at the top of every step and may empty the shared handle slot.
pub struct ScaleSession<T, C = SystemClock, W = NoopWatchdog> {
    transport: T,
    clock: C,
    watchdog: W,
    config: LinkConfig,
    events: Arc<TransportEventChannel>,
    handles: SharedHandles,

    state: ConnectionState,
    state_entered: Instant,
    state_timeout: Duration,
    filter: DeviceFilter,
    device: Option<DiscoveredDevice>,
    services: Vec<Service>,
    scale_type: Option<ScaleType>,
    battery_requested_at: Option<Instant>,

    sample: Option<WeightSample>,
    new_sample: bool,
    battery: Option<u8>,
    liveness: LivenessMonitor,
    connected: bool,
    is_brewing: bool,
    last_failure: Option<FailureCause>,
    rejected_frames: u32,
}

impl<T: ScaleTransport> ScaleSession<T> {
    pub fn new(transport: T, config: LinkConfig) -> Self {
        Self::with_parts(transport, config, SystemClock, NoopWatchdog)
    }
}

impl<T: ScaleTransport, C: Clock, W: Watchdog> ScaleSession<T, C, W> {
    pub fn with_parts(mut transport: T, config: LinkConfig, clock: C, watchdog: W) -> Self {
        let events = Arc::new(TransportEventChannel::new());
        let handles = SharedHandles::new();
        transport.register_callbacks(TransportContext {
            events: Arc::clone(&events),
            disconnect: handles.disconnect_token(),
        });
        let state_entered = clock.now();
        let liveness = LivenessMonitor::from_config(&config);

        Self {
            transport,
            clock,
            watchdog,
            config,
            events,
            handles,
            state: ConnectionState::Idle,
            state_entered,
            state_timeout: Duration::from_ticks(0),
            filter: DeviceFilter::any_scale(),
            device: None,
            services: Vec::new(),
            scale_type: None,
            battery_requested_at: None,
            sample: None,
            new_sample: false,
            battery: None,
            liveness,
            connected: false,
            is_brewing: false,
            last_failure: None,
            rejected_frames: 0,
        }
    }

    /// Starts a handshake. Rejected unless the session is Idle or Failed.
    pub fn begin(&mut self, target: Option<BleAddress>) -> Result<(), LinkError> {
        if !matches!(self.state, ConnectionState::Idle | ConnectionState::Failed) {
            // Called on every loop iteration by some drivers, keep it quiet
            trace!("begin() ignored in state {}", self.state);
            return Err(LinkError::AlreadyActive(self.state));
        }

        info!("Scale link v{} - starting non-blocking connection", LIBRARY_VERSION);
        if self.state == ConnectionState::Failed {
            self.teardown();
        }
        self.filter = DeviceFilter::for_address(target);
        if let Some(ref address) = self.filter.target {
            info!("Only accepting scale at {}", address);
        }
        self.start_scan()
    }

    /// Advances the handshake by at most one unit of work. Never sleeps.
    /// Returns true only while Connected.
    pub fn step(&mut self) -> bool {
        self.watchdog.feed();
        let now = self.clock.now();

        let state_at_entry = self.state;
        self.drain_events(now);
        if self.state != state_at_entry {
            return false;
        }

        if self.state_expired(now) {
            if self.state == ConnectionState::Battery {
                // Best-effort stage: running out of time just moves on
                info!("Battery stage budget spent, continuing without battery level");
                self.transition(ConnectionState::Notifications, self.config.notifications_timeout_ms);
            } else {
                warn!("State timeout: {}", self.state);
                self.fail(FailureCause::Timeout(self.state));
            }
            return false;
        }

        match self.state {
            ConnectionState::Idle => {}
            ConnectionState::Scanning => self.state_scanning(),
            ConnectionState::Connecting => self.state_connecting(),
            ConnectionState::Discovering => self.state_discovering(),
            ConnectionState::Subscribing => self.state_subscribing(),
            ConnectionState::Identifying => self.state_identifying(now),
            ConnectionState::Battery => self.state_battery(now),
            ConnectionState::Notifications => self.state_notifications(now),
            ConnectionState::Connected => self.state_connected(now),
            ConnectionState::Failed => {
                info!("Connection failed - cleaning up before reconnect");
                self.teardown();
                self.transition(ConnectionState::ReconnectDelay, self.config.reconnect_delay_ms);
            }
            ConnectionState::ReconnectDelay => self.state_reconnect_delay(now),
        }

        self.state == ConnectionState::Connected
    }

    pub fn tare(&mut self) -> Result<(), LinkError> {
        let frame = tare_command(self.scale_type.unwrap_or(ScaleType::New));
        self.send_command(frame, "tare")
    }

    pub fn start_timer(&mut self) -> Result<(), LinkError> {
        self.send_command(&START_TIMER_COMMAND, "start timer")
    }

    pub fn stop_timer(&mut self) -> Result<(), LinkError> {
        self.send_command(&STOP_TIMER_COMMAND, "stop timer")
    }

    pub fn reset_timer(&mut self) -> Result<(), LinkError> {
        self.send_command(&RESET_TIMER_COMMAND, "reset timer")
    }

    /// Keeps Acaia scales streaming. Generic scales need none and succeed without a write.
    pub fn heartbeat(&mut self) -> Result<(), LinkError> {
        if self.scale_type == Some(ScaleType::Generic) {
            if self.state == ConnectionState::Connected && self.connected {
                return Ok(());
            }
            return Err(LinkError::NotConnected);
        }

        let now = self.clock.now();
        if let Some(age) = self.liveness.since_last_packet(now) {
            debug!(
                "Sending heartbeat (last packet {}ms ago, timeout={}ms)",
                age.as_millis(),
                self.config.freshness_window_ms
            );
        }
        self.send_command(&HEARTBEAT_COMMAND, "heartbeat")?;
        self.liveness.record_heartbeat(now);
        Ok(())
    }

    pub fn heartbeat_required(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.liveness.heartbeat_due(self.clock.now(), self.scale_type)
    }

    /// Latest weight in grams, 0.0 before the first sample.
    pub fn current_weight(&self) -> f32 {
        self.sample.map_or(0.0, |s| s.weight_g)
    }

    pub fn latest_sample(&self) -> Option<WeightSample> {
        self.sample
    }

    /// True if a sample arrived since the last `take_new_sample()` and the
    /// stream is still fresh.
    pub fn new_weight_available(&self) -> bool {
        self.connected && self.new_sample && !self.liveness.is_stale(self.clock.now())
    }

    pub fn take_new_sample(&mut self) -> Option<WeightSample> {
        if std::mem::take(&mut self.new_sample) {
            self.sample
        } else {
            None
        }
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.battery
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// True from Scanning through Notifications and while waiting to reconnect.
    pub fn is_connecting(&self) -> bool {
        self.state.is_handshake() || self.state == ConnectionState::ReconnectDelay
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn state_name(&self) -> &'static str {
        self.state.as_str()
    }

    pub fn scale_type(&self) -> Option<ScaleType> {
        self.scale_type
    }

    pub fn packet_period(&self) -> Option<Duration> {
        self.liveness.packet_period()
    }

    pub fn last_failure(&self) -> Option<FailureCause> {
        self.last_failure
    }

    /// Frames dropped because they did not match the selected scale's shape.
    pub fn rejected_frames(&self) -> u32 {
        self.rejected_frames
    }

    pub fn set_is_brewing(&mut self, brewing: bool) {
        self.is_brewing = brewing;
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    // --- state handlers ---

    fn state_scanning(&mut self) {
        if let Some(ref device) = self.device {
            info!(
                "Scale found: {} ({}, RSSI {} dBm)",
                device.name.as_deref().unwrap_or("?"),
                device.address,
                device.rssi
            );
            self.transport.scan_stop();
            self.transition(ConnectionState::Connecting, self.config.connect_timeout_ms);
        }
    }

    fn state_connecting(&mut self) {
        let Some(address) = self.device.as_ref().map(|d| d.address) else {
            error!("Connecting without a discovered device");
            self.fail(FailureCause::TransportFailure);
            return;
        };

        info!("Connecting to {} ...", address);
        match self.transport.connect(&address, &ConnectionParams::default()) {
            Ok(()) if self.transport.is_connected() => {
                info!("Connected");
                self.transition(ConnectionState::Discovering, self.config.discover_timeout_ms);
            }
            Ok(()) => {
                error!("Link dropped right after connect");
                self.fail(FailureCause::AsyncDisconnect);
            }
            Err(e) => {
                error!("Connection failed: {}", e);
                self.device = None;
                self.fail(FailureCause::TransportFailure);
            }
        }
    }

    fn state_discovering(&mut self) {
        if !self.transport.is_connected() {
            error!("Client disconnected before discovery");
            self.fail(FailureCause::AsyncDisconnect);
            return;
        }

        debug!("Discovering services ...");
        match self.transport.discover_services() {
            Ok(services) => {
                // Discovery can take long enough for the scale to drop us
                if !self.transport.is_connected() {
                    error!("Client disconnected during service discovery");
                    self.fail(FailureCause::AsyncDisconnect);
                    return;
                }
                debug!("Discovered {} services", services.len());
                self.services = services;
                self.transition(ConnectionState::Subscribing, self.config.subscribe_timeout_ms);
            }
            Err(e) => {
                error!("Service discovery failed: {}", e);
                self.fail(FailureCause::TransportFailure);
            }
        }
    }

    fn state_subscribing(&mut self) {
        self.watchdog.feed();
        debug!("Finding characteristics ...");

        let Some(device) = self.device.as_ref().map(|d| d.address) else {
            self.fail(FailureCause::TransportFailure);
            return;
        };

        let mut selected = None;
        for profile in SCALE_PROFILES.iter() {
            if !self.transport.is_connected() {
                error!("Client disconnected while probing {} characteristics", profile.scale_type.as_str());
                self.fail(FailureCause::AsyncDisconnect);
                return;
            }
            if let Some(handles) = match_profile(&self.services, profile, device) {
                selected = Some((profile.scale_type, handles));
                break;
            }
        }

        let Some((scale_type, handles)) = selected else {
            error!("Unable to determine scale type or find characteristics");
            self.transport.disconnect();
            self.fail(FailureCause::ProtocolMismatch);
            return;
        };

        match self.scale_type {
            None => {
                info!("{} scale detected", scale_type.as_str());
                self.scale_type = Some(scale_type);
            }
            Some(existing) if existing != scale_type => {
                error!("Scale type changed mid-attempt ({} -> {})", existing.as_str(), scale_type.as_str());
                self.fail(FailureCause::ProtocolMismatch);
                return;
            }
            Some(_) => {}
        }

        if !self.transport.is_connected() {
            error!("Client disconnected before subscription");
            self.fail(FailureCause::AsyncDisconnect);
            return;
        }
        let read_char = handles.read_char;
        self.handles.publish(handles);

        if let Err(e) = self.transport.subscribe(read_char) {
            error!("Subscription failed: {}", e);
            self.fail(FailureCause::TransportFailure);
            return;
        }

        // The scale may have dropped us while subscribe() was in flight
        if self.live_handles().is_none() {
            error!("Scale disconnected during subscription");
            self.fail(FailureCause::AsyncDisconnect);
            return;
        }

        info!("Subscribed to notifications");
        self.transition(ConnectionState::Identifying, self.config.identify_timeout_ms);
    }

    fn state_identifying(&mut self, now: Instant) {
        let Some(handles) = self.live_handles() else {
            error!("Scale disconnected during identify delay");
            self.fail(FailureCause::AsyncDisconnect);
            return;
        };
        if !self.settled(now) {
            return;
        }

        debug!("Sending identify ...");
        if let Err(e) = self.transport.write_value(handles.write_char, &IDENTIFY_COMMAND) {
            error!("Identify write failed: {}", e);
            self.fail(FailureCause::TransportFailure);
            return;
        }
        debug!("Identify sent");
        self.transition(ConnectionState::Battery, self.config.battery_timeout_ms);
    }

    fn state_battery(&mut self, now: Instant) {
        let Some(handles) = self.live_handles() else {
            error!("Scale disconnected during battery delay");
            self.fail(FailureCause::AsyncDisconnect);
            return;
        };
        if !self.settled(now) {
            return;
        }

        if !self.scale_type.is_some_and(|t| t.needs_heartbeat()) {
            debug!("Battery query not supported by this scale, skipping");
            self.transition(ConnectionState::Notifications, self.config.notifications_timeout_ms);
            return;
        }

        let Some(requested_at) = self.battery_requested_at else {
            debug!("Requesting battery ...");
            match self.transport.write_value(handles.write_char, &battery_request()) {
                Ok(()) => self.battery_requested_at = Some(now),
                Err(e) => {
                    warn!("Battery request failed, continuing: {}", e);
                    self.transition(ConnectionState::Notifications, self.config.notifications_timeout_ms);
                }
            }
            return;
        };

        if let Some(percent) = self.battery {
            info!("Battery: {}%", percent);
            self.transition(ConnectionState::Notifications, self.config.notifications_timeout_ms);
        } else if now.saturating_duration_since(requested_at)
            >= Duration::from_millis(self.config.battery_response_window_ms)
        {
            info!("No battery response, continuing");
            self.transition(ConnectionState::Notifications, self.config.notifications_timeout_ms);
        }
    }

    fn state_notifications(&mut self, now: Instant) {
        let Some(handles) = self.live_handles() else {
            error!("Scale disconnected during notifications delay");
            self.fail(FailureCause::AsyncDisconnect);
            return;
        };
        if !self.settled(now) {
            return;
        }

        debug!("Enabling weight notifications: {:02X?}", NOTIFICATION_REQUEST);
        if let Err(e) = self.transport.write_value(handles.write_char, &NOTIFICATION_REQUEST) {
            error!("Notification request write failed: {}", e);
            self.fail(FailureCause::TransportFailure);
            return;
        }

        info!(
            "Weight notifications enabled ({} scale)",
            self.scale_type.map_or("?", |t| t.as_str())
        );
        self.connected = true;
        self.liveness.arm(now);
        self.transition(ConnectionState::Connected, 0);
    }

    fn state_connected(&mut self, now: Instant) {
        if !self.connected {
            error!("Command write failed earlier - dropping link");
            self.fail(FailureCause::TransportFailure);
            return;
        }
        if self.live_handles().is_none() {
            error!("Scale link lost");
            self.fail(FailureCause::AsyncDisconnect);
            return;
        }
        if self.liveness.is_stale(now) {
            error!(
                "Connection timeout - no packets received for more than {}ms",
                self.liveness.freshness_window().as_millis()
            );
            self.fail(FailureCause::Timeout(ConnectionState::Connected));
            return;
        }
        self.liveness.log_health(now);
    }

    fn state_reconnect_delay(&mut self, now: Instant) {
        if now.saturating_duration_since(self.state_entered) < self.state_timeout {
            return;
        }
        info!("Reconnect delay elapsed - restarting scan");
        if let Err(e) = self.start_scan() {
            error!("Failed to restart scan: {}", e);
            self.transition(ConnectionState::Idle, 0);
        }
    }

    // --- helpers ---

    fn start_scan(&mut self) -> Result<(), LinkError> {
        self.device = None;
        self.services.clear();
        self.scale_type = None;
        self.battery_requested_at = None;
        self.battery = None;
        self.sample = None;
        self.new_sample = false;
        self.connected = false;
        self.liveness.reset();

        match self.transport.scan_start() {
            Ok(()) => {
                info!("BLE scan started (non-blocking)");
                self.transition(ConnectionState::Scanning, self.config.scan_timeout_ms);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start scan: {}", e);
                self.fail(FailureCause::TransportFailure);
                Err(LinkError::Transport(e))
            }
        }
    }

    fn drain_events(&mut self, now: Instant) {
        for _ in 0..TRANSPORT_EVENT_DEPTH {
            let Ok(event) = self.events.try_receive() else {
                return;
            };
            match event {
                TransportEvent::DeviceFound(device) => {
                    if self.state == ConnectionState::Scanning
                        && self.device.is_none()
                        && self.filter.matches(&device)
                    {
                        self.device = Some(device);
                    }
                }
                TransportEvent::Disconnected => {
                    if self.state.has_link() || self.state == ConnectionState::Connecting {
                        self.log_disconnect(now);
                        self.fail(FailureCause::AsyncDisconnect);
                        return;
                    }
                    trace!("Ignoring stale disconnect in {}", self.state);
                }
                TransportEvent::Notification(data) => self.handle_notification(now, &data),
            }
        }
    }

    fn handle_notification(&mut self, now: Instant, data: &[u8]) {
        if self.state == ConnectionState::Battery {
            if let Some(percent) = decode_battery(data) {
                self.battery = Some(percent);
                return;
            }
        }
        let Some(scale_type) = self.scale_type else {
            return;
        };

        match decode_weight(scale_type, data) {
            Some(weight_g) => {
                let interval = self.liveness.record_packet(now);
                self.sample = Some(WeightSample {
                    weight_g,
                    received_at: now,
                    interval,
                });
                // Frames seen mid-handshake only refresh the cached weight
                if self.state == ConnectionState::Connected {
                    self.new_sample = true;
                }
                if self.is_brewing {
                    info!(
                        "Weight: {:.2}g (+{}ms)",
                        weight_g,
                        interval.map_or(0, |i| i.as_millis())
                    );
                } else {
                    trace!("Weight: {:.2}g", weight_g);
                }
            }
            None => self.rejected_frames = self.rejected_frames.wrapping_add(1),
        }
    }

    fn send_command(&mut self, frame: &[u8], command_name: &str) -> Result<(), LinkError> {
        if self.state != ConnectionState::Connected || !self.connected {
            debug!("{} failed: not connected", command_name);
            return Err(LinkError::NotConnected);
        }
        // Handles can be cleared by the disconnect callback between any two calls
        let Some(handles) = self.live_handles() else {
            debug!("{} failed: handles released", command_name);
            return Err(LinkError::NotConnected);
        };

        match self.transport.write_value(handles.write_char, frame) {
            Ok(()) => {
                debug!("{} write successful", command_name);
                Ok(())
            }
            Err(e) => {
                error!("{} write failed: {}", command_name, e);
                self.connected = false;
                Err(LinkError::Transport(e))
            }
        }
    }

    /// Snapshot of the handle set, only if the radio still reports a link.
    fn live_handles(&self) -> Option<Arc<HandleSet>> {
        let handles = self.handles.snapshot()?;
        self.transport.is_connected().then_some(handles)
    }

    fn settled(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.state_entered)
            >= Duration::from_millis(self.config.settle_delay_ms)
    }

    fn state_expired(&self, now: Instant) -> bool {
        let bounded = !self.state.is_stable()
            && !matches!(self.state, ConnectionState::Failed | ConnectionState::ReconnectDelay);
        bounded && now.saturating_duration_since(self.state_entered) > self.state_timeout
    }

    fn transition(&mut self, next: ConnectionState, timeout_ms: u64) {
        debug!("{} -> {}", self.state, next);
        self.state = next;
        self.state_entered = self.clock.now();
        self.state_timeout = Duration::from_millis(timeout_ms);
    }

    fn fail(&mut self, cause: FailureCause) {
        if self.state == ConnectionState::Failed {
            return;
        }
        warn!("Connection failed in {}: {}", self.state, cause);
        self.last_failure = Some(cause);
        self.connected = false;
        self.transition(ConnectionState::Failed, 0);
    }

    /// Idempotent: safe to run with any subset of resources already gone.
    fn teardown(&mut self) {
        if self.transport.is_scanning() {
            self.transport.scan_stop();
        }
        if self.transport.is_connected() {
            debug!("Disconnecting client");
            self.transport.disconnect();
        }
        self.handles.clear();
        while self.events.try_receive().is_ok() {}
        self.device = None;
        self.services.clear();
        self.battery_requested_at = None;
        self.connected = false;
        self.liveness.reset();
    }

    fn log_disconnect(&self, now: Instant) {
        let since_packet = self.liveness.since_last_packet(now).map(|d| d.as_millis());
        let since_heartbeat = self.liveness.since_last_heartbeat(now).map(|d| d.as_millis());
        let timed_out = self.liveness.is_stale(now);
        warn!("=== SCALE DISCONNECTED during {} ===", self.state);
        warn!("  Last packet: {:?}ms ago", since_packet);
        warn!(
            "  Last heartbeat: {:?}ms ago (period={}ms)",
            since_heartbeat, self.config.heartbeat_period_ms
        );
        warn!(
            "  Initiated by: {}",
            if timed_out { "us (freshness timeout)" } else { "scale (remote)" }
        );
    }
}

fn match_profile(services: &[Service], profile: &ScaleProfile, device: BleAddress) -> Option<HandleSet> {
    let service = services.iter().find(|s| s.uuid == profile.service)?;
    let read = service
        .characteristic(profile.read_char)
        .filter(|c| c.can_notify)?;
    let write = service
        .characteristic(profile.write_char)
        .filter(|c| c.can_write)?;
    Some(HandleSet {
        device,
        service: service.uuid,
        read_char: read.handle,
        write_char: write.handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{GENERIC_PROFILE, NEW_PROFILE, OLD_PROFILE};
    use crate::ble_mock::{service_for, MockTransport};
    use crate::protocol::{BATTERY_REQUEST_LEN, TARE_GENERIC_COMMAND};
    use crate::system::clock::ManualClock;
    use crate::system::watchdog::tests::CountingWatchdog;
    use std::sync::atomic::Ordering;

    type TestSession = ScaleSession<MockTransport, ManualClock, CountingWatchdog>;

    const SCALE_ADDR: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    const OLD_ONE_GRAM: [u8; 10] = [0xEF, 0xDD, 0x64, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
    const NEW_FIVE_GRAMS: [u8; 13] = [
        0xEF, 0xDD, 0x0C, 0x0C, 0x05, 0xF4, 0x01, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00,
    ];

    fn setup(name: &str, profile: &ScaleProfile) -> (TestSession, MockTransport, ManualClock, CountingWatchdog) {
        let mock = MockTransport::with_scale(name, BleAddress::new(SCALE_ADDR), profile);
        let clock = ManualClock::starting_at(Instant::from_millis(1_000));
        let dog = CountingWatchdog::default();
        let session = ScaleSession::with_parts(mock.clone(), LinkConfig::default(), clock.clone(), dog.clone());
        (session, mock, clock, dog)
    }

    fn run_until(session: &mut TestSession, clock: &ManualClock, target: ConnectionState) {
        for _ in 0..2_000 {
            session.step();
            if session.connection_state() == target {
                return;
            }
            clock.advance_ms(10);
        }
        panic!("never reached {} (stuck in {})", target, session.state_name());
    }

    fn connected(name: &str, profile: &ScaleProfile) -> (TestSession, MockTransport, ManualClock) {
        let (mut session, mock, clock, _) = setup(name, profile);
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Connected);
        mock.clear_written();
        (session, mock, clock)
    }

    #[test]
    fn test_full_handshake_new_scale() {
        let (mut session, mock, clock, dog) = setup("LUNAR-2021", &NEW_PROFILE);
        assert_eq!(session.state_name(), "Idle");
        assert!(session.begin(None).is_ok());
        assert_eq!(session.state_name(), "Scanning");

        run_until(&mut session, &clock, ConnectionState::Connected);

        assert!(session.is_connected());
        assert!(!session.is_connecting());
        assert_eq!(session.scale_type(), Some(ScaleType::New));
        let frames = mock.written_frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], IDENTIFY_COMMAND);
        assert_eq!(frames[1].len(), BATTERY_REQUEST_LEN);
        assert_eq!(frames[2], NOTIFICATION_REQUEST);
        assert!(!mock.is_scanning());
        assert_eq!(mock.state().last_params, Some(ConnectionParams::default()));
        assert!(dog.0.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_settle_delay_gates_identify() {
        let (mut session, mock, clock, _) = setup("PYXIS-1", &NEW_PROFILE);
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Identifying);

        clock.advance_ms(199);
        session.step();
        assert!(mock.written_frames().is_empty());
        assert_eq!(session.state_name(), "Identifying");

        clock.advance_ms(1);
        session.step();
        assert_eq!(mock.written_frames(), vec![IDENTIFY_COMMAND.to_vec()]);
        assert_eq!(session.state_name(), "Battery");
    }

    #[test]
    fn test_battery_response_is_cached() {
        let (mut session, mock, clock, _) = setup("ACAIA-PEARL", &NEW_PROFILE);
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Battery);
        clock.advance_ms(200);
        session.step();
        assert_eq!(mock.written_frames().last().map(Vec::len), Some(BATTERY_REQUEST_LEN));

        assert!(mock.notify(&[0xEF, 0xDD, 0x08, 0x0A, 0x55, 0x02, 0x00]));
        session.step();
        session.step();

        assert_eq!(session.battery_level(), Some(85));
        assert_eq!(session.state_name(), "Notifications");
    }

    #[test]
    fn test_missing_battery_response_continues() {
        let (session, _, _) = connected("LUNAR-X", &OLD_PROFILE);
        assert_eq!(session.battery_level(), None);
        assert_eq!(session.scale_type(), Some(ScaleType::Old));
    }

    #[test]
    fn test_generic_scale_skips_battery_and_heartbeat() {
        let (mut session, mock, clock, _) = setup("FELICITA", &GENERIC_PROFILE);
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Connected);

        assert_eq!(session.scale_type(), Some(ScaleType::Generic));
        assert_eq!(
            mock.written_frames(),
            vec![IDENTIFY_COMMAND.to_vec(), NOTIFICATION_REQUEST.to_vec()]
        );

        mock.clear_written();
        clock.advance_ms(5_000);
        assert!(!session.heartbeat_required());
        assert!(session.heartbeat().is_ok());
        assert!(mock.written_frames().is_empty());

        assert!(session.tare().is_ok());
        assert_eq!(mock.written_frames(), vec![TARE_GENERIC_COMMAND.to_vec()]);
    }

    #[test]
    fn test_begin_rejected_while_handshaking() {
        let (mut session, mock, clock, _) = setup("LUNAR-1", &NEW_PROFILE);
        session.begin(None).unwrap();
        session.step();
        assert_eq!(session.state_name(), "Connecting");
        let entered = session.state_entered;

        clock.advance_ms(10);
        assert!(matches!(
            session.begin(None),
            Err(LinkError::AlreadyActive(ConnectionState::Connecting))
        ));
        assert_eq!(session.state_name(), "Connecting");
        assert_eq!(session.state_entered, entered);
        assert_eq!(mock.state().scan_starts, 1);
    }

    #[test]
    fn test_weight_decode_and_reject() {
        let (mut session, mock, _) = connected("LUNAR-OLD", &OLD_PROFILE);

        mock.notify(&OLD_ONE_GRAM);
        session.step();
        assert_eq!(session.current_weight(), 1.0);
        assert!(session.new_weight_available());
        assert!(session.take_new_sample().is_some());
        assert!(!session.new_weight_available());

        // Wrong length for an old-style frame
        mock.notify(&NEW_FIVE_GRAMS);
        session.step();
        assert_eq!(session.current_weight(), 1.0);
        assert!(session.is_connected());
        assert!(!session.new_weight_available());
        assert_eq!(session.rejected_frames(), 1);
    }

    #[test]
    fn test_packet_interval_tracked() {
        let (mut session, mock, clock) = connected("PYXIS-9", &NEW_PROFILE);
        mock.notify(&NEW_FIVE_GRAMS);
        session.step();
        assert_eq!(session.latest_sample().and_then(|s| s.interval), None);

        clock.advance_ms(100);
        mock.notify(&NEW_FIVE_GRAMS);
        session.step();
        assert_eq!(session.packet_period(), Some(Duration::from_millis(100)));
        assert_eq!(session.current_weight(), 5.0);
    }

    #[test]
    fn test_freshness_timeout_then_reconnect_delay() {
        let (mut session, mock, clock) = connected("LUNAR-1", &NEW_PROFILE);

        clock.advance_ms(8_001);
        assert!(!session.step());
        assert!(!session.is_connected());
        assert_eq!(session.state_name(), "Failed");
        assert_eq!(
            session.last_failure(),
            Some(FailureCause::Timeout(ConnectionState::Connected))
        );

        session.step();
        assert_eq!(session.state_name(), "ReconnectDelay");
        assert!(!mock.is_connected());

        clock.advance_ms(499);
        session.step();
        assert_eq!(session.state_name(), "ReconnectDelay");

        clock.advance_ms(1);
        session.step();
        assert_eq!(session.state_name(), "Scanning");
        assert_eq!(mock.state().scan_starts, 2);
    }

    #[test]
    fn test_fresh_packets_keep_link_alive() {
        let (mut session, mock, clock) = connected("LUNAR-1", &NEW_PROFILE);
        for _ in 0..5 {
            clock.advance_ms(5_000);
            mock.notify(&NEW_FIVE_GRAMS);
            assert!(session.step());
        }
        assert_eq!(session.state_name(), "Connected");
    }

    #[test]
    fn test_async_disconnect_while_connected() {
        let (mut session, mock, _) = connected("LUNAR-1", &NEW_PROFILE);
        mock.drop_link();
        assert!(session.handles.snapshot().is_none());

        assert!(session.tare().is_err());
        session.step();
        assert_eq!(session.state_name(), "Failed");
        assert_eq!(session.last_failure(), Some(FailureCause::AsyncDisconnect));

        session.step();
        assert_eq!(session.state_name(), "ReconnectDelay");
    }

    #[test]
    fn test_disconnect_during_subscribe() {
        let (mut session, mock, clock, _) = setup("LUNAR-1", &NEW_PROFILE);
        mock.state().disconnect_on_subscribe = true;
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Failed);

        assert_eq!(session.last_failure(), Some(FailureCause::AsyncDisconnect));
        assert!(mock.written_frames().is_empty());
        assert!(session.handles.snapshot().is_none());
    }

    #[test]
    fn test_disconnect_during_discovery() {
        let (mut session, mock, clock, _) = setup("LUNAR-1", &OLD_PROFILE);
        mock.state().disconnect_on_discover = true;
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Failed);

        assert_eq!(session.last_failure(), Some(FailureCause::AsyncDisconnect));
        assert_eq!(session.scale_type(), None);
    }

    #[test]
    fn test_unknown_services_are_protocol_mismatch() {
        let (mut session, mock, clock, _) = setup("PROCH-1", &NEW_PROFILE);
        {
            let mut state = mock.state();
            let mut bogus = service_for(&NEW_PROFILE);
            bogus.uuid = OLD_PROFILE.read_char;
            state.services = vec![bogus];
        }
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Failed);

        assert_eq!(session.last_failure(), Some(FailureCause::ProtocolMismatch));
        assert!(!mock.is_connected());
    }

    #[test]
    fn test_scan_timeout_fails_and_stops_scan() {
        let mock = MockTransport::new();
        let clock = ManualClock::starting_at(Instant::from_millis(0));
        let mut session = ScaleSession::with_parts(
            mock.clone(),
            LinkConfig::default(),
            clock.clone(),
            NoopWatchdog,
        );
        session.begin(None).unwrap();

        clock.advance_ms(10_000);
        session.step();
        assert_eq!(session.state_name(), "Scanning");

        clock.advance_ms(1);
        session.step();
        assert_eq!(session.state_name(), "Failed");
        assert_eq!(
            session.last_failure(),
            Some(FailureCause::Timeout(ConnectionState::Scanning))
        );

        session.step();
        assert_eq!(session.state_name(), "ReconnectDelay");
        assert!(!mock.is_scanning());
    }

    #[test]
    fn test_connect_failure_funnels_into_failed() {
        let (mut session, mock, _, _) = setup("ACAIA-1", &NEW_PROFILE);
        mock.state().connect_fails = true;
        session.begin(None).unwrap();
        session.step();
        session.step();
        assert_eq!(session.state_name(), "Failed");
        assert_eq!(session.last_failure(), Some(FailureCause::TransportFailure));
    }

    #[test]
    fn test_begin_accepted_again_from_failed() {
        let (mut session, mock, _, _) = setup("ACAIA-1", &NEW_PROFILE);
        mock.state().connect_fails = true;
        session.begin(None).unwrap();
        session.step();
        session.step();
        assert_eq!(session.state_name(), "Failed");

        mock.state().connect_fails = false;
        assert!(session.begin(None).is_ok());
        assert_eq!(session.state_name(), "Scanning");
    }

    #[test]
    fn test_write_failure_marks_disconnected_until_next_step() {
        let (mut session, mock, _) = connected("LUNAR-1", &NEW_PROFILE);
        mock.state().write_fails = true;

        assert!(matches!(session.start_timer(), Err(LinkError::Transport(_))));
        assert!(!session.is_connected());
        assert_eq!(session.state_name(), "Connected");

        session.step();
        assert_eq!(session.state_name(), "Failed");
        assert_eq!(session.last_failure(), Some(FailureCause::TransportFailure));
    }

    #[test]
    fn test_commands_require_connection() {
        let (mut session, mock, _, _) = setup("LUNAR-1", &NEW_PROFILE);
        assert!(matches!(session.tare(), Err(LinkError::NotConnected)));
        assert!(matches!(session.heartbeat(), Err(LinkError::NotConnected)));
        assert!(matches!(session.reset_timer(), Err(LinkError::NotConnected)));
        assert!(mock.written_frames().is_empty());
    }

    #[test]
    fn test_timer_commands_written() {
        let (mut session, mock, _) = connected("LUNAR-1", &NEW_PROFILE);
        session.start_timer().unwrap();
        session.stop_timer().unwrap();
        session.reset_timer().unwrap();
        session.tare().unwrap();
        assert_eq!(
            mock.written_frames(),
            vec![
                START_TIMER_COMMAND.to_vec(),
                STOP_TIMER_COMMAND.to_vec(),
                RESET_TIMER_COMMAND.to_vec(),
                tare_command(ScaleType::New).to_vec(),
            ]
        );
    }

    #[test]
    fn test_heartbeat_due_and_sent() {
        let (mut session, mock, clock) = connected("LUNAR-1", &NEW_PROFILE);
        assert!(!session.heartbeat_required());

        clock.advance_ms(2_751);
        assert!(session.heartbeat_required());
        session.heartbeat().unwrap();
        assert_eq!(mock.written_frames(), vec![HEARTBEAT_COMMAND.to_vec()]);
        assert!(!session.heartbeat_required());
    }

    #[test]
    fn test_target_address_filter() {
        let (mut session, mock, clock, _) = setup("LUNAR-1", &NEW_PROFILE);
        let elsewhere = BleAddress::new([9, 9, 9, 9, 9, 9]);
        session.begin(Some(elsewhere)).unwrap();

        for _ in 0..10 {
            session.step();
            clock.advance_ms(10);
        }
        assert_eq!(session.state_name(), "Scanning");
        assert_eq!(mock.state().connects, 0);

        mock.advertise(DiscoveredDevice {
            name: Some("LUNAR-2".to_string()),
            address: elsewhere,
            rssi: -70,
        });
        session.step();
        assert_eq!(session.state_name(), "Connecting");
    }

    #[test]
    fn test_stale_disconnect_ignored_while_scanning() {
        let mock = MockTransport::new();
        let clock = ManualClock::new();
        let mut session = ScaleSession::with_parts(mock.clone(), LinkConfig::default(), clock.clone(), NoopWatchdog);
        session.begin(None).unwrap();

        mock.drop_link();
        session.step();
        assert_eq!(session.state_name(), "Scanning");
    }

    const BATTERY_85: [u8; 7] = [0xEF, 0xDD, 0x08, 0x0A, 0x55, 0x02, 0x00];
    const BATTERY_40: [u8; 7] = [0xEF, 0xDD, 0x08, 0x0A, 0x28, 0x02, 0x00];

    #[test]
    fn test_battery_requeried_after_reconnect() {
        let (mut session, mock, clock, _) = setup("LUNAR-1", &NEW_PROFILE);
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Battery);
        clock.advance_ms(200);
        session.step();
        mock.notify(&BATTERY_85);
        run_until(&mut session, &clock, ConnectionState::Connected);
        assert_eq!(session.battery_level(), Some(85));

        mock.drop_link();
        run_until(&mut session, &clock, ConnectionState::Battery);
        assert_eq!(session.battery_level(), None);
        mock.clear_written();

        clock.advance_ms(200);
        session.step();
        assert_eq!(mock.written_frames().last().map(Vec::len), Some(BATTERY_REQUEST_LEN));

        // No answer yet, so the stage keeps waiting
        clock.advance_ms(10);
        session.step();
        assert_eq!(session.state_name(), "Battery");

        mock.notify(&BATTERY_40);
        session.step();
        assert_eq!(session.battery_level(), Some(40));
        assert_eq!(session.state_name(), "Notifications");
    }

    #[test]
    fn test_reconnect_delay_counts_as_connecting() {
        let (mut session, mock, clock) = connected("LUNAR-1", &NEW_PROFILE);
        assert!(!session.is_connecting());

        mock.drop_link();
        run_until(&mut session, &clock, ConnectionState::ReconnectDelay);
        assert!(session.is_connecting());
        assert!(!session.is_connected());

        run_until(&mut session, &clock, ConnectionState::Scanning);
        assert!(session.is_connecting());
    }

    #[test]
    fn test_subscribe_failure_funnels_into_failed() {
        let (mut session, mock, clock, _) = setup("LUNAR-1", &NEW_PROFILE);
        mock.state().subscribe_fails = true;
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Failed);

        assert_eq!(session.last_failure(), Some(FailureCause::TransportFailure));
        assert!(mock.written_frames().is_empty());
        assert_eq!(mock.state().subscribed, None);
    }

    #[test]
    fn test_identify_write_failure_funnels_into_failed() {
        let (mut session, mock, clock, _) = setup("PYXIS-1", &NEW_PROFILE);
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Identifying);
        mock.state().write_fails = true;

        clock.advance_ms(200);
        session.step();
        assert_eq!(session.state_name(), "Failed");
        assert_eq!(session.last_failure(), Some(FailureCause::TransportFailure));
        assert!(!session.is_connected());
    }

    #[test]
    fn test_notification_request_write_failure_funnels_into_failed() {
        let (mut session, mock, clock, _) = setup("FELICITA", &GENERIC_PROFILE);
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Notifications);
        mock.state().write_fails = true;

        clock.advance_ms(200);
        session.step();
        assert_eq!(session.state_name(), "Failed");
        assert_eq!(session.last_failure(), Some(FailureCause::TransportFailure));
        assert!(!session.is_connected());
    }

    #[test]
    fn test_link_lost_during_settle_delay() {
        for stage in [
            ConnectionState::Identifying,
            ConnectionState::Battery,
            ConnectionState::Notifications,
        ] {
            let (mut session, mock, clock, _) = setup("LUNAR-1", &NEW_PROFILE);
            session.begin(None).unwrap();
            run_until(&mut session, &clock, stage);
            mock.clear_written();

            // Radio reports the link gone before its disconnect event is queued
            mock.state().connected = false;
            clock.advance_ms(200);
            session.step();

            assert_eq!(session.state_name(), "Failed", "stage {}", stage);
            assert_eq!(session.last_failure(), Some(FailureCause::AsyncDisconnect));
            assert!(mock.written_frames().is_empty());
        }
    }

    #[test]
    fn test_begin_rejected_in_every_busy_state() {
        let (mut session, _, clock, _) = setup("LUNAR-1", &NEW_PROFILE);
        session.begin(None).unwrap();
        let entered = session.state_entered;
        assert!(matches!(
            session.begin(None),
            Err(LinkError::AlreadyActive(ConnectionState::Scanning))
        ));
        assert_eq!(session.state_entered, entered);

        run_until(&mut session, &clock, ConnectionState::Battery);
        let entered = session.state_entered;
        clock.advance_ms(10);
        assert!(matches!(
            session.begin(None),
            Err(LinkError::AlreadyActive(ConnectionState::Battery))
        ));
        assert_eq!(session.state_name(), "Battery");
        assert_eq!(session.state_entered, entered);

        let (mut session, mock, clock) = connected("LUNAR-1", &NEW_PROFILE);
        mock.drop_link();
        run_until(&mut session, &clock, ConnectionState::ReconnectDelay);
        let entered = session.state_entered;
        let scans = mock.state().scan_starts;
        clock.advance_ms(10);
        assert!(matches!(
            session.begin(None),
            Err(LinkError::AlreadyActive(ConnectionState::ReconnectDelay))
        ));
        assert_eq!(session.state_name(), "ReconnectDelay");
        assert_eq!(session.state_entered, entered);
        assert_eq!(mock.state().scan_starts, scans);
    }

    #[test]
    fn test_handshake_frames_are_not_new_samples() {
        let (mut session, mock, clock, _) = setup("LUNAR-1", &NEW_PROFILE);
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Notifications);

        mock.notify(&NEW_FIVE_GRAMS);
        session.step();
        assert_eq!(session.current_weight(), 5.0);
        assert!(session.take_new_sample().is_none());

        run_until(&mut session, &clock, ConnectionState::Connected);
        assert!(!session.new_weight_available());
        assert!(session.take_new_sample().is_none());
    }

    #[test]
    fn test_samples_cleared_between_attempts() {
        let (mut session, mock, clock) = connected("LUNAR-1", &NEW_PROFILE);
        mock.notify(&NEW_FIVE_GRAMS);
        session.step();
        assert!(session.new_weight_available());

        mock.drop_link();
        run_until(&mut session, &clock, ConnectionState::Scanning);
        assert_eq!(session.current_weight(), 0.0);
        assert_eq!(session.latest_sample(), None);
        assert!(session.take_new_sample().is_none());
    }

    #[test]
    fn test_write_characteristic_must_be_writable() {
        let (mut session, mock, clock, _) = setup("LUNAR-1", &NEW_PROFILE);
        {
            let mut state = mock.state();
            let mut service = service_for(&NEW_PROFILE);
            service.characteristics[1].can_write = false;
            state.services = vec![service];
        }
        session.begin(None).unwrap();
        run_until(&mut session, &clock, ConnectionState::Failed);

        assert_eq!(session.last_failure(), Some(FailureCause::ProtocolMismatch));
    }
}
