use crate::{
    ble::{BleAddress, ScaleTransport},
    scales::{
        acaia::{LinkError, ScaleSession},
        traits::{ScaleCommand, ScaleCommandChannel, ScaleDataChannel, StatusChannel},
    },
    state::{LinkStatus, StateManager},
    system::{clock::Clock, watchdog::Watchdog},
    types::{ConnectionState, WeightSample, STEP_INTERVAL_MS},
};
use embassy_futures::select::{select, Either};
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};
use log::{debug, info, warn};
use std::sync::Arc;

/// What one tick produced for the rest of the firmware.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub status: Option<LinkStatus>,
    pub sample: Option<WeightSample>,
}

/// Drives a `ScaleSession` on a fixed cadence and bridges it to the app's channels.
pub struct ScaleLinkController<T, C, W> {
    session: ScaleSession<T, C, W>,
    target: Option<BleAddress>,
    state_manager: StateManager,

    scale_data_channel: Arc<ScaleDataChannel>,
    status_channel: Arc<StatusChannel>,
    scale_command_channel: Arc<ScaleCommandChannel>,

    last_status: Option<LinkStatus>,
}

impl<T: ScaleTransport, C: Clock, W: Watchdog> ScaleLinkController<T, C, W> {
    pub fn new(session: ScaleSession<T, C, W>, target: Option<BleAddress>) -> Self {
        Self {
            session,
            target,
            state_manager: StateManager::new(),
            scale_data_channel: Arc::new(Channel::new()),
            status_channel: Arc::new(Channel::new()),
            scale_command_channel: Arc::new(Channel::new()),
            last_status: None,
        }
    }

    pub fn scale_data_channel(&self) -> Arc<ScaleDataChannel> {
        Arc::clone(&self.scale_data_channel)
    }

    pub fn status_channel(&self) -> Arc<StatusChannel> {
        Arc::clone(&self.status_channel)
    }

    pub fn scale_command_channel(&self) -> Arc<ScaleCommandChannel> {
        Arc::clone(&self.scale_command_channel)
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state_manager
    }

    pub fn session(&self) -> &ScaleSession<T, C, W> {
        &self.session
    }

    pub async fn run(&mut self) -> ! {
        info!("Starting scale link loop ({}ms step)", STEP_INTERVAL_MS);

        loop {
            let outcome = self.tick();
            if let Some(status) = outcome.status {
                self.state_manager.update_status(status).await;
            }
            if let Some(sample) = outcome.sample {
                self.state_manager.update_sample(sample).await;
            }

            let command_fut = self.scale_command_channel.receive();
            let step_timer = Timer::after(Duration::from_millis(STEP_INTERVAL_MS));
            match select(command_fut, step_timer).await {
                Either::First(command) => self.handle_command(command),
                Either::Second(_) => {}
            }
        }
    }

    /// One cooperative slice: advance the session, keep the scale alive, serve
    /// queued commands and publish whatever changed.
    pub fn tick(&mut self) -> TickOutcome {
        if self.session.connection_state() == ConnectionState::Idle {
            if let Err(e) = self.session.begin(self.target) {
                warn!("Unable to start scale connection: {}", e);
            }
        }

        self.session.step();

        if self.session.heartbeat_required() {
            if let Err(e) = self.session.heartbeat() {
                warn!("Heartbeat failed: {}", e);
            }
        }

        while let Ok(command) = self.scale_command_channel.try_receive() {
            self.handle_command(command);
        }

        let sample = self.session.take_new_sample();
        if let Some(sample) = sample {
            if self.scale_data_channel.try_send(sample).is_err() {
                debug!("Scale data channel full, dropping sample");
            }
        }

        TickOutcome {
            status: self.publish_status(),
            sample,
        }
    }

    fn handle_command(&mut self, command: ScaleCommand) {
        let result = match command {
            ScaleCommand::Tare => self.session.tare(),
            ScaleCommand::StartTimer => self.session.start_timer(),
            ScaleCommand::StopTimer => self.session.stop_timer(),
            ScaleCommand::ResetTimer => self.session.reset_timer(),
            ScaleCommand::SetBrewing(brewing) => {
                self.session.set_is_brewing(brewing);
                Ok(())
            }
        };
        match result {
            Ok(()) => debug!("Scale command '{}' sent", command.name()),
            Err(LinkError::NotConnected) => {
                warn!("Scale command '{}' dropped: not connected", command.name())
            }
            Err(e) => warn!("Scale command '{}' failed: {}", command.name(), e),
        }
    }

    /// Returns the new status when the link picture changed since the last tick.
    fn publish_status(&mut self) -> Option<LinkStatus> {
        let status = self.snapshot();
        let connected_edge = self
            .last_status
            .as_ref()
            .map_or(true, |last| last.connected != status.connected);
        let changed = self
            .last_status
            .as_ref()
            .map_or(true, |last| !last.same_link(&status));

        if connected_edge && self.status_channel.try_send(status.clone()).is_err() {
            warn!("Status channel full, connection edge not delivered");
        }
        self.last_status = Some(status.clone());
        changed.then_some(status)
    }

    fn snapshot(&self) -> LinkStatus {
        LinkStatus {
            state: self.session.connection_state(),
            connected: self.session.is_connected(),
            scale_type: self.session.scale_type(),
            weight_g: self.session.current_weight(),
            battery_percent: self.session.battery_level(),
            packet_period_ms: self.session.packet_period().map(|p| p.as_millis()),
            last_failure: self.session.last_failure().map(|cause| cause.to_string()),
        }
    }
}
