use anyhow::Context;
use embassy_executor::Spawner;
use gravimetric_scale::ble::BleAddress;
use gravimetric_scale::scales::traits::StatusChannel;
use gravimetric_scale::system::config::LinkConfig;
use log::{error, info, warn};
use std::sync::Arc;

/// Missing or empty JSON keeps the defaults.
fn load_config(json: Option<&str>) -> anyhow::Result<LinkConfig> {
    match json.map(str::trim).filter(|j| !j.is_empty()) {
        Some(json) => LinkConfig::from_json(json),
        None => Ok(LinkConfig::default()),
    }
}

fn parse_target(text: Option<&str>) -> anyhow::Result<Option<BleAddress>> {
    text.map(|t| BleAddress::parse(t).with_context(|| format!("invalid scale address '{}'", t)))
        .transpose()
}

#[embassy_executor::task]
async fn status_task(status_channel: Arc<StatusChannel>) {
    loop {
        let status = status_channel.receive().await;
        if status.connected {
            info!(
                "⚖️ Scale connected ({})",
                status.scale_type.map_or("?", |t| t.as_str())
            );
        } else {
            warn!("📴 Scale disconnected (state: {})", status.state);
        }
    }
}

#[cfg(target_os = "espidf")]
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("Starting scale link firmware");

    if let Err(e) = firmware::run(spawner).await {
        error!("Scale link stopped: {:?}", e);
    }
}

#[cfg(target_os = "espidf")]
mod firmware {
    use super::*;
    use gravimetric_scale::ble_bindings::EspBleTransport;
    use gravimetric_scale::controller::ScaleLinkController;
    use gravimetric_scale::scales::acaia::ScaleSession;
    use gravimetric_scale::system::clock::SystemClock;
    use gravimetric_scale::system::watchdog::TaskWatchdog;

    pub async fn run(spawner: Spawner) -> anyhow::Result<()> {
        let config = load_config(option_env!("SCALE_LINK_CONFIG"))?;
        let target = parse_target(option_env!("SCALE_ADDRESS"))?;

        let watchdog = TaskWatchdog::subscribe_current_task()
            .context("failed to subscribe to the task watchdog")?;
        let transport = EspBleTransport::with_watchdog(watchdog)?;
        let session = ScaleSession::with_parts(transport, config, SystemClock, watchdog);
        let mut controller = ScaleLinkController::new(session, target);

        if spawner.spawn(status_task(controller.status_channel())).is_err() {
            warn!("Failed to spawn status task - continuing without status log");
        }

        controller.run().await
    }
}

/// Host build: runs the link against the in-memory transport with a simulated
/// scale pouring a shot, so the state machine can be watched end to end.
#[cfg(not(target_os = "espidf"))]
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting scale link simulation");

    if let Err(e) = simulation::run(spawner).await {
        error!("Simulation stopped: {:?}", e);
    }
}

#[cfg(not(target_os = "espidf"))]
mod simulation {
    use super::*;
    use embassy_time::{Duration, Timer};
    use gravimetric_scale::ble::NEW_PROFILE;
    use gravimetric_scale::ble_mock::MockTransport;
    use gravimetric_scale::controller::ScaleLinkController;
    use gravimetric_scale::protocol::{HEADER1, HEADER2, MSG_EVENT_CONFIG};
    use gravimetric_scale::scales::acaia::ScaleSession;

    const SIM_ADDRESS: [u8; 6] = [0x3C, 0x71, 0xBF, 0x10, 0x20, 0x30];

    pub async fn run(spawner: Spawner) -> anyhow::Result<()> {
        let config = load_config(std::env::var("SCALE_LINK_CONFIG").ok().as_deref())?;
        let target = parse_target(std::env::var("SCALE_ADDRESS").ok().as_deref())?;

        let scale = MockTransport::with_scale("LUNAR-SIM", BleAddress::new(SIM_ADDRESS), &NEW_PROFILE);
        let session = ScaleSession::new(scale.clone(), config);
        let mut controller = ScaleLinkController::new(session, target);

        if spawner.spawn(status_task(controller.status_channel())).is_err() {
            warn!("Failed to spawn status task");
        }
        if spawner.spawn(simulated_scale(scale)).is_err() {
            anyhow::bail!("failed to spawn simulated scale");
        }

        controller.run().await
    }

    /// New-style weight frame, two decimals.
    fn weight_frame(weight_g: f32) -> [u8; 13] {
        let hundredths = (weight_g.abs() * 100.0).round() as u32;
        let sign = if weight_g < 0.0 { 0x02 } else { 0x00 };
        [
            HEADER1,
            HEADER2,
            MSG_EVENT_CONFIG,
            0x0C,
            0x05,
            (hundredths & 0xFF) as u8,
            ((hundredths >> 8) & 0xFF) as u8,
            0x00,
            0x00,
            0x02,
            sign,
            0x00,
            0x00,
        ]
    }

    #[embassy_executor::task]
    async fn simulated_scale(scale: MockTransport) {
        let mut weight_g = 0.0f32;
        loop {
            Timer::after(Duration::from_millis(100)).await;
            if !scale.state().connected {
                weight_g = 0.0;
                continue;
            }
            weight_g = (weight_g + 0.2).min(36.0);
            scale.notify(&weight_frame(weight_g));
        }
    }
}
