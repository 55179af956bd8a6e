use crate::ble::{
    BleAddress, BleError, Characteristic, CharacteristicHandle, ConnectionParams,
    DiscoveredDevice, NotificationPayload, ScaleProfile, ScaleTransport, Service,
    TransportContext, TransportEvent,
};
use std::sync::{Arc, Mutex, MutexGuard};

pub const MOCK_READ_HANDLE: CharacteristicHandle = CharacteristicHandle(0x000E);
pub const MOCK_WRITE_HANDLE: CharacteristicHandle = CharacteristicHandle(0x0011);

#[derive(Default)]
pub struct MockState {
    pub devices: Vec<DiscoveredDevice>,
    pub services: Vec<Service>,
    pub scanning: bool,
    pub connected: bool,
    pub connect_fails: bool,
    pub subscribe_fails: bool,
    pub write_fails: bool,
    /// Drop the link from inside the next `subscribe()` call.
    pub disconnect_on_subscribe: bool,
    /// Drop the link from inside the next `discover_services()` call.
    pub disconnect_on_discover: bool,
    pub scan_starts: u32,
    pub connects: u32,
    pub disconnects: u32,
    pub subscribed: Option<CharacteristicHandle>,
    pub last_params: Option<ConnectionParams>,
    pub written: Vec<(CharacteristicHandle, Vec<u8>)>,
    context: Option<TransportContext>,
}

/// In-memory transport. Clones share state, so a test keeps one handle while
/// the session owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that advertises one scale exposing `profile`.
    pub fn with_scale(name: &str, address: BleAddress, profile: &ScaleProfile) -> Self {
        let mock = Self::new();
        {
            let mut state = mock.state();
            state.devices.push(DiscoveredDevice {
                name: Some(name.to_string()),
                address,
                rssi: -58,
            });
            state.services.push(service_for(profile));
        }
        mock
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Delivers an advertisement as the radio would, outside the stepping context.
    pub fn advertise(&self, device: DiscoveredDevice) -> bool {
        let context = self.state().context.clone();
        context.is_some_and(|ctx| ctx.post(TransportEvent::DeviceFound(device)))
    }

    pub fn notify(&self, data: &[u8]) -> bool {
        let Ok(payload) = NotificationPayload::from_slice(data) else {
            return false;
        };
        let context = self.state().context.clone();
        context.is_some_and(|ctx| ctx.post(TransportEvent::Notification(payload)))
    }

    /// Remote side drops the link.
    pub fn drop_link(&self) {
        let context = {
            let mut state = self.state();
            state.connected = false;
            state.subscribed = None;
            state.context.clone()
        };
        if let Some(ctx) = context {
            ctx.link_lost();
        }
    }

    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.state().written.iter().map(|(_, data)| data.clone()).collect()
    }

    pub fn clear_written(&self) {
        self.state().written.clear();
    }
}

pub fn service_for(profile: &ScaleProfile) -> Service {
    let mut characteristics = vec![Characteristic {
        uuid: profile.read_char,
        handle: MOCK_READ_HANDLE,
        can_notify: true,
        can_write: profile.read_char == profile.write_char,
    }];
    if profile.read_char != profile.write_char {
        characteristics.push(Characteristic {
            uuid: profile.write_char,
            handle: MOCK_WRITE_HANDLE,
            can_notify: false,
            can_write: true,
        });
    }
    Service {
        uuid: profile.service,
        characteristics,
    }
}

impl ScaleTransport for MockTransport {
    fn register_callbacks(&mut self, context: TransportContext) {
        self.state().context = Some(context);
    }

    fn scan_start(&mut self) -> Result<(), BleError> {
        let (devices, context) = {
            let mut state = self.state();
            state.scanning = true;
            state.scan_starts += 1;
            (state.devices.clone(), state.context.clone())
        };
        if let Some(ctx) = context {
            for device in devices {
                ctx.post(TransportEvent::DeviceFound(device));
            }
        }
        Ok(())
    }

    fn scan_stop(&mut self) {
        self.state().scanning = false;
    }

    fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    fn connect(&mut self, address: &BleAddress, params: &ConnectionParams) -> Result<(), BleError> {
        let mut state = self.state();
        state.connects += 1;
        state.last_params = Some(*params);
        if state.connect_fails || !state.devices.iter().any(|d| d.address.same_device(address)) {
            return Err(BleError::ConnectionFailed(format!("no answer from {}", address)));
        }
        state.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.state();
        if state.connected {
            state.disconnects += 1;
        }
        state.connected = false;
        state.subscribed = None;
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn discover_services(&mut self) -> Result<Vec<Service>, BleError> {
        let drop_now = {
            let mut state = self.state();
            if !state.connected {
                return Err(BleError::NotConnected);
            }
            std::mem::take(&mut state.disconnect_on_discover)
        };
        let services = self.state().services.clone();
        if drop_now {
            self.drop_link();
        }
        Ok(services)
    }

    fn subscribe(&mut self, characteristic: CharacteristicHandle) -> Result<(), BleError> {
        let drop_now = {
            let mut state = self.state();
            if !state.connected {
                return Err(BleError::NotConnected);
            }
            if state.subscribe_fails {
                return Err(BleError::SubscribeFailed("CCCD write rejected".to_string()));
            }
            state.subscribed = Some(characteristic);
            std::mem::take(&mut state.disconnect_on_subscribe)
        };
        if drop_now {
            self.drop_link();
        }
        Ok(())
    }

    fn write_value(&mut self, characteristic: CharacteristicHandle, data: &[u8]) -> Result<(), BleError> {
        let mut state = self.state();
        if !state.connected {
            return Err(BleError::NotConnected);
        }
        if state.write_fails {
            return Err(BleError::WriteFailed("ATT error".to_string()));
        }
        state.written.push((characteristic, data.to_vec()));
        Ok(())
    }
}
