//! Transport capability consumed by the scale session.
//!
//! A transport performs the radio operations synchronously from the stepping
//! context and reports everything asynchronous (advertisements, disconnects,
//! notifications) through a bounded [`TransportEventChannel`] that only the
//! session drains. The disconnect callback additionally gets a
//! [`DisconnectToken`] so it can invalidate the cached handles immediately,
//! without waiting for the next drain.

use crate::types::ScaleType;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const MAX_NOTIFICATION_LEN: usize = 64;
pub const TRANSPORT_EVENT_DEPTH: usize = 16;

pub type NotificationPayload = heapless::Vec<u8, MAX_NOTIFICATION_LEN>;
pub type TransportEventChannel = Channel<CriticalSectionRawMutex, TransportEvent, TRANSPORT_EVENT_DEPTH>;

#[derive(Debug)]
pub enum BleError {
    NotConnected,
    ScanFailed(String),
    ConnectionFailed(String),
    DiscoveryFailed(String),
    SubscribeFailed(String),
    WriteFailed(String),
    InitializationFailed(String),
}

impl std::fmt::Display for BleError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BleError::NotConnected => write!(f, "Not connected"),
            BleError::ScanFailed(msg) => write!(f, "Scan failed: {}", msg),
            BleError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            BleError::DiscoveryFailed(msg) => write!(f, "Discovery failed: {}", msg),
            BleError::SubscribeFailed(msg) => write!(f, "Subscribe failed: {}", msg),
            BleError::WriteFailed(msg) => write!(f, "Write failed: {}", msg),
            BleError::InitializationFailed(msg) => write!(f, "BLE init failed: {}", msg),
        }
    }
}

impl std::error::Error for BleError {}

// BLE device address structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BleAddress {
    pub addr: [u8; 6],
    pub addr_type: u8,
}

impl BleAddress {
    pub fn new(addr: [u8; 6]) -> Self {
        Self { addr, addr_type: 0 }
    }

    /// Parses `aa:bb:cc:dd:ee:ff` (most significant byte first, as printed).
    pub fn parse(text: &str) -> Option<Self> {
        let mut addr = [0u8; 6];
        let mut parts = text.trim().split(':');
        // NimBLE stores the address little-endian
        for slot in addr.iter_mut().rev() {
            *slot = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(addr))
    }

    /// Compares the six address bytes, ignoring the address type.
    pub fn same_device(&self, other: &BleAddress) -> bool {
        self.addr == other.addr
    }
}

impl std::fmt::Display for BleAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let a = &self.addr;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[5], a[4], a[3], a[2], a[1], a[0]
        )
    }
}

// Found device information
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub name: Option<String>,
    pub address: BleAddress,
    pub rssi: i8,
}

/// Everything the transport reports from outside the stepping context.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    DeviceFound(DiscoveredDevice),
    Disconnected,
    Notification(NotificationPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicHandle(pub u16);

#[derive(Debug, Clone)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub handle: CharacteristicHandle,
    pub can_notify: bool,
    pub can_write: bool,
}

#[derive(Debug, Clone)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Link parameters requested at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParams {
    /// In 1.25 ms units
    pub min_interval: u16,
    pub max_interval: u16,
    pub latency: u16,
    /// In 10 ms units
    pub supervision_timeout: u16,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            min_interval: 12,
            max_interval: 12,
            latency: 0,
            supervision_timeout: 150,
        }
    }
}

/// Service and characteristic identifiers for one scale family.
#[derive(Debug, Clone, Copy)]
pub struct ScaleProfile {
    pub scale_type: ScaleType,
    pub service: Uuid,
    pub read_char: Uuid,
    pub write_char: Uuid,
}

/// Expands a SIG-assigned 16-bit id onto the Bluetooth base UUID.
pub const fn ble_uuid16(short: u16) -> Uuid {
    ble_uuid32(short as u32)
}

pub const fn ble_uuid32(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805F9B34FB)
}

pub const OLD_PROFILE: ScaleProfile = ScaleProfile {
    scale_type: ScaleType::Old,
    service: ble_uuid16(0x1820),
    read_char: ble_uuid16(0x2A80),
    write_char: ble_uuid16(0x2A80),
};

pub const NEW_PROFILE: ScaleProfile = ScaleProfile {
    scale_type: ScaleType::New,
    service: Uuid::from_u128(0x49535343_FE7D_4AE5_8FA9_9FAFD205E455),
    read_char: Uuid::from_u128(0x49535343_1E4D_4BD9_BA61_23C647249616),
    write_char: Uuid::from_u128(0x49535343_8841_43F4_A8D4_ECBE34729BB3),
};

pub const GENERIC_PROFILE: ScaleProfile = ScaleProfile {
    scale_type: ScaleType::Generic,
    service: ble_uuid16(0xFFE0),
    read_char: ble_uuid16(0xFFE1),
    write_char: ble_uuid16(0xFFE1),
};

/// Probe order used while identifying the scale family.
pub const SCALE_PROFILES: [ScaleProfile; 3] = [OLD_PROFILE, NEW_PROFILE, GENERIC_PROFILE];

/// Whether `uuid` is the primary service of a supported scale family.
pub fn is_scale_service(uuid: &Uuid) -> bool {
    SCALE_PROFILES.iter().any(|profile| profile.service == *uuid)
}

/// References needed to talk to the connected scale. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSet {
    pub device: BleAddress,
    pub service: Uuid,
    pub read_char: CharacteristicHandle,
    pub write_char: CharacteristicHandle,
}

/// Slot holding the current handle set. Writers replace the whole set, readers
/// take an `Arc` snapshot and never see a half-cleared value.
#[derive(Debug, Clone, Default)]
pub struct SharedHandles {
    slot: Arc<Mutex<Option<Arc<HandleSet>>>>,
}

impl SharedHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<Arc<HandleSet>> {
        match self.slot.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn publish(&self, handles: HandleSet) {
        self.replace(Some(Arc::new(handles)));
    }

    pub fn clear(&self) {
        self.replace(None);
    }

    pub fn disconnect_token(&self) -> DisconnectToken {
        DisconnectToken {
            slot: self.clone(),
        }
    }

    fn replace(&self, value: Option<Arc<HandleSet>>) {
        match self.slot.lock() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

/// Given to the transport's disconnect callback; it can only empty the slot.
#[derive(Debug, Clone)]
pub struct DisconnectToken {
    slot: SharedHandles,
}

impl DisconnectToken {
    pub fn invalidate(&self) {
        self.slot.clear();
    }
}

/// Handed to the transport when the session registers its callbacks, so every
/// callback invocation can reach its owning session without a global.
#[derive(Clone)]
pub struct TransportContext {
    pub events: Arc<TransportEventChannel>,
    pub disconnect: DisconnectToken,
}

impl TransportContext {
    /// Queues an event; returns false if the queue is full and the event was dropped.
    pub fn post(&self, event: TransportEvent) -> bool {
        self.events.try_send(event).is_ok()
    }

    /// Disconnect path: empty the handle slot first, then queue the event.
    pub fn link_lost(&self) {
        self.disconnect.invalidate();
        self.post(TransportEvent::Disconnected);
    }
}

/// Radio operations the session needs. Calls are made from the stepping
/// context only; each must return within a short bounded time.
pub trait ScaleTransport {
    /// Registers the context every asynchronous callback reports through.
    fn register_callbacks(&mut self, context: TransportContext);

    /// Starts an open-ended scan; results arrive as [`TransportEvent::DeviceFound`].
    fn scan_start(&mut self) -> Result<(), BleError>;
    fn scan_stop(&mut self);
    fn is_scanning(&self) -> bool;

    fn connect(&mut self, address: &BleAddress, params: &ConnectionParams) -> Result<(), BleError>;
    fn disconnect(&mut self);
    /// Live link status as the radio stack sees it right now.
    fn is_connected(&self) -> bool;

    fn discover_services(&mut self) -> Result<Vec<Service>, BleError>;
    /// Enables notifications; payloads arrive as [`TransportEvent::Notification`].
    fn subscribe(&mut self, characteristic: CharacteristicHandle) -> Result<(), BleError>;
    fn write_value(&mut self, characteristic: CharacteristicHandle, data: &[u8]) -> Result<(), BleError>;
}
