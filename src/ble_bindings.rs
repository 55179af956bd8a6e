// NimBLE host bindings for the scale transport
// Raw esp-idf-sys GAP/GATT calls behind the `ScaleTransport` trait. Every NimBLE
// callback receives a pointer to the transport's `Shared` block as its `arg`.

use crate::ble::{
    is_scale_service, BleAddress, BleError, Characteristic, CharacteristicHandle, ConnectionParams,
    DiscoveredDevice, NotificationPayload, ScaleTransport, Service, TransportContext,
    TransportEvent,
};
use crate::scales::discovery::{is_scale_name, parse_device_name};
use crate::system::watchdog::{NoopWatchdog, Watchdog};
use embassy_time::{Duration, Instant};
use log::{debug, error, info, warn};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use esp_idf_svc::sys as esp_idf_sys;

const BLE_HS_EDONE: u16 = 14;
const BLE_HS_FOREVER: i32 = i32::MAX;
const BLE_ERR_REM_USER_CONN_TERM: u8 = 0x13;
const NO_STATUS: i32 = -1;

const SYNC_WAIT: Duration = Duration::from_millis(3_000);
const CONNECT_WAIT: Duration = Duration::from_millis(5_000);
/// Shared by every GATT procedure of one `discover_services()` call.
const DISCOVERY_WAIT: Duration = Duration::from_millis(3_000);
const WRITE_WAIT: Duration = Duration::from_millis(1_000);
const DISCONNECT_WAIT: Duration = Duration::from_millis(1_000);
const POLL_INTERVAL_MS: u64 = 5;

// on_sync has no user argument, so host readiness is the one process-wide flag
static HOST_SYNCED: AtomicBool = AtomicBool::new(false);

#[derive(Default)]
struct DiscoveryScratch {
    services: Vec<(Uuid, u16, u16)>,
    characteristics: Vec<Characteristic>,
}

/// State written from NimBLE callbacks. Leaked once per transport so the raw
/// pointer handed to the stack never dangles.
struct Shared {
    context: Mutex<Option<TransportContext>>,
    conn_handle: Mutex<Option<u16>>,
    scratch: Mutex<DiscoveryScratch>,
    scanning: AtomicBool,
    connected: AtomicBool,
    connect_status: AtomicI32,
    gatt_status: AtomicI32,
}

impl Shared {
    fn as_arg(&'static self) -> *mut c_void {
        self as *const Shared as *mut c_void
    }

    /// # Safety
    /// `arg` must be a pointer produced by `as_arg`.
    unsafe fn from_arg(arg: *mut c_void) -> Option<&'static Shared> {
        (arg as *const Shared).as_ref()
    }

    fn context(&self) -> Option<TransportContext> {
        lock(&self.context).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Time left before `deadline`, or an error once it has passed.
fn remaining(deadline: Instant) -> Result<Duration, BleError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(BleError::DiscoveryFailed(format!(
            "discovery exceeded {}ms",
            DISCOVERY_WAIT.as_millis()
        )));
    }
    Ok(deadline - now)
}

pub struct EspBleTransport<W = NoopWatchdog> {
    shared: &'static Shared,
    own_addr_type: u8,
    watchdog: W,
}

impl EspBleTransport<NoopWatchdog> {
    pub fn new() -> Result<Self, BleError> {
        Self::with_watchdog(NoopWatchdog)
    }
}

impl<W: Watchdog> EspBleTransport<W> {
    /// Brings up the NimBLE host and waits (bounded) for it to sync with the controller.
    pub fn with_watchdog(watchdog: W) -> Result<Self, BleError> {
        Self::initialize()?;

        let shared: &'static Shared = Box::leak(Box::new(Shared {
            context: Mutex::new(None),
            conn_handle: Mutex::new(None),
            scratch: Mutex::new(DiscoveryScratch::default()),
            scanning: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connect_status: AtomicI32::new(NO_STATUS),
            gatt_status: AtomicI32::new(NO_STATUS),
        }));

        let mut transport = Self {
            shared,
            own_addr_type: esp_idf_sys::BLE_OWN_ADDR_PUBLIC as u8,
            watchdog,
        };
        if !transport.wait_until(SYNC_WAIT, || HOST_SYNCED.load(Ordering::Acquire)) {
            return Err(BleError::InitializationFailed("NimBLE host did not sync".to_string()));
        }

        let mut own_addr_type: u8 = 0;
        let ret = unsafe { esp_idf_sys::ble_hs_id_infer_auto(0, &mut own_addr_type) };
        if ret == 0 {
            transport.own_addr_type = own_addr_type;
        } else {
            warn!("Failed to infer own address type: {}", ret);
        }
        Ok(transport)
    }

    fn initialize() -> Result<(), BleError> {
        info!("Initializing BLE host stack");

        unsafe {
            let ret = esp_idf_sys::nimble_port_init();
            if ret != 0 {
                error!("nimble_port_init failed: {}", ret);
                return Err(BleError::InitializationFailed(format!("NimBLE init failed: {}", ret)));
            }

            esp_idf_sys::ble_hs_cfg.reset_cb = Some(on_reset);
            esp_idf_sys::ble_hs_cfg.sync_cb = Some(on_sync);
            esp_idf_sys::ble_hs_cfg.store_status_cb = Some(esp_idf_sys::ble_store_util_status_rr);

            esp_idf_sys::nimble_port_freertos_init(Some(host_task));
        }

        info!("BLE host stack initialized");
        Ok(())
    }

    fn wait_until(&self, budget: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + budget;
        loop {
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.watchdog.feed();
            std::thread::sleep(std::time::Duration::from_millis(POLL_INTERVAL_MS));
        }
    }

    fn conn_handle(&self) -> Result<u16, BleError> {
        lock(&self.shared.conn_handle).ok_or(BleError::NotConnected)
    }

    /// Starts a GATT procedure and waits for its terminal callback status.
    fn run_gatt(&self, budget: Duration, start: impl FnOnce() -> i32) -> Result<u16, i32> {
        self.shared.gatt_status.store(NO_STATUS, Ordering::Release);
        let ret = start();
        if ret != 0 {
            return Err(ret);
        }
        let finished = self.wait_until(budget, || {
            self.shared.gatt_status.load(Ordering::Acquire) != NO_STATUS
                || !self.shared.connected.load(Ordering::Acquire)
        });
        let status = self.shared.gatt_status.load(Ordering::Acquire);
        if !finished || status == NO_STATUS {
            return Err(NO_STATUS);
        }
        Ok(status as u16)
    }

    fn write_with_response(&self, handle: u16, data: &[u8]) -> Result<(), i32> {
        let conn = self.conn_handle().map_err(|_| NO_STATUS)?;
        let status = self.run_gatt(WRITE_WAIT, || unsafe {
            esp_idf_sys::ble_gattc_write_flat(
                conn,
                handle,
                data.as_ptr() as *const c_void,
                data.len() as u16,
                Some(write_complete_handler),
                self.shared.as_arg(),
            )
        })?;
        match status {
            0 => Ok(()),
            other => Err(other as i32),
        }
    }
}

impl<W: Watchdog> ScaleTransport for EspBleTransport<W> {
    fn register_callbacks(&mut self, context: TransportContext) {
        *lock(&self.shared.context) = Some(context);
    }

    fn scan_start(&mut self) -> Result<(), BleError> {
        if self.shared.scanning.load(Ordering::Acquire) {
            return Ok(());
        }

        let ret = unsafe {
            let mut disc_params: esp_idf_sys::ble_gap_disc_params = std::mem::zeroed();
            disc_params.itvl = 96; // 60ms
            disc_params.window = 48; // 30ms
            disc_params.filter_policy = 0;
            disc_params.set_passive(0); // active, names often live in the scan response
            disc_params.set_limited(0);
            disc_params.set_filter_duplicates(1);

            esp_idf_sys::ble_gap_disc(
                self.own_addr_type,
                BLE_HS_FOREVER,
                &disc_params,
                Some(gap_event_handler),
                self.shared.as_arg(),
            )
        };
        if ret != 0 {
            error!("Failed to start BLE discovery: {}", ret);
            return Err(BleError::ScanFailed(format!("ble_gap_disc returned {}", ret)));
        }
        self.shared.scanning.store(true, Ordering::Release);
        Ok(())
    }

    fn scan_stop(&mut self) {
        if self.shared.scanning.swap(false, Ordering::AcqRel) {
            unsafe {
                esp_idf_sys::ble_gap_disc_cancel();
            }
        }
    }

    fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::Acquire)
    }

    fn connect(&mut self, address: &BleAddress, params: &ConnectionParams) -> Result<(), BleError> {
        let ble_addr = esp_idf_sys::ble_addr_t {
            type_: address.addr_type,
            val: address.addr,
        };
        let conn_params = esp_idf_sys::ble_gap_conn_params {
            scan_itvl: 0x10,
            scan_window: 0x10,
            itvl_min: params.min_interval,
            itvl_max: params.max_interval,
            latency: params.latency,
            supervision_timeout: params.supervision_timeout,
            min_ce_len: 0,
            max_ce_len: 0,
        };

        self.shared.connect_status.store(NO_STATUS, Ordering::Release);
        let ret = unsafe {
            esp_idf_sys::ble_gap_connect(
                self.own_addr_type,
                &ble_addr,
                CONNECT_WAIT.as_millis() as i32,
                &conn_params,
                Some(gap_event_handler),
                self.shared.as_arg(),
            )
        };
        if ret != 0 {
            return Err(BleError::ConnectionFailed(format!("ble_gap_connect returned {}", ret)));
        }

        let settled = self.wait_until(CONNECT_WAIT, || {
            self.shared.connect_status.load(Ordering::Acquire) != NO_STATUS
        });
        match self.shared.connect_status.load(Ordering::Acquire) {
            0 => Ok(()),
            _ if !settled => {
                unsafe {
                    esp_idf_sys::ble_gap_conn_cancel();
                }
                Err(BleError::ConnectionFailed("connection timeout".to_string()))
            }
            status => Err(BleError::ConnectionFailed(format!("status {}", status))),
        }
    }

    fn disconnect(&mut self) {
        let Ok(handle) = self.conn_handle() else {
            return;
        };
        let ret = unsafe { esp_idf_sys::ble_gap_terminate(handle, BLE_ERR_REM_USER_CONN_TERM) };
        if ret != 0 {
            warn!("Failed to initiate BLE disconnection: {}", ret);
            return;
        }
        // Let the disconnect event land before the caller flushes its queue
        if !self.wait_until(DISCONNECT_WAIT, || !self.shared.connected.load(Ordering::Acquire)) {
            warn!("Disconnect event not seen within {}ms", DISCONNECT_WAIT.as_millis());
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn discover_services(&mut self) -> Result<Vec<Service>, BleError> {
        let conn = self.conn_handle()?;
        *lock(&self.shared.scratch) = DiscoveryScratch::default();
        let deadline = Instant::now() + DISCOVERY_WAIT;

        let status = self
            .run_gatt(remaining(deadline)?, || unsafe {
                esp_idf_sys::ble_gattc_disc_all_svcs(conn, Some(service_discovery_handler), self.shared.as_arg())
            })
            .map_err(|ret| BleError::DiscoveryFailed(format!("service discovery: {}", ret)))?;
        if status != BLE_HS_EDONE {
            return Err(BleError::DiscoveryFailed(format!("service discovery status {}", status)));
        }

        let found = std::mem::take(&mut lock(&self.shared.scratch).services);
        debug!("Discovered {} services", found.len());

        let mut services = Vec::with_capacity(found.len());
        for (uuid, start, end) in found {
            if !is_scale_service(&uuid) {
                services.push(Service { uuid, characteristics: Vec::new() });
                continue;
            }
            lock(&self.shared.scratch).characteristics.clear();
            let status = self
                .run_gatt(remaining(deadline)?, || unsafe {
                    esp_idf_sys::ble_gattc_disc_all_chrs(
                        conn,
                        start,
                        end,
                        Some(char_discovery_handler),
                        self.shared.as_arg(),
                    )
                })
                .map_err(|ret| BleError::DiscoveryFailed(format!("characteristic discovery: {}", ret)))?;
            if status != BLE_HS_EDONE {
                warn!("Characteristic discovery for {} ended with status {}", uuid, status);
            }
            let characteristics = std::mem::take(&mut lock(&self.shared.scratch).characteristics);
            services.push(Service { uuid, characteristics });
        }
        Ok(services)
    }

    fn subscribe(&mut self, characteristic: CharacteristicHandle) -> Result<(), BleError> {
        // CCCD sits right after the value handle on every supported scale
        let cccd = characteristic.0 + 1;
        self.write_with_response(cccd, &[0x01, 0x00])
            .map_err(|status| BleError::SubscribeFailed(format!("CCCD {} write status {}", cccd, status)))
    }

    fn write_value(&mut self, characteristic: CharacteristicHandle, data: &[u8]) -> Result<(), BleError> {
        self.write_with_response(characteristic.0, data)
            .map_err(|status| BleError::WriteFailed(format!("handle {} status {}", characteristic.0, status)))
    }
}

// --- NimBLE host callbacks ---

extern "C" fn on_reset(reason: i32) {
    error!("BLE host reset, reason: {}", reason);
    HOST_SYNCED.store(false, Ordering::Release);
}

extern "C" fn on_sync() {
    info!("BLE host synced");
    HOST_SYNCED.store(true, Ordering::Release);
}

extern "C" fn host_task(_param: *mut c_void) {
    unsafe {
        esp_idf_sys::nimble_port_run();
    }
}

// No logging on the notification path; it runs at the scale's packet rate
extern "C" fn gap_event_handler(event: *mut esp_idf_sys::ble_gap_event, arg: *mut c_void) -> i32 {
    let Some(shared) = (unsafe { Shared::from_arg(arg) }) else {
        return 0;
    };
    if event.is_null() {
        return 0;
    }

    unsafe {
        let event_ref = &*event;
        match event_ref.type_ as u32 {
            esp_idf_sys::BLE_GAP_EVENT_DISC => {
                let disc = &event_ref.__bindgen_anon_1.disc;
                if disc.data.is_null() {
                    return 0;
                }
                let adv_data = std::slice::from_raw_parts(disc.data, disc.length_data as usize);
                let Some(name) = parse_device_name(adv_data) else {
                    return 0;
                };
                // Keep unrelated advertisers out of the bounded event queue
                if !is_scale_name(&name) {
                    return 0;
                }
                let device = DiscoveredDevice {
                    name: Some(name),
                    address: BleAddress {
                        addr: disc.addr.val,
                        addr_type: disc.addr.type_,
                    },
                    rssi: disc.rssi,
                };
                if let Some(ctx) = shared.context() {
                    ctx.post(TransportEvent::DeviceFound(device));
                }
            }
            esp_idf_sys::BLE_GAP_EVENT_DISC_COMPLETE => {
                shared.scanning.store(false, Ordering::Release);
            }
            esp_idf_sys::BLE_GAP_EVENT_CONNECT => {
                let conn = &event_ref.__bindgen_anon_1.connect;
                if conn.status == 0 {
                    *lock(&shared.conn_handle) = Some(conn.conn_handle);
                    shared.connected.store(true, Ordering::Release);
                }
                shared.connect_status.store(conn.status, Ordering::Release);
            }
            esp_idf_sys::BLE_GAP_EVENT_DISCONNECT => {
                let disconn = &event_ref.__bindgen_anon_1.disconnect;
                {
                    let mut handle = lock(&shared.conn_handle);
                    if *handle != Some(disconn.conn.conn_handle) {
                        return 0;
                    }
                    *handle = None;
                }
                shared.connected.store(false, Ordering::Release);
                // Unblocks any GATT wait in progress
                shared.gatt_status.store(disconn.reason, Ordering::Release);
                if let Some(ctx) = shared.context() {
                    ctx.link_lost();
                }
            }
            esp_idf_sys::BLE_GAP_EVENT_NOTIFY_RX => {
                let notify = &event_ref.__bindgen_anon_1.notify_rx;
                if notify.om.is_null() {
                    return 0;
                }
                let om = &*notify.om;
                let data = std::slice::from_raw_parts(om.om_data, om.om_len as usize);
                // Oversized frames are never valid scale frames
                if let Ok(payload) = NotificationPayload::from_slice(data) {
                    if let Some(ctx) = shared.context() {
                        ctx.post(TransportEvent::Notification(payload));
                    }
                }
            }
            _ => {}
        }
    }

    0
}

extern "C" fn service_discovery_handler(
    _conn_handle: u16,
    error: *const esp_idf_sys::ble_gatt_error,
    service: *const esp_idf_sys::ble_gatt_svc,
    arg: *mut c_void,
) -> i32 {
    let Some(shared) = (unsafe { Shared::from_arg(arg) }) else {
        return 0;
    };
    unsafe {
        let status = error.as_ref().map_or(0, |e| e.status);
        if status != 0 {
            shared.gatt_status.store(status as i32, Ordering::Release);
            return 0;
        }
        if let Some(svc) = service.as_ref() {
            lock(&shared.scratch)
                .services
                .push((uuid_from_nimble(&svc.uuid), svc.start_handle, svc.end_handle));
        }
    }
    0
}

extern "C" fn char_discovery_handler(
    _conn_handle: u16,
    error: *const esp_idf_sys::ble_gatt_error,
    chr: *const esp_idf_sys::ble_gatt_chr,
    arg: *mut c_void,
) -> i32 {
    let Some(shared) = (unsafe { Shared::from_arg(arg) }) else {
        return 0;
    };
    unsafe {
        let status = error.as_ref().map_or(0, |e| e.status);
        if status != 0 {
            shared.gatt_status.store(status as i32, Ordering::Release);
            return 0;
        }
        if let Some(chr_ref) = chr.as_ref() {
            let props = chr_ref.properties;
            let write_mask =
                (esp_idf_sys::BLE_GATT_CHR_PROP_WRITE | esp_idf_sys::BLE_GATT_CHR_PROP_WRITE_NO_RSP) as u8;
            lock(&shared.scratch).characteristics.push(Characteristic {
                uuid: uuid_from_nimble(&chr_ref.uuid),
                handle: CharacteristicHandle(chr_ref.val_handle),
                can_notify: props & esp_idf_sys::BLE_GATT_CHR_PROP_NOTIFY as u8 != 0,
                can_write: props & write_mask != 0,
            });
        }
    }
    0
}

extern "C" fn write_complete_handler(
    _conn_handle: u16,
    error: *const esp_idf_sys::ble_gatt_error,
    _attr: *mut esp_idf_sys::ble_gatt_attr,
    arg: *mut c_void,
) -> i32 {
    let Some(shared) = (unsafe { Shared::from_arg(arg) }) else {
        return 0;
    };
    let status = unsafe { error.as_ref().map_or(0, |e| e.status) };
    shared.gatt_status.store(status as i32, Ordering::Release);
    0
}

fn uuid_from_nimble(uuid: &esp_idf_sys::ble_uuid_any_t) -> Uuid {
    unsafe {
        match uuid.u.type_ as u32 {
            esp_idf_sys::BLE_UUID_TYPE_16 => crate::ble::ble_uuid16(uuid.u16_.value),
            esp_idf_sys::BLE_UUID_TYPE_32 => crate::ble::ble_uuid32(uuid.u32_.value),
            _ => {
                // NimBLE stores 128-bit values little-endian
                let mut bytes = uuid.u128_.value;
                bytes.reverse();
                Uuid::from_bytes(bytes)
            }
        }
    }
}
