//! Advertisement filtering for supported scales.

use crate::ble::{BleAddress, DiscoveredDevice};
use bstr::ByteSlice;
use log::{debug, trace};

const AD_TYPE_SHORT_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_NAME: u8 = 0x09;

/// Advertised-name prefixes of every supported scale.
pub const SCALE_NAME_PREFIXES: [&str; 6] = ["CINCO", "ACAIA", "PYXIS", "LUNAR", "PROCH", "FELIC"];
pub const SCALE_NAME_PREFIX_LEN: usize = 5;

/// True if the first five characters of `name` are a known prefix. Case-sensitive.
pub fn is_scale_name(name: &str) -> bool {
    match name.as_bytes().get(..SCALE_NAME_PREFIX_LEN) {
        Some(prefix) => SCALE_NAME_PREFIXES
            .iter()
            .any(|known| known.as_bytes() == prefix),
        None => false,
    }
}

/// Local name from raw advertisement data (complete or shortened name AD
/// structure). Invalid UTF-8 is replaced rather than dropped.
pub fn parse_device_name(adv_data: &[u8]) -> Option<String> {
    let mut offset = 0;

    while offset + 1 < adv_data.len() {
        let length = adv_data[offset] as usize;
        if length == 0 || offset + length >= adv_data.len() {
            break;
        }

        let ad_type = adv_data[offset + 1];
        if ad_type == AD_TYPE_COMPLETE_NAME || ad_type == AD_TYPE_SHORT_NAME {
            let name = adv_data[offset + 2..offset + 1 + length].trim_with(|c| c == '\0');
            return Some(name.to_str_lossy().into_owned());
        }

        offset += 1 + length;
    }

    None
}

/// Match criteria for one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Only accept this address when set.
    pub target: Option<BleAddress>,
}

impl DeviceFilter {
    pub fn any_scale() -> Self {
        Self::default()
    }

    pub fn for_address(target: Option<BleAddress>) -> Self {
        Self { target }
    }

    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        let Some(name) = device.name.as_deref() else {
            trace!("Device without name at {} (RSSI: {})", device.address, device.rssi);
            return false;
        };
        trace!("BLE device found: '{}' (RSSI: {} dBm, Address: {})", name, device.rssi, device.address);

        if !is_scale_name(name) {
            return false;
        }
        match self.target {
            Some(ref target) if !target.same_device(&device.address) => {
                debug!("Ignoring {} at {}: waiting for {}", name, device.address, target);
                false
            }
            _ => true,
        }
    }
}
