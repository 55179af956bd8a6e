pub mod ble;
#[cfg(target_os = "espidf")]
pub mod ble_bindings;
pub mod ble_mock;
pub mod controller;
pub mod protocol;
pub mod scales;
pub mod state;
pub mod system;
pub mod types;

pub use types::*;
pub use controller::*;
