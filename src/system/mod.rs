pub mod clock;
pub mod config;
pub mod watchdog;

pub use clock::*;
pub use config::*;
pub use watchdog::*;
