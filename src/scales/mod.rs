pub mod acaia;
pub mod discovery;
pub mod liveness;
pub mod traits;

pub use acaia::*;
pub use discovery::*;
pub use liveness::*;
pub use traits::*;
