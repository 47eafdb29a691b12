//! Renesas RX serial boot mode flash programmer.

pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod memory;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod variant;

pub use self::device::{Device, DeviceDB};
pub use self::error::{Error, Result};
pub use self::flashing::Flashing;
pub use self::memory::PageMemory;
pub use self::transport::Transport;
pub use self::variant::{BindOptions, Family, Protocol, Variant};
