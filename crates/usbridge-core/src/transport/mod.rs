//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use self::mock::{MockBackend, MockDevice};
pub use self::nusb::NusbBackend;
pub use self::traits::{AttachedDevice, DeviceStrings, TransportError, UsbBackend, UsbHandle};
