//! USB access layer abstraction.
//!
//! The session core never talks to a host controller directly. It goes
//! through these traits, which allow different implementations:
//! - `NusbBackend` for real hardware
//! - `MockBackend` for unit testing

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint 0x{endpoint:02X} unavailable: {message}")]
    EndpointUnavailable { endpoint: u8, message: String },

    #[error("String descriptor read failed: {0}")]
    StringReadFailed(String),

    #[error("Endpoint stalled")]
    Stall,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transfer failed: {0}")]
    TransferFailed(String),
}

/// Serial-number and product strings read from a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStrings {
    pub serial: Option<String>,
    pub product: Option<String>,
}

/// Enumeration primitive of the USB access layer.
pub trait UsbBackend: Send + Sync {
    /// List every device currently attached.
    fn devices(&self) -> Result<Vec<Box<dyn AttachedDevice>>, TransportError>;
}

/// One entry of the live device list. Holds no open handle.
pub trait AttachedDevice {
    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;

    /// Serial number as cached by the OS at enumeration, if any.
    fn serial_number(&self) -> Option<String>;

    /// Product string as cached by the OS at enumeration, if any.
    fn product_string(&self) -> Option<String>;

    /// Open the device transiently to read its string descriptors.
    /// The transient handle is released before returning.
    fn read_strings(&self, timeout: Duration) -> Result<DeviceStrings, TransportError>;

    /// Open the device and claim `interface`.
    fn open(&self, interface: u8) -> Result<Box<dyn UsbHandle>, TransportError>;
}

/// An open device with a claimed interface.
///
/// Dropping the handle releases the interface and closes the device.
pub trait UsbHandle: Send {
    /// Single bulk OUT transfer. Returns the number of bytes accepted.
    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Single bulk IN transfer of at most `max_len` bytes.
    fn bulk_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}
