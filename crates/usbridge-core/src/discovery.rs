//! Device discovery: enumerate attached devices and keep allow-listed vendors.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::constants::{DEFAULT_VENDOR_IDS, DISCOVERY_TIMEOUT_MS};
use crate::transport::UsbBackend;

/// Identity of a discovered device. Holds no live handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Serial number string, empty if unreadable.
    pub serial: String,
    /// Product description string, empty if unreadable.
    pub description: String,
}

impl DeviceDescriptor {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            ..Default::default()
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = serial.into();
        self
    }
}

/// Vendor allow-list applied by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VendorFilter {
    vendor_ids: Vec<u16>,
}

impl VendorFilter {
    pub fn new(vendor_ids: impl IntoIterator<Item = u16>) -> Self {
        Self {
            vendor_ids: vendor_ids.into_iter().collect(),
        }
    }

    pub fn contains(&self, vendor_id: u16) -> bool {
        self.vendor_ids.contains(&vendor_id)
    }

    pub fn vendor_ids(&self) -> &[u16] {
        &self.vendor_ids
    }
}

impl Default for VendorFilter {
    fn default() -> Self {
        Self::new(DEFAULT_VENDOR_IDS.iter().copied())
    }
}

/// Best-effort device enumeration. Never fails.
pub struct Discovery {
    backend: Arc<dyn UsbBackend>,
    filter: VendorFilter,
    string_timeout: Duration,
}

impl Discovery {
    pub fn new(backend: Arc<dyn UsbBackend>, filter: VendorFilter) -> Self {
        Self {
            backend,
            filter,
            string_timeout: Duration::from_millis(u64::from(DISCOVERY_TIMEOUT_MS)),
        }
    }

    pub fn with_string_timeout(mut self, timeout: Duration) -> Self {
        self.string_timeout = timeout;
        self
    }

    pub fn filter(&self) -> &VendorFilter {
        &self.filter
    }

    /// Return up to `max_results` allow-listed devices.
    ///
    /// Each match is opened transiently to read its serial and product
    /// strings. A device whose strings cannot be read is still reported,
    /// with empty strings.
    #[instrument(skip(self))]
    pub fn discover(&self, max_results: usize) -> Vec<DeviceDescriptor> {
        if max_results == 0 {
            return Vec::new();
        }

        let devices = match self.backend.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Device enumeration failed");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        for device in devices {
            if !self.filter.contains(device.vendor_id()) {
                continue;
            }

            let strings = device
                .read_strings(self.string_timeout)
                .map_err(|e| {
                    debug!(
                        vid = %format!("{:04X}", device.vendor_id()),
                        pid = %format!("{:04X}", device.product_id()),
                        error = %e,
                        "String descriptors unavailable"
                    )
                })
                .unwrap_or_default();

            found.push(DeviceDescriptor {
                vendor_id: device.vendor_id(),
                product_id: device.product_id(),
                serial: strings.serial.unwrap_or_default(),
                description: strings.product.unwrap_or_default(),
            });

            if found.len() >= max_results {
                break;
            }
        }

        debug!(count = found.len(), "Discovery complete");
        found
    }
}
