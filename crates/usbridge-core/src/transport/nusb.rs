//! nusb-based USB backend.

use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, In, Out, TransferError as NusbTransferError};
use nusb::{DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{AttachedDevice, DeviceStrings, TransportError, UsbBackend, UsbHandle};
use crate::constants::LANGUAGE_ID_US_ENGLISH;

/// Grace period for a cancelled transfer to be reaped.
const CANCEL_GRACE: Duration = Duration::from_millis(100);

/// Host USB access through nusb.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBackend;

impl NusbBackend {
    pub fn new() -> Self {
        Self
    }
}

impl UsbBackend for NusbBackend {
    fn devices(&self) -> Result<Vec<Box<dyn AttachedDevice>>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;

        Ok(devices
            .map(|info| Box::new(NusbDevice { info }) as Box<dyn AttachedDevice>)
            .collect())
    }
}

struct NusbDevice {
    info: DeviceInfo,
}

impl AttachedDevice for NusbDevice {
    fn vendor_id(&self) -> u16 {
        self.info.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.info.product_id()
    }

    fn serial_number(&self) -> Option<String> {
        self.info.serial_number().map(str::to_owned)
    }

    fn product_string(&self) -> Option<String> {
        self.info.product_string().map(str::to_owned)
    }

    #[instrument(skip(self), fields(vid = %format!("{:04X}", self.info.vendor_id()), pid = %format!("{:04X}", self.info.product_id())))]
    fn read_strings(&self, timeout: Duration) -> Result<DeviceStrings, TransportError> {
        let device = self
            .info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let descriptor = device.device_descriptor();
        let language = device
            .get_string_descriptor_supported_languages(timeout)
            .wait()
            .ok()
            .and_then(|mut langs| langs.next())
            .unwrap_or(LANGUAGE_ID_US_ENGLISH);

        let serial = descriptor.serial_number_string_index().and_then(|index| {
            device
                .get_string_descriptor(index, language, timeout)
                .wait()
                .map_err(|e| debug!(error = %e, "Serial string read failed"))
                .ok()
        });
        let product = descriptor.product_string_index().and_then(|index| {
            device
                .get_string_descriptor(index, language, timeout)
                .wait()
                .map_err(|e| debug!(error = %e, "Product string read failed"))
                .ok()
        });

        Ok(DeviceStrings { serial, product })
    }

    #[instrument(level = "info", skip(self), fields(vid = %format!("{:04X}", self.info.vendor_id()), pid = %format!("{:04X}", self.info.product_id())))]
    fn open(&self, interface: u8) -> Result<Box<dyn UsbHandle>, TransportError> {
        let device = self
            .info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface = device.claim_interface(interface).wait().map_err(|e| {
            TransportError::ClaimInterfaceFailed {
                interface,
                message: e.to_string(),
            }
        })?;

        info!("Interface claimed");
        Ok(Box::new(NusbHandle { interface }))
    }
}

/// Claimed interface. Dropping it releases the interface and the device.
struct NusbHandle {
    interface: Interface,
}

impl UsbHandle for NusbHandle {
    #[instrument(skip(self, data), fields(endpoint = %format!("0x{:02X}", endpoint), len = data.len()))]
    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut ep = self
            .interface
            .endpoint::<Bulk, Out>(endpoint)
            .map_err(|e| TransportError::EndpointUnavailable {
                endpoint,
                message: e.to_string(),
            })?;

        ep.submit(Buffer::from(data.to_vec()));
        let Some(completion) = ep.wait_next_complete(timeout) else {
            ep.cancel_all();
            let _ = ep.wait_next_complete(CANCEL_GRACE);
            return Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        };

        completion.status.map_err(map_transfer_error)?;
        debug!(bytes_written = completion.actual_len, "Write complete");
        Ok(completion.actual_len)
    }

    #[instrument(skip(self), fields(endpoint = %format!("0x{:02X}", endpoint), max_len))]
    fn bulk_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut ep = self
            .interface
            .endpoint::<Bulk, In>(endpoint)
            .map_err(|e| TransportError::EndpointUnavailable {
                endpoint,
                message: e.to_string(),
            })?;

        // IN requests must be a whole number of packets.
        let packet = ep.max_packet_size().max(1);
        let requested = max_len.div_ceil(packet) * packet;

        ep.submit(Buffer::new(requested));
        let Some(completion) = ep.wait_next_complete(timeout) else {
            ep.cancel_all();
            let _ = ep.wait_next_complete(CANCEL_GRACE);
            return Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        };

        completion.status.map_err(map_transfer_error)?;

        let mut data = completion.buffer.into_vec();
        data.truncate(completion.actual_len);
        if data.len() > max_len {
            warn!(
                received = data.len(),
                max_len, "Device sent more than requested, extra bytes dropped"
            );
            data.truncate(max_len);
        }
        debug!(bytes_read = data.len(), "Read complete");
        Ok(data)
    }
}

fn map_transfer_error(err: NusbTransferError) -> TransportError {
    match err {
        NusbTransferError::Stall => TransportError::Stall,
        NusbTransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::TransferFailed(other.to_string()),
    }
}
