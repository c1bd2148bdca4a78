//! Mock USB backend for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{AttachedDevice, DeviceStrings, TransportError, UsbBackend, UsbHandle};
use crate::constants::{DEFAULT_ENDPOINT_IN, DEFAULT_ENDPOINT_OUT, PRIMARY_INTERFACE};

/// Mock backend holding a list of simulated devices.
#[derive(Clone, Default)]
pub struct MockBackend {
    devices: Arc<Mutex<Vec<MockDevice>>>,
    enumeration_fails: Arc<Mutex<bool>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with one device attached.
    pub fn with_device(device: MockDevice) -> Self {
        let backend = Self::new();
        backend.attach(device);
        backend
    }

    /// Attach a device to the simulated bus.
    pub fn attach(&self, device: MockDevice) {
        self.devices.lock().unwrap().push(device);
    }

    /// Make the next enumerations fail.
    pub fn set_enumeration_fails(&self, fails: bool) {
        *self.enumeration_fails.lock().unwrap() = fails;
    }
}

impl UsbBackend for MockBackend {
    fn devices(&self) -> Result<Vec<Box<dyn AttachedDevice>>, TransportError> {
        if *self.enumeration_fails.lock().unwrap() {
            return Err(TransportError::EnumerationFailed("mock bus error".into()));
        }
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.is_connected())
            .map(|d| Box::new(d.clone()) as Box<dyn AttachedDevice>)
            .collect())
    }
}

struct MockLink {
    connected: bool,
    claim_fails: bool,
    strings_fail: bool,
    claimed: bool,
    echo: bool,
    endpoint_in: u8,
    endpoint_out: u8,
    /// Frames returned by bulk IN, oldest first.
    rx: VecDeque<Vec<u8>>,
    /// Captured OUT transfers as (endpoint, data).
    writes: Vec<(u8, Vec<u8>)>,
    write_failures: usize,
    read_failures: usize,
    short_writes: usize,
    open_count: usize,
    release_count: usize,
    transfer_count: usize,
}

/// Simulated device. Clones share state, so a test can keep one and hand
/// another to the backend.
#[derive(Clone)]
pub struct MockDevice {
    vid: u16,
    pid: u16,
    serial: Option<String>,
    product: Option<String>,
    link: Arc<Mutex<MockLink>>,
}

impl MockDevice {
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid,
            serial: None,
            product: None,
            link: Arc::new(Mutex::new(MockLink {
                connected: true,
                claim_fails: false,
                strings_fail: false,
                claimed: false,
                echo: false,
                endpoint_in: DEFAULT_ENDPOINT_IN,
                endpoint_out: DEFAULT_ENDPOINT_OUT,
                rx: VecDeque::new(),
                writes: Vec::new(),
                write_failures: 0,
                read_failures: 0,
                short_writes: 0,
                open_count: 0,
                release_count: 0,
                transfer_count: 0,
            })),
        }
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    pub fn with_product(mut self, product: &str) -> Self {
        self.product = Some(product.to_string());
        self
    }

    /// Echo every OUT transfer back on the IN endpoint.
    pub fn with_echo(self) -> Self {
        self.link.lock().unwrap().echo = true;
        self
    }

    /// Queue a frame to be returned by the next bulk IN.
    pub fn queue_rx(&self, data: &[u8]) {
        self.link.lock().unwrap().rx.push_back(data.to_vec());
    }

    /// Number of queued IN frames.
    pub fn rx_pending(&self) -> usize {
        self.link.lock().unwrap().rx.len()
    }

    /// Time out the next `count` OUT transfers.
    pub fn fail_next_writes(&self, count: usize) {
        self.link.lock().unwrap().write_failures = count;
    }

    /// Time out the next `count` IN transfers.
    pub fn fail_next_reads(&self, count: usize) {
        self.link.lock().unwrap().read_failures = count;
    }

    /// Accept only half of the next `count` OUT transfers.
    pub fn short_next_writes(&self, count: usize) {
        self.link.lock().unwrap().short_writes = count;
    }

    /// Simulate unplugging. The device disappears from enumeration.
    pub fn disconnect(&self) {
        self.link.lock().unwrap().connected = false;
    }

    /// Simulate plugging back in.
    pub fn reconnect(&self) {
        self.link.lock().unwrap().connected = true;
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().unwrap().connected
    }

    /// Make interface claims fail.
    pub fn set_claim_fails(&self, fails: bool) {
        self.link.lock().unwrap().claim_fails = fails;
    }

    /// Make the transient string read fail.
    pub fn set_strings_fail(&self, fails: bool) {
        self.link.lock().unwrap().strings_fail = fails;
    }

    /// Captured OUT transfers.
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.link.lock().unwrap().writes.clone()
    }

    /// Successful claims so far.
    pub fn open_count(&self) -> usize {
        self.link.lock().unwrap().open_count
    }

    /// Handles dropped so far.
    pub fn release_count(&self) -> usize {
        self.link.lock().unwrap().release_count
    }

    /// Bulk transfers attempted (in either direction).
    pub fn transfer_count(&self) -> usize {
        self.link.lock().unwrap().transfer_count
    }

    pub fn is_claimed(&self) -> bool {
        self.link.lock().unwrap().claimed
    }
}

impl AttachedDevice for MockDevice {
    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn serial_number(&self) -> Option<String> {
        self.serial.clone()
    }

    fn product_string(&self) -> Option<String> {
        self.product.clone()
    }

    fn read_strings(&self, _timeout: Duration) -> Result<DeviceStrings, TransportError> {
        let link = self.link.lock().unwrap();
        if link.strings_fail {
            return Err(TransportError::StringReadFailed("access denied".into()));
        }
        Ok(DeviceStrings {
            serial: self.serial.clone(),
            product: self.product.clone(),
        })
    }

    fn open(&self, interface: u8) -> Result<Box<dyn UsbHandle>, TransportError> {
        let mut link = self.link.lock().unwrap();
        if !link.connected {
            return Err(TransportError::OpenFailed("device gone".into()));
        }
        if link.claim_fails || link.claimed || interface != PRIMARY_INTERFACE {
            return Err(TransportError::ClaimInterfaceFailed {
                interface,
                message: "resource busy".into(),
            });
        }
        link.claimed = true;
        link.open_count += 1;
        Ok(Box::new(MockHandle {
            link: Arc::clone(&self.link),
        }))
    }
}

struct MockHandle {
    link: Arc<Mutex<MockLink>>,
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        let mut link = self.link.lock().unwrap();
        link.claimed = false;
        link.release_count += 1;
    }
}

impl UsbHandle for MockHandle {
    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut link = self.link.lock().unwrap();
        if !link.connected {
            return Err(TransportError::Disconnected);
        }
        if endpoint != link.endpoint_out {
            return Err(TransportError::EndpointUnavailable {
                endpoint,
                message: "no such OUT endpoint".into(),
            });
        }
        link.transfer_count += 1;
        if link.write_failures > 0 {
            link.write_failures -= 1;
            return Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        if link.short_writes > 0 {
            link.short_writes -= 1;
            let accepted = data.len() / 2;
            link.writes.push((endpoint, data[..accepted].to_vec()));
            return Ok(accepted);
        }
        link.writes.push((endpoint, data.to_vec()));
        if link.echo && !data.is_empty() {
            link.rx.push_back(data.to_vec());
        }
        Ok(data.len())
    }

    fn bulk_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut link = self.link.lock().unwrap();
        if !link.connected {
            return Err(TransportError::Disconnected);
        }
        if endpoint != link.endpoint_in {
            return Err(TransportError::EndpointUnavailable {
                endpoint,
                message: "no such IN endpoint".into(),
            });
        }
        link.transfer_count += 1;
        let timed_out = TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        };
        if link.read_failures > 0 {
            link.read_failures -= 1;
            return Err(timed_out);
        }
        let mut frame = link.rx.pop_front().ok_or(timed_out)?;
        if frame.len() > max_len {
            let rest = frame.split_off(max_len);
            link.rx.push_front(rest);
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(10);

    #[test]
    fn test_mock_echo() {
        let device = MockDevice::new(0x0483, 0x5740).with_echo();
        let mut handle = device.open(0).unwrap();

        assert_eq!(handle.bulk_out(0x01, b"Hello", TIMEOUT).unwrap(), 5);
        assert_eq!(handle.bulk_in(0x81, 64, TIMEOUT).unwrap(), b"Hello");

        // Queue is empty now
        assert!(matches!(
            handle.bulk_in(0x81, 64, TIMEOUT),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_mock_splits_long_frames() {
        let device = MockDevice::new(0x0483, 0x5740);
        device.queue_rx(b"abcdef");
        let mut handle = device.open(0).unwrap();

        assert_eq!(handle.bulk_in(0x81, 4, TIMEOUT).unwrap(), b"abcd");
        assert_eq!(handle.bulk_in(0x81, 4, TIMEOUT).unwrap(), b"ef");
    }

    #[test]
    fn test_mock_exclusive_claim() {
        let device = MockDevice::new(0x0403, 0x6001);
        let handle = device.open(0).unwrap();
        assert!(device.is_claimed());
        assert!(device.open(0).is_err());

        drop(handle);
        assert!(!device.is_claimed());
        assert_eq!(device.release_count(), 1);
    }

    #[test]
    fn test_mock_disconnect() {
        let device = MockDevice::new(0x0403, 0x6001);
        let backend = MockBackend::with_device(device.clone());
        let mut handle = device.open(0).unwrap();

        device.disconnect();
        assert!(backend.devices().unwrap().is_empty());
        assert!(matches!(
            handle.bulk_out(0x01, b"x", TIMEOUT),
            Err(TransportError::Disconnected)
        ));
    }
}
