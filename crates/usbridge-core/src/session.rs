//! Device session: owns the native handle and drives the connection lifecycle.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::constants::PRIMARY_INTERFACE;
use crate::discovery::DeviceDescriptor;
use crate::error::{BridgeError, ErrorCode, Result};
use crate::events::{BridgeEvent, BridgeObserver, TracingObserver};
use crate::state::ConnectionState;
use crate::transport::{UsbBackend, UsbHandle};

/// Live binding to one device, from `open` to `close`.
///
/// The session exclusively owns the native handle. Dropping the session
/// releases it.
pub struct Session {
    backend: Arc<dyn UsbBackend>,
    observer: Arc<dyn BridgeObserver>,
    descriptor: Option<DeviceDescriptor>,
    state: ConnectionState,
    config: SessionConfig,
    last_error: ErrorCode,
    last_error_message: Option<String>,
    handle: Option<Box<dyn UsbHandle>>,
}

impl Session {
    /// Create a closed session with default config.
    pub fn new(backend: Arc<dyn UsbBackend>) -> Self {
        Self::with_config(backend, SessionConfig::default())
    }

    pub fn with_config(backend: Arc<dyn UsbBackend>, config: SessionConfig) -> Self {
        Self {
            backend,
            observer: Arc::new(TracingObserver),
            descriptor: None,
            state: ConnectionState::Closed,
            config,
            last_error: ErrorCode::Success,
            last_error_message: None,
            handle: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn BridgeObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Last requested or opened device.
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    pub fn last_error_message(&self) -> Option<&str> {
        self.last_error_message.as_deref()
    }

    /// Whether a native handle is currently held.
    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Find the device on the live bus and claim its primary interface.
    ///
    /// A non-empty `descriptor.serial` must match the device serial too.
    #[instrument(skip(self, descriptor), fields(vid = %format!("{:04X}", descriptor.vendor_id), pid = %format!("{:04X}", descriptor.product_id)))]
    pub fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<()> {
        if self.state.is_open() {
            warn!("Session already open");
            return Err(self.fail(BridgeError::AlreadyOpen));
        }
        if !self.state.can_open() {
            // last_error keeps the failure that led here
            return Err(BridgeError::InvalidState { state: self.state });
        }

        self.descriptor = Some(descriptor.clone());
        self.goto_state(ConnectionState::Opening);

        match self.claim(descriptor) {
            Ok((handle, live)) => {
                self.handle = Some(handle);
                self.last_error = ErrorCode::Success;
                self.last_error_message = None;
                self.emit(BridgeEvent::DeviceOpened {
                    vid: live.vendor_id,
                    pid: live.product_id,
                });
                self.descriptor = Some(live);
                self.goto_state(ConnectionState::Open);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Open failed");
                let err = self.fail(err);
                self.goto_state(ConnectionState::Error);
                Err(err)
            }
        }
    }

    fn claim(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<(Box<dyn UsbHandle>, DeviceDescriptor)> {
        let vid = descriptor.vendor_id;
        let pid = descriptor.product_id;

        let device = self
            .backend
            .devices()
            .map_err(|source| BridgeError::OpenFailed { vid, pid, source })?
            .into_iter()
            .find(|d| {
                d.vendor_id() == vid
                    && d.product_id() == pid
                    && (descriptor.serial.is_empty()
                        || d.serial_number().as_deref() == Some(descriptor.serial.as_str()))
            })
            .ok_or(BridgeError::DeviceNotFound { vid, pid })?;

        let handle = device
            .open(PRIMARY_INTERFACE)
            .map_err(|source| BridgeError::OpenFailed { vid, pid, source })?;

        let live = DeviceDescriptor {
            vendor_id: vid,
            product_id: pid,
            serial: device.serial_number().unwrap_or_default(),
            description: device
                .product_string()
                .unwrap_or_else(|| descriptor.description.clone()),
        };
        Ok((handle, live))
    }

    /// Replace the config wholesale. Only allowed while open.
    pub fn configure(&mut self, config: SessionConfig) -> Result<()> {
        if !self.state.is_open() {
            return Err(self.fail(BridgeError::InvalidState { state: self.state }));
        }
        if let Err(err) = config.validate() {
            return Err(self.fail(err));
        }
        debug!(?config, "Session reconfigured");
        self.config = config;
        Ok(())
    }

    /// Release the handle if held and return to `Closed`. Idempotent.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            drop(handle);
            let (vid, pid) = self
                .descriptor
                .as_ref()
                .map(|d| (d.vendor_id, d.product_id))
                .unwrap_or_default();
            info!("Interface released");
            self.emit(BridgeEvent::DeviceClosed { vid, pid });
        }
        if self.state != ConnectionState::Closed {
            self.goto_state(ConnectionState::Closed);
        }
    }

    /// Handle for a transfer, or `NotOpen` if the session is not open.
    pub(crate) fn transfer_handle(&mut self) -> Result<&mut (dyn UsbHandle + 'static)> {
        let state = self.state;
        match self.handle.as_mut() {
            Some(handle) if state.is_open() => Ok(&mut **handle),
            _ => Err(BridgeError::NotOpen { state }),
        }
    }

    /// Enter `Error` after the policy layer gives up. The handle is kept
    /// until `close`.
    pub(crate) fn enter_error(&mut self, code: ErrorCode) {
        self.last_error = code;
        if self.state != ConnectionState::Error {
            self.goto_state(ConnectionState::Error);
        }
    }

    /// Record `err` as the last error and hand it back.
    pub(crate) fn fail(&mut self, err: BridgeError) -> BridgeError {
        self.last_error = err.code();
        self.last_error_message = Some(err.to_string());
        err
    }

    /// Run `op` and put `last_error` back as it was.
    pub(crate) fn preserve_last_error<T>(&mut self, op: impl FnOnce(&mut Self) -> T) -> T {
        let code = self.last_error;
        let message = self.last_error_message.take();
        let output = op(self);
        self.last_error = code;
        self.last_error_message = message;
        output
    }

    pub(crate) fn emit(&self, event: BridgeEvent) {
        self.observer.on_event(&event);
    }

    fn goto_state(&mut self, to: ConnectionState) {
        let from = self.state;
        tracing::info!(from = %from, to = %to, "State transition");
        self.state = to;
        self.emit(BridgeEvent::StateChanged { from, to });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingObserver;
    use crate::transport::{MockBackend, MockDevice};

    fn stm32() -> MockDevice {
        MockDevice::new(0x0483, 0x5740).with_serial("STM001")
    }

    fn session_with(device: &MockDevice) -> Session {
        Session::new(Arc::new(MockBackend::with_device(device.clone())))
    }

    #[test]
    fn test_open_and_close() {
        let device = stm32();
        let mut session = session_with(&device);

        session.open(&DeviceDescriptor::new(0x0483, 0x5740)).unwrap();
        assert_eq!(session.state(), ConnectionState::Open);
        assert!(session.has_handle());
        assert!(device.is_claimed());
        assert_eq!(session.descriptor().unwrap().serial, "STM001");

        session.close();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(!session.has_handle());
        assert!(!device.is_claimed());
    }

    #[test]
    fn test_open_not_found_enters_error() {
        let device = stm32();
        let mut session = session_with(&device);

        let err = session
            .open(&DeviceDescriptor::new(0x0403, 0x6001))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(session.state(), ConnectionState::Error);
        assert_eq!(session.last_error(), ErrorCode::NotFound);
        assert!(session.last_error_message().is_some());
        assert!(!session.has_handle());
    }

    #[test]
    fn test_claim_failure_is_not_found() {
        let device = stm32();
        device.set_claim_fails(true);
        let mut session = session_with(&device);

        let err = session
            .open(&DeviceDescriptor::new(0x0483, 0x5740))
            .unwrap_err();
        assert!(matches!(err, BridgeError::OpenFailed { .. }));
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(session.state(), ConnectionState::Error);
    }

    #[test]
    fn test_reopen_rejected_without_touching_handle() {
        let device = stm32();
        let mut session = session_with(&device);
        let descriptor = DeviceDescriptor::new(0x0483, 0x5740);

        session.open(&descriptor).unwrap();
        let err = session.open(&descriptor).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Busy);
        assert_eq!(session.state(), ConnectionState::Open);
        assert!(session.has_handle());
        assert_eq!(device.open_count(), 1);
        assert_eq!(device.release_count(), 0);
    }

    #[test]
    fn test_error_requires_close_before_open() {
        let device = stm32();
        device.disconnect();
        let mut session = session_with(&device);
        let descriptor = DeviceDescriptor::new(0x0483, 0x5740);

        assert!(session.open(&descriptor).is_err());
        device.reconnect();

        let err = session.open(&descriptor).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
        assert_eq!(session.state(), ConnectionState::Error);
        // The original failure stays visible
        assert_eq!(session.last_error(), ErrorCode::NotFound);
        assert!(
            session
                .last_error_message()
                .is_some_and(|m| m.contains("not found"))
        );

        session.close();
        session.open(&descriptor).unwrap();
        assert_eq!(session.state(), ConnectionState::Open);
        assert_eq!(session.last_error(), ErrorCode::Success);
    }

    #[test]
    fn test_open_stores_live_strings() {
        let device = stm32().with_product("Virtual COM Port");
        let mut session = session_with(&device);

        session.open(&DeviceDescriptor::new(0x0483, 0x5740)).unwrap();
        let live = session.descriptor().unwrap();
        assert_eq!(live.serial, "STM001");
        assert_eq!(live.description, "Virtual COM Port");
    }

    #[test]
    fn test_close_is_idempotent() {
        let device = stm32();
        let mut session = session_with(&device);

        // Never opened
        session.close();
        session.close();
        assert_eq!(session.state(), ConnectionState::Closed);

        session.open(&DeviceDescriptor::new(0x0483, 0x5740)).unwrap();
        session.close();
        session.close();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(device.release_count(), 1);
    }

    #[test]
    fn test_drop_releases_handle() {
        let device = stm32();
        {
            let mut session = session_with(&device);
            session.open(&DeviceDescriptor::new(0x0483, 0x5740)).unwrap();
            assert!(device.is_claimed());
        }
        assert!(!device.is_claimed());
        assert_eq!(device.release_count(), 1);
    }

    #[test]
    fn test_serial_must_match() {
        let device = stm32();
        let mut session = session_with(&device);

        let wrong = DeviceDescriptor::new(0x0483, 0x5740).with_serial("OTHER");
        assert!(session.open(&wrong).is_err());
        session.close();

        let right = DeviceDescriptor::new(0x0483, 0x5740).with_serial("STM001");
        session.open(&right).unwrap();
    }

    #[test]
    fn test_configure_requires_open() {
        let device = stm32();
        let mut session = session_with(&device);
        let config = SessionConfig {
            timeout_ms: 50,
            ..Default::default()
        };

        let err = session.configure(config.clone()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
        assert_eq!(session.config().timeout_ms, 1000);

        session.open(&DeviceDescriptor::new(0x0483, 0x5740)).unwrap();
        session.configure(config.clone()).unwrap();
        assert_eq!(session.config(), &config);
    }

    #[test]
    fn test_configure_rejects_invalid() {
        let device = stm32();
        let mut session = session_with(&device);
        session.open(&DeviceDescriptor::new(0x0483, 0x5740)).unwrap();

        let bad = SessionConfig {
            endpoint_out: 0x81,
            ..Default::default()
        };
        assert!(session.configure(bad).is_err());
        assert_eq!(session.config().endpoint_out, 0x01);
        assert_eq!(session.state(), ConnectionState::Open);
    }

    #[test]
    fn test_state_events() {
        let device = stm32();
        let observer = Arc::new(RecordingObserver::new());
        let mut session = session_with(&device).with_observer(observer.clone());

        session.open(&DeviceDescriptor::new(0x0483, 0x5740)).unwrap();
        session.close();

        let transitions: Vec<_> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                ConnectionState::Opening,
                ConnectionState::Open,
                ConnectionState::Closed
            ]
        );
    }
}
