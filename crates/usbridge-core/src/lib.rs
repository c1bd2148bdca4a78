//! usbridge-core: USB serial-bridge session manager.
//!
//! Discovers USB serial bridges by vendor, drives a single device session
//! through its connection lifecycle, and performs timeout-bounded bulk
//! transfers with buffering and bounded auto-reconnect on top.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: USB access abstraction (nusb, mock)
//! - **Discovery**: Vendor-filtered enumeration
//! - **Session**: Connection state machine owning the device handle
//! - **Transfer**: Bulk send/receive on an open session
//! - **Policy**: Receive buffer and auto-reconnect
//! - **Command**: Symbolic dispatch for binding layers
//! - **Events**: Observer pattern for logging decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use usbridge_core::{BridgeConfig, CommandArg, CommandDispatcher, NusbBackend};
//!
//! let mut bridge = CommandDispatcher::new(Arc::new(NusbBackend::new()), &BridgeConfig::default());
//! bridge
//!     .execute_named("open", &[CommandArg::from(0x0483u32), CommandArg::from(0x5740u32)])
//!     .expect("open failed");
//! let written = bridge.execute_named("write", &[CommandArg::from("AT\r")]);
//! ```

pub mod command;
pub mod config;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod events;
pub mod policy;
pub mod session;
pub mod state;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use command::{Command, CommandArg, CommandDispatcher, CommandOutput};
pub use config::{BridgeConfig, ConfigField, SessionConfig};
pub use discovery::{DeviceDescriptor, Discovery, VendorFilter};
pub use error::{BridgeError, ErrorCode, Result};
pub use events::{BridgeEvent, BridgeObserver, NullObserver, RecordingObserver, TracingObserver};
pub use policy::{FailureClass, ReceiveBuffer, SessionPolicy};
pub use session::Session;
pub use state::ConnectionState;
pub use transport::{MockBackend, MockDevice, NusbBackend, TransportError, UsbBackend};
