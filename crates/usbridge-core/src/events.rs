//! Event system for decoupling session activity from logging.
//!
//! Binding layers can subscribe to session events without hooking into
//! the transfer path.

use std::fmt;
use std::sync::Mutex;

use crate::state::ConnectionState;

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by a session and its policy layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Lifecycle transition.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Interface claimed on a device.
    DeviceOpened { vid: u16, pid: u16 },
    /// Handle released.
    DeviceClosed { vid: u16, pid: u16 },
    /// Bulk transfer completed. Only emitted with `debug_logging`.
    Packet {
        direction: PacketDirection,
        endpoint: u8,
        length: usize,
        data: Vec<u8>,
    },
    /// Reconnect attempt started.
    Reconnecting { attempt: u32, max_retries: u32 },
    /// Reconnect budget exhausted.
    ReconnectFailed { attempts: u32 },
}

/// Observer trait for receiving bridge events.
pub trait BridgeObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &BridgeEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BridgeObserver for NullObserver {
    fn on_event(&self, _event: &BridgeEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BridgeObserver for TracingObserver {
    fn on_event(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State transition");
            }
            BridgeEvent::DeviceOpened { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device opened");
            }
            BridgeEvent::DeviceClosed { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device closed");
            }
            BridgeEvent::Packet {
                direction,
                endpoint,
                length,
                data,
            } => {
                tracing::info!(
                    dir = %direction,
                    endpoint = %format!("0x{:02X}", endpoint),
                    len = length,
                    data = %hex_dump(data),
                    "USB Packet"
                );
            }
            BridgeEvent::Reconnecting {
                attempt,
                max_retries,
            } => {
                tracing::warn!(attempt, max_retries, "Reconnecting");
            }
            BridgeEvent::ReconnectFailed { attempts } => {
                tracing::error!(attempts, "Reconnect failed, giving up");
            }
        }
    }
}

/// Observer that keeps every event, for inspection in tests and bindings.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<BridgeEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl BridgeObserver for RecordingObserver {
    fn on_event(&self, event: &BridgeEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
