//! Connection lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No device held. Initial state.
    #[default]
    Closed,
    /// Searching for and claiming the device.
    Opening,
    /// Interface claimed, transfers allowed.
    Open,
    /// Open failed or reconnection gave up. Requires `close`.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "CLOSED"),
            ConnectionState::Opening => write!(f, "OPENING"),
            ConnectionState::Open => write!(f, "OPEN"),
            ConnectionState::Error => write!(f, "ERROR"),
        }
    }
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Whether `open` may be attempted from this state.
    pub fn can_open(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}
