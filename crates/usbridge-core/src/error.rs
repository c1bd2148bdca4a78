//! Error taxonomy shared by the session, policy and command layers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::ConnectionState;
use crate::transport::TransportError;

/// Caller-visible error code, stored on a session as `last_error`.
#[derive(Error, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[default]
    #[error("success")]
    Success,

    #[error("no matching or open device")]
    NotFound,

    #[error("access denied")]
    Access,

    #[error("resource busy")]
    Busy,

    #[error("transfer timed out")]
    Timeout,

    #[error("invalid configuration")]
    InvalidConfig,
}

impl ErrorCode {
    /// Stable numeric value handed to binding layers.
    pub const fn as_raw(self) -> i32 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::NotFound => -1,
            ErrorCode::Access => -2,
            ErrorCode::Busy => -3,
            ErrorCode::Timeout => -4,
            ErrorCode::InvalidConfig => -5,
        }
    }

    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(ErrorCode::Success),
            -1 => Some(ErrorCode::NotFound),
            -2 => Some(ErrorCode::Access),
            -3 => Some(ErrorCode::Busy),
            -4 => Some(ErrorCode::Timeout),
            -5 => Some(ErrorCode::InvalidConfig),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

/// Error returned by session, policy and dispatcher operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("no open session (state: {state})")]
    NotOpen { state: ConnectionState },

    #[error("device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("failed to open device VID={vid:04X} PID={pid:04X}: {source}")]
    OpenFailed {
        vid: u16,
        pid: u16,
        #[source]
        source: TransportError,
    },

    #[error("session already open")]
    AlreadyOpen,

    #[error("operation not allowed in {state} state")]
    InvalidState { state: ConnectionState },

    #[error("bulk transfer on endpoint 0x{endpoint:02X} failed: {source}")]
    Transfer {
        endpoint: u8,
        #[source]
        source: TransportError,
    },

    #[error("short transfer on endpoint 0x{endpoint:02X}: {transferred} of {expected} bytes")]
    ShortTransfer {
        endpoint: u8,
        transferred: usize,
        expected: usize,
    },

    #[error("receive buffer overflow: {requested} bytes requested, {available} available")]
    BufferOverflow { requested: usize, available: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown configuration field: {0}")]
    UnknownField(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

impl BridgeError {
    /// Map to the coarse taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::NotOpen { .. }
            | BridgeError::DeviceNotFound { .. }
            | BridgeError::OpenFailed { .. } => ErrorCode::NotFound,
            BridgeError::AlreadyOpen => ErrorCode::Busy,
            BridgeError::Transfer { .. } | BridgeError::ShortTransfer { .. } => ErrorCode::Timeout,
            BridgeError::InvalidState { .. }
            | BridgeError::BufferOverflow { .. }
            | BridgeError::InvalidConfig(_)
            | BridgeError::UnknownField(_)
            | BridgeError::InvalidArgument(_)
            | BridgeError::UnknownCommand(_) => ErrorCode::InvalidConfig,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_codes_round_trip() {
        for code in [
            ErrorCode::Success,
            ErrorCode::NotFound,
            ErrorCode::Access,
            ErrorCode::Busy,
            ErrorCode::Timeout,
            ErrorCode::InvalidConfig,
        ] {
            assert_eq!(ErrorCode::from_raw(code.as_raw()), Some(code));
        }
        assert_eq!(ErrorCode::from_raw(-6), None);
    }

    #[test]
    fn test_short_transfer_shares_timeout_code() {
        let short = BridgeError::ShortTransfer {
            endpoint: 0x01,
            transferred: 2,
            expected: 4,
        };
        let failed = BridgeError::Transfer {
            endpoint: 0x01,
            source: TransportError::Timeout { timeout_ms: 1000 },
        };
        assert_eq!(short.code(), ErrorCode::Timeout);
        assert_eq!(failed.code(), ErrorCode::Timeout);
        assert!(short.to_string().contains("2 of 4"));
    }

    #[test]
    fn test_overflow_is_not_a_timeout() {
        let err = BridgeError::BufferOverflow {
            requested: 10,
            available: 4,
        };
        assert_ne!(err.code(), ErrorCode::Timeout);
    }

    #[test]
    fn test_state_errors() {
        let err = BridgeError::NotOpen {
            state: ConnectionState::Error,
        };
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.to_string(), "no open session (state: ERROR)");
        assert_eq!(BridgeError::AlreadyOpen.code(), ErrorCode::Busy);
    }
}
