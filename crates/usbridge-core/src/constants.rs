//! Device identification and session limits.

// ============================================================================
// Device Identification
// ============================================================================

/// FTDI (UART bridge) Vendor ID
pub const FTDI_VENDOR_ID: u16 = 0x0403;

/// STMicroelectronics (STM32 virtual COM) Vendor ID
pub const STM32_VENDOR_ID: u16 = 0x0483;

/// Vendors reported by discovery when no filter is configured.
pub const DEFAULT_VENDOR_IDS: &[u16] = &[FTDI_VENDOR_ID, STM32_VENDOR_ID];

/// Interface claimed on open.
pub const PRIMARY_INTERFACE: u8 = 0;

/// Direction bit of an endpoint address (set = IN).
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// USB-IF language id for English (United States).
pub const LANGUAGE_ID_US_ENGLISH: u16 = 0x0409;

// ============================================================================
// Session Defaults
// ============================================================================

pub const DEFAULT_TIMEOUT_MS: u32 = 1000;
pub const DEFAULT_BUFFER_SIZE: u32 = 4096;
pub const DEFAULT_ENDPOINT_IN: u8 = 0x81;
pub const DEFAULT_ENDPOINT_OUT: u8 = 0x01;

/// Consecutive reconnect attempts before a failure is surfaced.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Timeout for string descriptor reads during discovery.
pub const DISCOVERY_TIMEOUT_MS: u32 = 1000;

// ============================================================================
// Command Limits
// ============================================================================

/// Default `read` size when no count is given.
pub const DEFAULT_READ_SIZE: usize = 64;

/// Largest `read` request accepted.
pub const MAX_READ_SIZE: usize = 65536;

/// Default `list` result cap.
pub const DEFAULT_LIST_RESULTS: usize = 16;

/// Chunk size used while draining the IN endpoint.
pub const FLUSH_CHUNK_SIZE: usize = 64;

/// Upper bound on reads performed by a single flush.
pub const FLUSH_MAX_READS: usize = 1024;

/// Bytes of payload captured in packet events.
pub const PACKET_PREVIEW_LEN: usize = 32;
