//! Transfer engine: single, timeout-bounded bulk transfers on an open session.
//!
//! A failed transfer is recorded in `last_error` but leaves the session
//! `Open`. Retrying and reconnecting is the policy layer's business.

use tracing::{debug, instrument};

use crate::constants::PACKET_PREVIEW_LEN;
use crate::error::{BridgeError, Result};
use crate::events::{BridgeEvent, PacketDirection};
use crate::session::Session;

impl Session {
    /// Send `data` in one bulk OUT transfer. Anything short of the full
    /// length is a failure.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        let endpoint = self.config().endpoint_out;
        let timeout = self.config().timeout();

        let result = match self.transfer_handle() {
            Ok(handle) => handle.bulk_out(endpoint, data, timeout),
            Err(err) => return Err(self.fail(err)),
        };

        match result {
            Ok(n) if n == data.len() => {
                self.trace_packet(PacketDirection::Tx, endpoint, data);
                Ok(n)
            }
            Ok(n) => Err(self.fail(BridgeError::ShortTransfer {
                endpoint,
                transferred: n,
                expected: data.len(),
            })),
            Err(source) => {
                debug!(error = %source, "Bulk OUT failed");
                Err(self.fail(BridgeError::Transfer { endpoint, source }))
            }
        }
    }

    /// Receive up to `max_bytes` in one bulk IN transfer. Returns exactly
    /// what arrived, which may be nothing.
    #[instrument(skip(self))]
    pub fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let endpoint = self.config().endpoint_in;
        let timeout = self.config().timeout();

        let result = match self.transfer_handle() {
            Ok(_) if max_bytes == 0 => return Ok(Vec::new()),
            Ok(handle) => handle.bulk_in(endpoint, max_bytes, timeout),
            Err(err) => return Err(self.fail(err)),
        };

        match result {
            Ok(data) => {
                self.trace_packet(PacketDirection::Rx, endpoint, &data);
                Ok(data)
            }
            Err(source) => {
                debug!(error = %source, "Bulk IN failed");
                Err(self.fail(BridgeError::Transfer { endpoint, source }))
            }
        }
    }

    /// Zero-length OUT transfer as a liveness check.
    pub fn ping(&mut self) -> bool {
        self.send(&[]).is_ok()
    }

    fn trace_packet(&self, direction: PacketDirection, endpoint: u8, data: &[u8]) {
        if !self.config().debug_logging {
            return;
        }
        self.emit(BridgeEvent::Packet {
            direction,
            endpoint,
            length: data.len(),
            data: data.iter().take(PACKET_PREVIEW_LEN).copied().collect(),
        });
    }
}
