//! Session policy: receive buffering with an overflow guard, bounded
//! auto-reconnect, and failure classification.

use std::collections::VecDeque;

use tracing::{info, instrument, warn};

use crate::constants::{DEFAULT_MAX_RETRIES, FLUSH_CHUNK_SIZE, FLUSH_MAX_READS};
use crate::discovery::DeviceDescriptor;
use crate::error::{BridgeError, ErrorCode, Result};
use crate::events::BridgeEvent;
use crate::session::Session;
use crate::transport::TransportError;

/// Coarse classification of a failure, for callers deciding what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Timeout,
    Disconnected,
    BufferOverflow,
    InvalidState,
}

impl FailureClass {
    pub fn of(err: &BridgeError) -> Self {
        match err {
            BridgeError::Transfer {
                source: TransportError::Disconnected,
                ..
            }
            | BridgeError::DeviceNotFound { .. }
            | BridgeError::OpenFailed { .. } => FailureClass::Disconnected,
            BridgeError::Transfer { .. } | BridgeError::ShortTransfer { .. } => {
                FailureClass::Timeout
            }
            BridgeError::BufferOverflow { .. } => FailureClass::BufferOverflow,
            _ => FailureClass::InvalidState,
        }
    }
}

/// Bytes received ahead of a reader, bounded by the session's `buffer_size`.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    data: VecDeque<u8>,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn available(&self, capacity: usize) -> usize {
        capacity.saturating_sub(self.data.len())
    }

    /// Append all of `bytes` or nothing.
    pub fn append(&mut self, bytes: &[u8], capacity: usize) -> Result<()> {
        let available = self.available(capacity);
        if bytes.len() > available {
            return Err(BridgeError::BufferOverflow {
                requested: bytes.len(),
                available,
            });
        }
        self.data.extend(bytes);
        Ok(())
    }

    /// Remove and return up to `max` bytes, oldest first.
    pub fn take(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.data.len());
        self.data.drain(..n).collect()
    }
}

/// Resilience layer wrapped around a single session.
pub struct SessionPolicy {
    session: Session,
    buffer: ReceiveBuffer,
    /// Consecutive reconnect attempts since the last successful transfer.
    reconnect_attempts: u32,
    max_retries: u32,
}

impl SessionPolicy {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            buffer: ReceiveBuffer::new(),
            reconnect_attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Room left in the buffer under the current config.
    pub fn available(&self) -> usize {
        self.buffer.available(self.capacity())
    }

    fn capacity(&self) -> usize {
        self.session.config().buffer_size as usize
    }

    pub fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<()> {
        self.session.open(descriptor)?;
        self.buffer.clear();
        self.reconnect_attempts = 0;
        Ok(())
    }

    pub fn close(&mut self) {
        self.session.close();
        self.buffer.clear();
        self.reconnect_attempts = 0;
    }

    /// Send through the session. A failed write may already be partly on
    /// the wire, so it is never repeated: the session is reconnected and
    /// the original error returned.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.with_recovery(false, |session| session.send(data))
    }

    /// Receive through the session, retrying after each successful
    /// reconnect.
    pub fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        self.with_recovery(true, |session| session.receive(max_bytes))
    }

    /// Receive up to `max_bytes` into the buffer. Fails with
    /// `BufferOverflow`, before any transfer, if they might not fit.
    pub fn fill(&mut self, max_bytes: usize) -> Result<usize> {
        let available = self.available();
        if max_bytes > available {
            return Err(self.session.fail(BridgeError::BufferOverflow {
                requested: max_bytes,
                available,
            }));
        }

        let data = self.receive(max_bytes)?;
        let capacity = self.capacity();
        if let Err(err) = self.buffer.append(&data, capacity) {
            return Err(self.session.fail(err));
        }
        Ok(data.len())
    }

    /// Drain up to `max` buffered bytes.
    pub fn take(&mut self, max: usize) -> Vec<u8> {
        self.buffer.take(max)
    }

    /// Serve buffered bytes first, otherwise fill the buffer and drain it.
    pub fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        if self.buffer.is_empty() {
            self.fill(max_bytes)?;
        }
        Ok(self.buffer.take(max_bytes))
    }

    /// Zero-length liveness check. Buffered data is left alone.
    pub fn ping(&mut self) -> bool {
        let alive = self.session.ping();
        if alive {
            self.reconnect_attempts = 0;
        }
        alive
    }

    /// Ping, and reconnect if the ping times out and auto-reconnect is on.
    pub fn verify_connection(&mut self) -> Result<()> {
        // A zero-length packet carries no data, so retrying it is safe.
        self.with_recovery(true, |session| session.send(&[])).map(|_| ())
    }

    /// Discard everything pending on the IN endpoint and in the buffer.
    /// Returns the number of bytes dropped from the endpoint.
    #[instrument(skip(self))]
    pub fn flush(&mut self) -> usize {
        self.buffer.clear();
        if !self.session.state().is_open() {
            return 0;
        }

        // The terminating timeout is expected and not worth recording.
        let drained = self.session.preserve_last_error(|session| {
            let mut drained = 0;
            for _ in 0..FLUSH_MAX_READS {
                match session.receive(FLUSH_CHUNK_SIZE) {
                    Ok(data) if data.is_empty() => break,
                    Ok(data) => drained += data.len(),
                    Err(_) => break,
                }
            }
            drained
        });
        info!(drained, "Flushed IN endpoint");
        drained
    }

    /// Close and reopen with the last known descriptor until it succeeds or
    /// the retry budget runs out. Exhausting the budget leaves the session
    /// in `Error`.
    #[instrument(skip(self))]
    pub fn reconnect(&mut self) -> bool {
        let Some(descriptor) = self.session.descriptor().cloned() else {
            return false;
        };

        while self.reconnect_attempts < self.max_retries {
            self.reconnect_attempts += 1;
            self.session.emit(BridgeEvent::Reconnecting {
                attempt: self.reconnect_attempts,
                max_retries: self.max_retries,
            });

            self.session.close();
            match self.session.open(&descriptor) {
                Ok(()) => {
                    info!(attempt = self.reconnect_attempts, "Reconnected");
                    return true;
                }
                Err(err) => warn!(attempt = self.reconnect_attempts, error = %err, "Reconnect failed"),
            }
        }

        self.session.emit(BridgeEvent::ReconnectFailed {
            attempts: self.reconnect_attempts,
        });
        self.session.enter_error(ErrorCode::Timeout);
        false
    }

    fn should_reconnect(&self, err: &BridgeError) -> bool {
        self.session.config().auto_reconnect
            && err.code() == ErrorCode::Timeout
            && self.session.state().is_open()
    }

    /// Run `op`, reconnecting after a timeout. With `retry`, `op` runs
    /// again after each successful reconnect until it succeeds or the
    /// retry budget is spent. Without it, the first error is returned once
    /// the session has been reconnected.
    fn with_recovery<T>(
        &mut self,
        retry: bool,
        mut op: impl FnMut(&mut Session) -> Result<T>,
    ) -> Result<T> {
        loop {
            let err = match op(&mut self.session) {
                Ok(value) => {
                    self.reconnect_attempts = 0;
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.should_reconnect(&err) || !self.reconnect() || !retry {
                return Err(err);
            }
        }
    }
}
