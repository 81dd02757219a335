//! Device session lifecycle.
//!
//! `Disconnected → Connecting → Ready → Busy → Disconnected`. The session
//! owns the exclusive transport handle between `open()` and `close()`;
//! every operation that opens it must close it on every exit path.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::errors::KeyringError;
use crate::hardware::backend::{PairingHooks, VendorBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Busy,
}

pub struct DeviceSession {
    backend: Arc<dyn VendorBackend>,
    pairing: Arc<dyn PairingHooks>,
    state: Mutex<SessionState>,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
}

impl DeviceSession {
    pub fn new(
        backend: Arc<dyn VendorBackend>,
        pairing: Arc<dyn PairingHooks>,
        reconnect_attempts: u32,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            backend,
            pairing,
            state: Mutex::new(SessionState::Disconnected),
            reconnect_attempts: reconnect_attempts.max(1),
            reconnect_delay,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Establish the backend transport. A `TransportAlreadyOpen` condition
    /// from the backend is idempotent success, not an error. Pairing
    /// interaction is delegated to the injected hooks.
    pub async fn open(&self) -> Result<(), KeyringError> {
        *self.state.lock() = SessionState::Connecting;
        match self.backend.connect(self.pairing.as_ref()).await {
            Ok(()) => {
                debug!(backend = self.backend.name(), "device session ready");
                *self.state.lock() = SessionState::Ready;
                Ok(())
            }
            Err(KeyringError::TransportAlreadyOpen) => {
                debug!(
                    backend = self.backend.name(),
                    "transport already open, reusing"
                );
                *self.state.lock() = SessionState::Ready;
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = SessionState::Disconnected;
                Err(err)
            }
        }
    }

    /// Fixed number of reconnect attempts with a fixed delay between them,
    /// so "try again after N seconds, M times" stays predictable. Exhausting
    /// the attempts is fatal: `DeviceUnreachable` is never auto-retried.
    pub async fn reconnect(&self) -> Result<(), KeyringError> {
        let mut last = String::from("no attempt made");
        for attempt in 1..=self.reconnect_attempts {
            match self.open().await {
                Ok(()) => {
                    info!(
                        backend = self.backend.name(),
                        attempt, "device reconnected"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        backend = self.backend.name(),
                        attempt,
                        max_attempts = self.reconnect_attempts,
                        error = %err,
                        "reconnect attempt failed"
                    );
                    last = err.to_string();
                }
            }
            if attempt < self.reconnect_attempts {
                tokio::time::sleep(self.reconnect_delay).await;
            }
        }
        Err(KeyringError::DeviceUnreachable {
            attempts: self.reconnect_attempts,
            last,
        })
    }

    /// Mark the exclusive signing window. Only one signing operation is ever
    /// in flight (the orchestrator serializes), so this is bookkeeping for
    /// status reporting, not a lock.
    pub fn begin_signing(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Ready {
            *state = SessionState::Busy;
        }
    }

    pub fn end_signing(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Busy {
            *state = SessionState::Ready;
        }
    }

    /// Release the transport. Runs on every exit path of every operation
    /// that opened the session; close failures are logged, never surfaced,
    /// so they cannot mask the operation's own result.
    pub async fn close(&self) {
        if let Err(err) = self.backend.close().await {
            debug!(
                backend = self.backend.name(),
                error = %err,
                "ignoring close failure"
            );
        }
        *self.state.lock() = SessionState::Disconnected;
    }
}
