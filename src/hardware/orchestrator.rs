//! Single-flight signing orchestration.
//!
//! The device and its confirmation screen can host exactly one pending
//! request, so every signing operation funnels through one fair async lock:
//! operations complete in the order they were accepted, and two invokes
//! never reach the transport concurrently. Pending state lives on the
//! orchestrator instance; two keyring instances never share retry state.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::errors::KeyringError;
use crate::hardware::backend::RejectionSink;
use crate::signing::SignResult;

pub type SignFuture = BoxFuture<'static, Result<SignResult, KeyringError>>;

/// A re-invokable signing operation: session open, device call, teardown,
/// reassembly and signer verification included, so `resend` replays the
/// whole exchange.
pub type SignOperation = Arc<dyn Fn() -> SignFuture + Send + Sync>;

struct PendingSign {
    address: String,
    op: SignOperation,
}

pub struct SignOrchestrator {
    /// Fair FIFO gate; the sole serialization mechanism for device access.
    flight: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingSign>>,
    sink: Arc<dyn RejectionSink>,
}

impl SignOrchestrator {
    pub fn new(sink: Arc<dyn RejectionSink>) -> Self {
        Self {
            flight: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            sink,
        }
    }

    /// Run one signing operation. Concurrent callers queue behind the
    /// in-flight one and run in acceptance order.
    pub async fn invoke(
        &self,
        address: &str,
        op: SignOperation,
    ) -> Result<SignResult, KeyringError> {
        let _flight = self.flight.lock().await;
        *self.pending.lock() = Some(PendingSign {
            address: address.to_string(),
            op: op.clone(),
        });
        let result = op().await;
        self.settle(address, &result);
        result
    }

    /// Re-issue the last pending operation, for callers whose prompt was
    /// dismissed before the device answered. Serialized behind any
    /// in-flight operation like a fresh invoke.
    pub async fn resend(&self) -> Result<SignResult, KeyringError> {
        let (address, op) = {
            let pending = self.pending.lock();
            match pending.as_ref() {
                Some(p) => (p.address.clone(), p.op.clone()),
                None => {
                    return Err(KeyringError::Unexpected(
                        "no pending signing operation to resend".to_string(),
                    ))
                }
            }
        };
        debug!(address = %address, "resending pending signing operation");
        let _flight = self.flight.lock().await;
        let result = op().await;
        self.settle(&address, &result);
        result
    }

    /// Discard pending-retry state. The only cancellation primitive: an
    /// operation already dispatched to the transport keeps running on the
    /// hardware, this merely suppresses any further reaction to it.
    pub fn reset_resend(&self) {
        if self.pending.lock().take().is_some() {
            debug!("pending signing operation discarded");
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    fn settle(&self, address: &str, result: &Result<SignResult, KeyringError>) {
        match result {
            Ok(_) => {
                self.pending.lock().take();
            }
            Err(KeyringError::UserRejected(reason)) => {
                warn!(address = %address, reason = %reason, "signing rejected on device");
                self.sink.signing_rejected(address, reason);
                self.pending.lock().take();
            }
            Err(err) if err.is_transient() => {
                // Transient device failures keep the pending operation so
                // the caller may resend().
                debug!(address = %address, error = %err, "signing failed, pending retained");
            }
            Err(err) => {
                debug!(address = %address, error = %err, "signing failed");
                self.pending.lock().take();
            }
        }
    }
}
