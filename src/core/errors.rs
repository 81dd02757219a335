use thiserror::Error;

/// Error type shared by every keyring operation.
///
/// Diagnostics carry address/path/backend context. No variant ever carries
/// seed or key material.
#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("address not found in keyring: {0}")]
    AddressNotFound(String),

    #[error("no derivation index found for address {0}")]
    IndexNotFound(String),

    #[error("invalid derivation path: {0}")]
    InvalidDerivationPath(String),

    #[error("invalid transaction payload: {0}")]
    InvalidTransaction(String),

    #[error("unsupported typed data version: {0}")]
    UnsupportedTypedDataVersion(String),

    #[error("signature was produced by {recovered}, expected {expected}")]
    SignatureAddressMismatch { expected: String, recovered: String },

    #[error("user rejected the request on the device: {0}")]
    UserRejected(String),

    #[error("device timed out: {0}")]
    DeviceTimeout(String),

    #[error("device disconnected: {0}")]
    DeviceDisconnected(String),

    #[error("device unreachable after {attempts} attempts: {last}")]
    DeviceUnreachable { attempts: u32, last: String },

    /// Raised by a backend whose transport is already open. The session
    /// layer maps this to success; it never escapes a keyring operation.
    #[error("device transport is already open")]
    TransportAlreadyOpen,

    #[error("unexpected keyring error: {0}")]
    Unexpected(String),
}

impl KeyringError {
    /// Wrap a backend/vendor error with operation context.
    pub fn unexpected(context: &str, err: impl std::fmt::Display) -> Self {
        KeyringError::Unexpected(format!("{}: {}", context, err))
    }

    /// Transient transport failures the discovery path may retry once.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KeyringError::DeviceDisconnected(_) | KeyringError::DeviceTimeout(_)
        )
    }

    /// Failures that must reach the caller unchanged. Retrying any of these
    /// requires an explicit caller action, never an implicit loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            KeyringError::SignatureAddressMismatch { .. }
                | KeyringError::UnsupportedTypedDataVersion(_)
                | KeyringError::UserRejected(_)
                | KeyringError::DeviceUnreachable { .. }
        )
    }
}
