//! Vendor backend contract.
//!
//! Each physical device family (USB/HID signer, Bluetooth-bridge signer)
//! plugs in behind [`VendorBackend`]. The keyring treats the wire protocol
//! as opaque: backends declare which request encoding they consume and
//! return either split signature parts or one opaque signed blob.

use async_trait::async_trait;
use ethers::types::{Bytes, H256};

use crate::core::errors::KeyringError;

/// How a backend family reaches the host machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTransport {
    UsbHid,
    BluetoothBridge,
}

/// Unsigned-transaction encoding a backend expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEncoding {
    /// The raw unsigned RLP, big-endian byte buffers throughout; the device
    /// parses the transaction itself.
    UnsignedRlp,
    /// Structured fields as 0x-prefixed hex quantities.
    HexFields,
}

/// How much of a typed-data structure the device can display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedDataMode {
    /// The device parses and displays the full structure.
    FullStruct,
    /// Reduced-trust display: the device only ever sees the precomputed
    /// domain and struct hashes.
    HashesOnly,
}

/// Address material returned by a backend for one derivation path.
#[derive(Debug, Clone)]
pub struct DerivedAddress {
    pub address: String,
    /// Compressed SEC1 public key, hex.
    pub public_key: String,
    /// BIP32 chain code, hex. Backends that supply it enable local
    /// derivation of non-hardened children during discovery.
    pub chain_code: Option<String>,
}

/// Unsigned transaction in the encoding the backend declared.
#[derive(Debug, Clone)]
pub enum BackendTxRequest {
    UnsignedRlp {
        raw: Bytes,
        chain_id: u64,
    },
    HexFields {
        to: Option<String>,
        value: String,
        data: String,
        nonce: String,
        gas_limit: String,
        gas_price: Option<String>,
        max_fee_per_gas: Option<String>,
        max_priority_fee_per_gas: Option<String>,
        chain_id: u64,
    },
}

/// Typed-data request in the mode the backend declared.
#[derive(Debug, Clone)]
pub enum TypedDataRequest {
    FullStruct { payload: serde_json::Value },
    Hashes { domain_separator: H256, struct_hash: H256 },
}

/// Signature material as returned by a device.
#[derive(Debug, Clone)]
pub enum DeviceSignature {
    Parts { v: u64, r: [u8; 32], s: [u8; 32] },
    /// A finalized signed transaction blob; `v`/`r`/`s` sit at fixed RLP
    /// element offsets that differ between legacy and fee-market shapes.
    SignedBlob(Bytes),
}

/// Out-of-band pairing interaction, fulfilled by the calling layer.
/// The keyring never renders UI.
#[async_trait]
pub trait PairingHooks: Send + Sync {
    /// Ask the user for the pairing code shown on the device.
    async fn pairing_code(&self, device: &str) -> Result<String, KeyringError> {
        Err(KeyringError::Unexpected(format!(
            "{}: pairing code requested but no pairing hook is installed",
            device
        )))
    }

    /// Wait for a physical confirmation on the device.
    async fn confirm_pairing(&self, _device: &str) -> Result<(), KeyringError> {
        Ok(())
    }
}

/// Hooks for embedders whose devices never pair interactively.
#[derive(Debug, Default)]
pub struct NoPairing;

impl PairingHooks for NoPairing {}

/// Receiver for structured rejection notifications, injected by the caller
/// so it can dismiss whatever prompt it had open.
pub trait RejectionSink: Send + Sync {
    fn signing_rejected(&self, address: &str, reason: &str);
}

/// Sink that drops notifications; useful in tests and headless embedders.
#[derive(Debug, Default)]
pub struct NullRejectionSink;

impl RejectionSink for NullRejectionSink {
    fn signing_rejected(&self, _address: &str, _reason: &str) {}
}

/// Capability object for one vendor device family.
#[async_trait]
pub trait VendorBackend: Send + Sync {
    /// Stable backend name used in logs, errors, and per-device state.
    fn name(&self) -> &str;

    fn transport(&self) -> DeviceTransport;

    fn tx_encoding(&self) -> TxEncoding;

    fn typed_data_mode(&self) -> TypedDataMode;

    /// Establish the transport. Must surface `TransportAlreadyOpen` when the
    /// handle is already established; the session treats that as success.
    async fn connect(&self, pairing: &dyn PairingHooks) -> Result<(), KeyringError>;

    /// Derive the address and public key at `path`. `display` forces the
    /// device to show the address for on-device confirmation.
    async fn get_address(&self, path: &str, display: bool)
        -> Result<DerivedAddress, KeyringError>;

    async fn sign_transaction(
        &self,
        path: &str,
        request: &BackendTxRequest,
    ) -> Result<DeviceSignature, KeyringError>;

    async fn sign_personal_message(
        &self,
        path: &str,
        message: &[u8],
    ) -> Result<DeviceSignature, KeyringError>;

    async fn sign_typed_data(
        &self,
        path: &str,
        request: &TypedDataRequest,
    ) -> Result<DeviceSignature, KeyringError>;

    /// Release the exclusive transport handle. Idempotent.
    async fn close(&self) -> Result<(), KeyringError>;
}
