//! Hardware-wallet keyring core.
//!
//! One contract for enumerating accounts on, and requesting signatures
//! from, physically distinct signing devices (USB/HID and Bluetooth-bridge
//! hardware signers) without the rest of a wallet knowing which device
//! family is in use. Vendor SDKs plug in behind [`VendorBackend`]; the
//! keyring owns derivation-path conventions, the address↔path↔device
//! mapping, single-flight device access, and mandatory verification that a
//! returned signature belongs to the address that was asked for.

pub mod config;
pub mod core;
pub mod hardware;
pub mod keyring;
pub mod signing;

pub use config::KeyringConfig;
pub use core::account::{Account, AccountIndex, KeyringState};
pub use core::errors::KeyringError;
pub use core::paths::{HdPathType, MAX_INDEX};
pub use hardware::backend::{
    BackendTxRequest, DerivedAddress, DeviceSignature, DeviceTransport, NoPairing,
    NullRejectionSink, PairingHooks, RejectionSink, TxEncoding, TypedDataMode, TypedDataRequest,
    VendorBackend,
};
pub use hardware::session::SessionState;
pub use keyring::KeyringCore;
pub use signing::transaction::UnsignedTransaction;
pub use signing::{SignResult, SignedMessage, SignedTransaction};
