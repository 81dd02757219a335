//! Device-facing plumbing: the vendor backend contract, session lifecycle,
//! address derivation, and single-flight signing orchestration.

pub mod backend;
pub mod deriver;
pub mod orchestrator;
pub mod session;

pub use backend::{
    BackendTxRequest, DerivedAddress, DeviceSignature, DeviceTransport, NoPairing,
    NullRejectionSink, PairingHooks, RejectionSink, TxEncoding, TypedDataMode, TypedDataRequest,
    VendorBackend,
};
pub use deriver::AddressDeriver;
pub use orchestrator::{SignOperation, SignOrchestrator};
pub use session::{DeviceSession, SessionState};
