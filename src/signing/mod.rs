//! Payload normalization and signature reassembly.

pub mod transaction;
pub mod typed_data;

use ethers::types::{Bytes, Signature, H256};

/// A finalized signed transaction, reassembled from device output.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    /// RLP encoding ready for broadcast.
    pub raw: Bytes,
    /// keccak256 of `raw`.
    pub tx_hash: H256,
    pub signature: Signature,
    /// Checksum-cased address recovered from the signature. Always equal to
    /// the requested signer; a mismatch aborts the pipeline instead.
    pub signer: String,
}

/// A finalized message or typed-data signature.
#[derive(Debug, Clone)]
pub struct SignedMessage {
    /// 65-byte r||s||v signature, 0x-prefixed hex.
    pub signature: String,
    /// Checksum-cased address recovered from the signature.
    pub signer: String,
}

/// Outcome of one signing operation, as held by the orchestrator.
#[derive(Debug, Clone)]
pub enum SignResult {
    Transaction(SignedTransaction),
    Message(SignedMessage),
}
