//! Unsigned-transaction normalization and signature reassembly.
//!
//! Inbound payloads carry either a legacy gas price or EIP-1559 fee-market
//! fields; the shape is selected by which fee fields are present. The
//! normalized transaction is rendered once as an ethers `TypedTransaction`
//! (sighash + final RLP) and once in whichever request encoding the backend
//! declared.

use std::str::FromStr;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, Eip1559TransactionRequest, NameOrAddress, Signature, TransactionRequest,
    H256, U256, U64,
};
use ethers::utils::keccak256;
use ethers::utils::rlp::Rlp;
use serde::{Deserialize, Serialize};

use crate::core::errors::KeyringError;
use crate::hardware::backend::{BackendTxRequest, DeviceSignature, TxEncoding};

/// Generic unsigned transaction accepted from the application layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransaction {
    /// Recipient; `None` deploys a contract.
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub data: Option<Bytes>,
    pub nonce: U256,
    pub gas_limit: U256,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<U256>,
    pub chain_id: u64,
}

impl UnsignedTransaction {
    /// Fee-market shape wins whenever its fields are present.
    pub fn is_fee_market(&self) -> bool {
        self.max_fee_per_gas.is_some()
    }
}

/// Normalize into the typed transaction used for sighash and final RLP.
pub fn to_typed_transaction(tx: &UnsignedTransaction) -> Result<TypedTransaction, KeyringError> {
    let to = tx
        .to
        .as_deref()
        .map(parse_recipient)
        .transpose()?
        .map(NameOrAddress::Address);

    if tx.max_priority_fee_per_gas.is_some() && tx.max_fee_per_gas.is_none() {
        return Err(KeyringError::InvalidTransaction(
            "maxPriorityFeePerGas given without maxFeePerGas".to_string(),
        ));
    }

    if tx.is_fee_market() {
        let request = Eip1559TransactionRequest {
            to,
            gas: Some(tx.gas_limit),
            value: tx.value,
            data: tx.data.clone(),
            nonce: Some(tx.nonce),
            max_fee_per_gas: tx.max_fee_per_gas,
            max_priority_fee_per_gas: Some(tx.max_priority_fee_per_gas.unwrap_or_default()),
            chain_id: Some(U64::from(tx.chain_id)),
            ..Default::default()
        };
        Ok(TypedTransaction::Eip1559(request))
    } else if tx.gas_price.is_some() {
        let request = TransactionRequest {
            to,
            gas: Some(tx.gas_limit),
            gas_price: tx.gas_price,
            value: tx.value,
            data: tx.data.clone(),
            nonce: Some(tx.nonce),
            chain_id: Some(U64::from(tx.chain_id)),
            ..Default::default()
        };
        Ok(TypedTransaction::Legacy(request))
    } else {
        Err(KeyringError::InvalidTransaction(
            "transaction carries neither gasPrice nor maxFeePerGas".to_string(),
        ))
    }
}

/// Render the normalized transaction in the backend's declared encoding.
pub fn encode_for_backend(
    tx: &UnsignedTransaction,
    typed: &TypedTransaction,
    encoding: TxEncoding,
) -> BackendTxRequest {
    match encoding {
        TxEncoding::UnsignedRlp => BackendTxRequest::UnsignedRlp {
            raw: typed.rlp(),
            chain_id: tx.chain_id,
        },
        TxEncoding::HexFields => BackendTxRequest::HexFields {
            to: tx.to.clone(),
            value: hex_quantity(tx.value.unwrap_or_default()),
            data: format!(
                "0x{}",
                hex::encode(tx.data.as_ref().map(|d| d.to_vec()).unwrap_or_default())
            ),
            nonce: hex_quantity(tx.nonce),
            gas_limit: hex_quantity(tx.gas_limit),
            gas_price: tx.gas_price.map(hex_quantity),
            max_fee_per_gas: tx.max_fee_per_gas.map(hex_quantity),
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas.map(hex_quantity),
            chain_id: tx.chain_id,
        },
    }
}

/// Minimal 0x-prefixed hex quantity (no leading zeros, `0x0` for zero).
pub fn hex_quantity(value: U256) -> String {
    format!("0x{:x}", value)
}

pub fn signature_from_parts(v: u64, r: &[u8; 32], s: &[u8; 32]) -> Signature {
    Signature {
        r: U256::from_big_endian(r),
        s: U256::from_big_endian(s),
        v,
    }
}

/// Extract `v`/`r`/`s` from an opaque signed transaction blob.
///
/// Element offsets are fixed per shape: 6/7/8 for legacy, 9/10/11 for the
/// fee-market payload behind its `0x02` type byte.
pub fn signature_from_blob(blob: &[u8], fee_market: bool) -> Result<Signature, KeyringError> {
    let malformed =
        |what: &str| KeyringError::Unexpected(format!("malformed signed blob: {}", what));

    let (payload, offset) = if fee_market {
        match blob.split_first() {
            Some((0x02, rest)) => (rest, 9),
            Some((other, _)) => {
                return Err(malformed(&format!("unexpected type byte {:#04x}", other)))
            }
            None => return Err(malformed("empty")),
        }
    } else {
        (blob, 6)
    };

    let rlp = Rlp::new(payload);
    let v: u64 = rlp
        .val_at(offset)
        .map_err(|e| malformed(&format!("v: {}", e)))?;
    let r: Vec<u8> = rlp
        .val_at(offset + 1)
        .map_err(|e| malformed(&format!("r: {}", e)))?;
    let s: Vec<u8> = rlp
        .val_at(offset + 2)
        .map_err(|e| malformed(&format!("s: {}", e)))?;
    if r.len() > 32 || s.len() > 32 {
        return Err(malformed("oversized r/s element"));
    }

    Ok(Signature {
        v,
        r: U256::from_big_endian(&r),
        s: U256::from_big_endian(&s),
    })
}

/// Combine device output with the normalized transaction into broadcastable
/// RLP plus its hash.
pub fn finalize_transaction(
    typed: &TypedTransaction,
    device_sig: &DeviceSignature,
    fee_market: bool,
) -> Result<(Bytes, H256, Signature), KeyringError> {
    let signature = match device_sig {
        DeviceSignature::Parts { v, r, s } => signature_from_parts(*v, r, s),
        DeviceSignature::SignedBlob(blob) => signature_from_blob(blob, fee_market)?,
    };
    let raw = typed.rlp_signed(&signature);
    let tx_hash = H256::from(keccak256(&raw));
    Ok((raw, tx_hash, signature))
}

fn parse_recipient(to: &str) -> Result<Address, KeyringError> {
    Address::from_str(to.trim())
        .map_err(|_| KeyringError::InvalidTransaction(format!("invalid recipient address: {}", to)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_tx() -> UnsignedTransaction {
        UnsignedTransaction {
            to: Some("0x742d35Cc6634C0532925a3b8D400e8B78fFe4860".to_string()),
            value: Some(U256::from(1_000_000_000u64)),
            data: None,
            nonce: U256::from(7u64),
            gas_limit: U256::from(21000u64),
            gas_price: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            chain_id: 1,
        }
    }

    #[test]
    fn test_shape_selection_legacy() {
        let mut tx = base_tx();
        tx.gas_price = Some(U256::from(20_000_000_000u64));
        let typed = to_typed_transaction(&tx).unwrap();
        assert!(matches!(typed, TypedTransaction::Legacy(_)));
    }

    #[test]
    fn test_shape_selection_fee_market() {
        let mut tx = base_tx();
        tx.max_fee_per_gas = Some(U256::from(30_000_000_000u64));
        tx.max_priority_fee_per_gas = Some(U256::from(1_000_000_000u64));
        let typed = to_typed_transaction(&tx).unwrap();
        assert!(matches!(typed, TypedTransaction::Eip1559(_)));
    }

    #[test]
    fn test_fee_market_wins_when_both_present() {
        let mut tx = base_tx();
        tx.gas_price = Some(U256::from(20_000_000_000u64));
        tx.max_fee_per_gas = Some(U256::from(30_000_000_000u64));
        let typed = to_typed_transaction(&tx).unwrap();
        assert!(matches!(typed, TypedTransaction::Eip1559(_)));
    }

    #[test]
    fn test_missing_fee_fields_rejected() {
        let tx = base_tx();
        assert!(matches!(
            to_typed_transaction(&tx),
            Err(KeyringError::InvalidTransaction(_))
        ));

        let mut tx = base_tx();
        tx.max_priority_fee_per_gas = Some(U256::from(1u64));
        assert!(matches!(
            to_typed_transaction(&tx),
            Err(KeyringError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_invalid_recipient_rejected() {
        let mut tx = base_tx();
        tx.gas_price = Some(U256::one());
        tx.to = Some("not-an-address".to_string());
        assert!(matches!(
            to_typed_transaction(&tx),
            Err(KeyringError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_hex_field_encoding() {
        let mut tx = base_tx();
        tx.gas_price = Some(U256::from(20_000_000_000u64));
        tx.value = None;
        let typed = to_typed_transaction(&tx).unwrap();
        match encode_for_backend(&tx, &typed, TxEncoding::HexFields) {
            BackendTxRequest::HexFields {
                value,
                data,
                nonce,
                gas_limit,
                gas_price,
                ..
            } => {
                assert_eq!(value, "0x0");
                assert_eq!(data, "0x");
                assert_eq!(nonce, "0x7");
                assert_eq!(gas_limit, "0x5208");
                assert_eq!(gas_price.as_deref(), Some("0x4a817c800"));
            }
            other => panic!("unexpected encoding: {:?}", other),
        }
    }

    #[test]
    fn test_unsigned_rlp_encoding_shapes() {
        let mut legacy = base_tx();
        legacy.gas_price = Some(U256::one());
        let typed = to_typed_transaction(&legacy).unwrap();
        match encode_for_backend(&legacy, &typed, TxEncoding::UnsignedRlp) {
            BackendTxRequest::UnsignedRlp { raw, chain_id } => {
                assert_eq!(chain_id, 1);
                // Legacy signing payload is a 9-element list (EIP-155 suffix).
                let rlp = Rlp::new(&raw);
                assert_eq!(rlp.item_count().unwrap(), 9);
            }
            other => panic!("unexpected encoding: {:?}", other),
        }

        let mut fee_market = base_tx();
        fee_market.max_fee_per_gas = Some(U256::one());
        let typed = to_typed_transaction(&fee_market).unwrap();
        match encode_for_backend(&fee_market, &typed, TxEncoding::UnsignedRlp) {
            BackendTxRequest::UnsignedRlp { raw, .. } => {
                assert_eq!(raw[0], 0x02, "typed envelope prefix expected");
            }
            other => panic!("unexpected encoding: {:?}", other),
        }
    }

    #[test]
    fn test_blob_extraction_legacy_offsets() {
        let mut tx = base_tx();
        tx.gas_price = Some(U256::from(20_000_000_000u64));
        let typed = to_typed_transaction(&tx).unwrap();

        let signature = signature_from_parts(37, &[0x11u8; 32], &[0x22u8; 32]);
        let blob = typed.rlp_signed(&signature);

        let extracted = signature_from_blob(&blob, false).unwrap();
        assert_eq!(extracted.v, 37);
        assert_eq!(extracted.r, signature.r);
        assert_eq!(extracted.s, signature.s);
    }

    #[test]
    fn test_blob_extraction_fee_market_offsets() {
        let mut tx = base_tx();
        tx.max_fee_per_gas = Some(U256::from(30_000_000_000u64));
        tx.max_priority_fee_per_gas = Some(U256::from(1_000_000_000u64));
        let typed = to_typed_transaction(&tx).unwrap();

        let signature = signature_from_parts(1, &[0x33u8; 32], &[0x44u8; 32]);
        let blob = typed.rlp_signed(&signature);
        assert_eq!(blob[0], 0x02);

        let extracted = signature_from_blob(&blob, true).unwrap();
        assert_eq!(extracted.v, 1);
        assert_eq!(extracted.r, signature.r);
        assert_eq!(extracted.s, signature.s);
    }

    #[test]
    fn test_blob_extraction_pads_short_components() {
        let mut tx = base_tx();
        tx.gas_price = Some(U256::one());
        let typed = to_typed_transaction(&tx).unwrap();

        // RLP trims leading zeros from r/s; extraction must left-pad.
        let signature = Signature {
            v: 38,
            r: U256::from(5u64),
            s: U256::from(260u64),
        };
        let blob = typed.rlp_signed(&signature);
        let extracted = signature_from_blob(&blob, false).unwrap();
        assert_eq!(extracted.r, U256::from(5u64));
        assert_eq!(extracted.s, U256::from(260u64));
    }

    #[test]
    fn test_blob_with_wrong_type_byte_rejected() {
        assert!(signature_from_blob(&[0x01, 0x00], true).is_err());
        assert!(signature_from_blob(&[], true).is_err());
    }

    #[test]
    fn test_serde_camel_case() {
        let json = r#"{
            "to": "0x742d35Cc6634C0532925a3b8D400e8B78fFe4860",
            "value": "0x3b9aca00",
            "nonce": "0x7",
            "gasLimit": "0x5208",
            "maxFeePerGas": "0x6fc23ac00",
            "maxPriorityFeePerGas": "0x3b9aca00",
            "chainId": 5
        }"#;
        let tx: UnsignedTransaction = serde_json::from_str(json).unwrap();
        assert!(tx.is_fee_market());
        assert_eq!(tx.chain_id, 5);
        assert_eq!(tx.gas_limit, U256::from(21000u64));
    }
}
