//! EIP-712 typed-data handling.
//!
//! Exactly one structure version is supported; anything else fails before a
//! device is ever contacted. Backends in reduced-trust display mode never
//! see the structure, only the precomputed domain and struct hashes.

use ethers::types::transaction::eip712::{Eip712, TypedData};
use ethers::types::H256;
use ethers::utils::keccak256;

use crate::core::errors::KeyringError;
use crate::hardware::backend::{TypedDataMode, TypedDataRequest};

/// The only accepted typed-data structure version.
pub const SUPPORTED_TYPED_DATA_VERSION: &str = "V4";

/// Gate on the requested version. Runs before any backend call.
pub fn ensure_supported_version(version: &str) -> Result<(), KeyringError> {
    if version.eq_ignore_ascii_case(SUPPORTED_TYPED_DATA_VERSION) {
        Ok(())
    } else {
        Err(KeyringError::UnsupportedTypedDataVersion(
            version.to_string(),
        ))
    }
}

/// Digest the device signature commits to:
/// `keccak256(0x19 || 0x01 || domainSeparator || structHash)`.
pub fn signing_digest(typed_data: &TypedData) -> Result<H256, KeyringError> {
    let digest = typed_data
        .encode_eip712()
        .map_err(|e| KeyringError::unexpected("eip712 encoding", e))?;
    Ok(H256::from(digest))
}

/// Build the request shape the backend declared.
pub fn build_request(
    typed_data: &TypedData,
    mode: TypedDataMode,
) -> Result<TypedDataRequest, KeyringError> {
    match mode {
        TypedDataMode::FullStruct => {
            let payload = serde_json::to_value(typed_data)
                .map_err(|e| KeyringError::unexpected("typed data serialization", e))?;
            Ok(TypedDataRequest::FullStruct { payload })
        }
        TypedDataMode::HashesOnly => {
            let domain_separator = typed_data
                .domain
                .separator();
            let struct_hash = typed_data
                .struct_hash()
                .map_err(|e| KeyringError::unexpected("eip712 struct hash", e))?;
            Ok(TypedDataRequest::Hashes {
                domain_separator: H256::from(domain_separator),
                struct_hash: H256::from(struct_hash),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_typed_data() -> TypedData {
        serde_json::from_str(
            r#"{
                "types": {
                    "EIP712Domain": [
                        {"name": "name", "type": "string"},
                        {"name": "version", "type": "string"},
                        {"name": "chainId", "type": "uint256"},
                        {"name": "verifyingContract", "type": "address"}
                    ],
                    "Order": [
                        {"name": "maker", "type": "address"},
                        {"name": "amount", "type": "uint256"}
                    ]
                },
                "primaryType": "Order",
                "domain": {
                    "name": "Test Exchange",
                    "version": "1",
                    "chainId": 1,
                    "verifyingContract": "0x742d35Cc6634C0532925a3b8D400e8B78fFe4860"
                },
                "message": {
                    "maker": "0x8ba1f109551bD432803012645Ac136ddd64DBA72",
                    "amount": "1000000"
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_version_gate() {
        assert!(ensure_supported_version("V4").is_ok());
        assert!(ensure_supported_version("v4").is_ok());
        for bad in ["V1", "V3", "v3", "5", ""] {
            match ensure_supported_version(bad) {
                Err(KeyringError::UnsupportedTypedDataVersion(v)) => assert_eq!(v, bad),
                other => panic!("expected version rejection for {:?}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_digest_commits_to_domain_and_struct() {
        let typed_data = sample_typed_data();
        let digest = signing_digest(&typed_data).unwrap();

        let domain_separator = typed_data.domain.separator();
        let struct_hash = typed_data.struct_hash().unwrap();
        let mut preimage = Vec::with_capacity(2 + 32 + 32);
        preimage.extend_from_slice(&[0x19, 0x01]);
        preimage.extend_from_slice(&domain_separator);
        preimage.extend_from_slice(&struct_hash);

        assert_eq!(digest, H256::from(keccak256(&preimage)));
        assert_ne!(digest, H256::zero());
    }

    #[test]
    fn test_hashes_only_request_matches_digest_parts() {
        let typed_data = sample_typed_data();
        match build_request(&typed_data, TypedDataMode::HashesOnly).unwrap() {
            TypedDataRequest::Hashes {
                domain_separator,
                struct_hash,
            } => {
                assert_eq!(domain_separator, H256::from(typed_data.domain.separator()));
                assert_eq!(struct_hash, H256::from(typed_data.struct_hash().unwrap()));
            }
            other => panic!("expected hashes request, got {:?}", other),
        }
    }

    #[test]
    fn test_full_struct_request_round_trips() {
        let typed_data = sample_typed_data();
        match build_request(&typed_data, TypedDataMode::FullStruct).unwrap() {
            TypedDataRequest::FullStruct { payload } => {
                let back: TypedData = serde_json::from_value(payload).unwrap();
                assert_eq!(back.primary_type, typed_data.primary_type);
                assert_eq!(
                    signing_digest(&back).unwrap(),
                    signing_digest(&typed_data).unwrap()
                );
            }
            other => panic!("expected full-struct request, got {:?}", other),
        }
    }
}
