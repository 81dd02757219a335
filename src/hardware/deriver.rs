//! Address derivation against a connected backend.
//!
//! Trusted display (`display = true`) always round-trips to the device.
//! Silent discovery avoids one device call per index where it can: for
//! variants whose varying slot is non-hardened, the deriver fetches the
//! variant's parent node once (public key + chain code) and derives child
//! addresses locally with BIP32 public child derivation. Hardened-slot
//! variants and backends that withhold the chain code always ask the
//! device.

use std::collections::HashMap;

use ethers::types::Address;
use ethers::utils::{keccak256, to_checksum};
use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::{Field, PrimeField};
use k256::{ProjectivePoint, PublicKey, Scalar};
use parking_lot::Mutex;
use sha2::Sha512;
use tracing::debug;

use crate::core::account::to_checksum_address;
use crate::core::errors::KeyringError;
use crate::core::paths::{self, HdPathType};
use crate::hardware::backend::{DerivedAddress, VendorBackend};

type HmacSha512 = Hmac<Sha512>;

#[derive(Clone)]
struct ParentNode {
    /// Compressed SEC1 public key, 33 bytes.
    public_key: Vec<u8>,
    chain_code: [u8; 32],
}

/// Per-variant caches for silent discovery. Cleared whenever the connected
/// device may have changed.
pub struct AddressDeriver {
    /// `None` marks a backend that withholds its chain code, so the fast
    /// path is not re-probed on every index.
    parents: Mutex<HashMap<HdPathType, Option<ParentNode>>>,
    bases: Mutex<HashMap<HdPathType, String>>,
}

impl AddressDeriver {
    pub fn new() -> Self {
        Self {
            parents: Mutex::new(HashMap::new()),
            bases: Mutex::new(HashMap::new()),
        }
    }

    /// Forget cached device material (device swap, reconnect, path switch).
    pub fn clear(&self) {
        self.parents.lock().clear();
        self.bases.lock().clear();
    }

    /// Derive the address at `(path_type, index)`.
    pub async fn derive(
        &self,
        backend: &dyn VendorBackend,
        path_type: HdPathType,
        index: u32,
        display: bool,
    ) -> Result<DerivedAddress, KeyringError> {
        let path = paths::derive_path(path_type, index)?;

        if !display {
            if let Some(parent_path) = paths::local_parent_path(path_type) {
                if let Some(parent) = self.parent_node(backend, path_type, parent_path).await? {
                    let child = derive_child_public_key(&parent, index)?;
                    let address = address_from_public_key(&child)?;
                    debug!(path = %path, "derived address locally from parent node");
                    return Ok(DerivedAddress {
                        address,
                        public_key: hex::encode(&child),
                        chain_code: None,
                    });
                }
            }
        }

        let mut derived = backend.get_address(&path, display).await?;
        derived.address = to_checksum_address(&derived.address)?;
        Ok(derived)
    }

    /// Compressed public key at the variant's fingerprint node, cached per
    /// variant for the lifetime of the cache.
    pub async fn base_public_key(
        &self,
        backend: &dyn VendorBackend,
        path_type: HdPathType,
    ) -> Result<String, KeyringError> {
        if let Some(cached) = self.bases.lock().get(&path_type) {
            return Ok(cached.clone());
        }
        let derived = backend
            .get_address(paths::base_path(path_type), false)
            .await?;
        let key = strip_hex_prefix(&derived.public_key).to_lowercase();
        self.bases.lock().insert(path_type, key.clone());
        Ok(key)
    }

    async fn parent_node(
        &self,
        backend: &dyn VendorBackend,
        path_type: HdPathType,
        parent_path: &str,
    ) -> Result<Option<ParentNode>, KeyringError> {
        if let Some(cached) = self.parents.lock().get(&path_type) {
            return Ok(cached.clone());
        }

        let derived = backend.get_address(parent_path, false).await?;
        let node = match derived.chain_code {
            Some(chain_code_hex) => {
                let public_key = decode_hex_field(&derived.public_key, "public key")?;
                let chain_code = decode_hex_field(&chain_code_hex, "chain code")?;
                let chain_code: [u8; 32] = chain_code.try_into().map_err(|_| {
                    KeyringError::Unexpected(format!(
                        "{}: chain code must be 32 bytes",
                        backend.name()
                    ))
                })?;
                Some(ParentNode {
                    public_key,
                    chain_code,
                })
            }
            None => {
                debug!(
                    backend = backend.name(),
                    path = parent_path,
                    "backend returned no chain code, discovery stays on-device"
                );
                None
            }
        };
        self.parents.lock().insert(path_type, node.clone());
        Ok(node)
    }
}

impl Default for AddressDeriver {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

fn decode_hex_field(value: &str, what: &str) -> Result<Vec<u8>, KeyringError> {
    hex::decode(strip_hex_prefix(value))
        .map_err(|e| KeyringError::Unexpected(format!("invalid {} hex: {}", what, e)))
}

/// BIP32 CKDpub: HMAC-SHA512(chain_code, serP(parent) || index), tweak the
/// parent point by IL·G. Hardened indices have no public derivation.
fn derive_child_public_key(parent: &ParentNode, index: u32) -> Result<Vec<u8>, KeyringError> {
    if index >= 0x8000_0000 {
        return Err(KeyringError::InvalidDerivationPath(format!(
            "cannot publicly derive hardened index {}",
            index
        )));
    }

    let mut mac = HmacSha512::new_from_slice(&parent.chain_code)
        .map_err(|e| KeyringError::unexpected("hmac init", e))?;
    mac.update(&parent.public_key);
    mac.update(&index.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let (il, _ir) = digest.split_at(32);

    let tweak: Scalar =
        Option::from(Scalar::from_repr(*k256::FieldBytes::from_slice(il))).ok_or_else(|| {
            KeyringError::Unexpected("child derivation tweak exceeds curve order".to_string())
        })?;
    if bool::from(tweak.is_zero()) {
        return Err(KeyringError::Unexpected(
            "child derivation tweak is zero".to_string(),
        ));
    }

    let parent_key = PublicKey::from_sec1_bytes(&parent.public_key)
        .map_err(|e| KeyringError::unexpected("invalid parent public key", e))?;
    let child_point = ProjectivePoint::GENERATOR * tweak + parent_key.to_projective();
    let child = PublicKey::from_affine(child_point.to_affine())
        .map_err(|e| KeyringError::unexpected("derived child is not a valid point", e))?;
    Ok(child.to_encoded_point(true).as_bytes().to_vec())
}

/// keccak256 of the uncompressed public key, last 20 bytes, checksum-cased.
fn address_from_public_key(public_key_sec1: &[u8]) -> Result<String, KeyringError> {
    let key = PublicKey::from_sec1_bytes(public_key_sec1)
        .map_err(|e| KeyringError::unexpected("invalid public key", e))?;
    let uncompressed = key.to_encoded_point(false);
    let digest = keccak256(&uncompressed.as_bytes()[1..]);
    let address = Address::from_slice(&digest[12..]);
    Ok(to_checksum(&address, None))
}
