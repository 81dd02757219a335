//! HD derivation path registry.
//!
//! One structured template per path-type variant replaces per-backend
//! pattern matching: every template names the segments before and after the
//! varying index slot, so `derive_path` and `index_from_path` stay exact
//! inverses of each other.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::errors::KeyringError;

/// Upper bound (exclusive) on account indices.
pub const MAX_INDEX: u32 = 1000;

/// Supported HD path conventions for EVM accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HdPathType {
    /// `m/44'/60'/0'/0/{index}`: the varying slot is the address index.
    #[serde(rename = "BIP44")]
    Bip44,
    /// `m/44'/60'/0'/{index}`: older convention, change-level slot.
    Legacy,
    /// `m/44'/60'/{index}'/0/0`: one hardened account node per index.
    LedgerLive,
}

impl fmt::Display for HdPathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HdPathType::Bip44 => write!(f, "BIP44"),
            HdPathType::Legacy => write!(f, "Legacy"),
            HdPathType::LedgerLive => write!(f, "LedgerLive"),
        }
    }
}

struct PathTemplate {
    path_type: HdPathType,
    /// Segments between `m` and the varying slot.
    prefix: &'static [&'static str],
    /// Whether the varying slot is hardened.
    slot_hardened: bool,
    /// Segments after the varying slot.
    suffix: &'static [&'static str],
}

/// Declaration order is parse priority: BIP44 owns the index-0 string
/// collision with LedgerLive. Account attribution beyond the string relies
/// on base public keys, not on this tie-break.
const TEMPLATES: &[PathTemplate] = &[
    PathTemplate {
        path_type: HdPathType::Bip44,
        prefix: &["44'", "60'", "0'", "0"],
        slot_hardened: false,
        suffix: &[],
    },
    PathTemplate {
        path_type: HdPathType::LedgerLive,
        prefix: &["44'", "60'"],
        slot_hardened: true,
        suffix: &["0", "0"],
    },
    PathTemplate {
        path_type: HdPathType::Legacy,
        prefix: &["44'", "60'", "0'"],
        slot_hardened: false,
        suffix: &[],
    },
];

fn template(path_type: HdPathType) -> &'static PathTemplate {
    TEMPLATES
        .iter()
        .find(|t| t.path_type == path_type)
        .unwrap_or_else(|| unreachable!("template registered for every variant"))
}

/// Render the derivation path for `(path_type, index)`.
pub fn derive_path(path_type: HdPathType, index: u32) -> Result<String, KeyringError> {
    if index >= MAX_INDEX {
        return Err(KeyringError::InvalidDerivationPath(format!(
            "index {} out of range for {} (max {})",
            index, path_type, MAX_INDEX
        )));
    }

    let t = template(path_type);
    let mut segments: Vec<String> = Vec::with_capacity(t.prefix.len() + t.suffix.len() + 2);
    segments.push("m".to_string());
    segments.extend(t.prefix.iter().map(|s| s.to_string()));
    segments.push(if t.slot_hardened {
        format!("{}'", index)
    } else {
        index.to_string()
    });
    segments.extend(t.suffix.iter().map(|s| s.to_string()));
    Ok(segments.join("/"))
}

/// Recover `(path_type, index)` from a path string.
///
/// Exact inverse of [`derive_path`]; a shape no template produces fails with
/// `InvalidDerivationPath`.
pub fn index_from_path(path: &str) -> Result<(HdPathType, u32), KeyringError> {
    let invalid = || KeyringError::InvalidDerivationPath(path.to_string());

    let mut segments = path.split('/');
    if segments.next() != Some("m") {
        return Err(invalid());
    }
    let segments: Vec<&str> = segments.collect();

    for t in TEMPLATES {
        let expected_len = t.prefix.len() + 1 + t.suffix.len();
        if segments.len() != expected_len {
            continue;
        }
        let (prefix, rest) = segments.split_at(t.prefix.len());
        if prefix != t.prefix {
            continue;
        }
        let (slot, suffix) = rest.split_first().ok_or_else(invalid)?;
        if suffix != t.suffix {
            continue;
        }
        let (digits, hardened) = match slot.strip_suffix('\'') {
            Some(d) => (d, true),
            None => (*slot, false),
        };
        if hardened != t.slot_hardened {
            continue;
        }
        // Reject "01", "+3" and similar non-canonical renderings.
        if digits.is_empty()
            || !digits.bytes().all(|b| b.is_ascii_digit())
            || (digits.len() > 1 && digits.starts_with('0'))
        {
            continue;
        }
        let index: u32 = digits.parse().map_err(|_| invalid())?;
        if index >= MAX_INDEX {
            return Err(invalid());
        }
        return Ok((t.path_type, index));
    }

    Err(invalid())
}

/// Recover the index from a path known to belong to `path_type`.
///
/// Used when restoring persisted accounts, where the variant tag is stored
/// alongside the path and must win over the parse-priority tie-break.
pub fn index_from_path_as(path: &str, path_type: HdPathType) -> Result<u32, KeyringError> {
    let (parsed_type, index) = index_from_path(path)?;
    if parsed_type == path_type {
        return Ok(index);
    }
    // The only legal disagreement is the index-0 collision between BIP44
    // and LedgerLive; anything else is a corrupt record.
    if index == 0 && derive_path(path_type, 0)? == path {
        return Ok(0);
    }
    Err(KeyringError::InvalidDerivationPath(format!(
        "path {} does not match variant {}",
        path, path_type
    )))
}

/// Fingerprint node for base-public-key attribution. Distinct per variant,
/// even where first derivation paths collide.
pub fn base_path(path_type: HdPathType) -> &'static str {
    match path_type {
        HdPathType::Bip44 => "m/44'/60'/0'/0",
        HdPathType::Legacy => "m/44'/60'/0'",
        HdPathType::LedgerLive => "m/44'/60'/0'/0/0",
    }
}

/// Parent node for local (non-hardened) child derivation, if the variant's
/// varying slot permits it. `None` means every index needs a device call.
pub fn local_parent_path(path_type: HdPathType) -> Option<&'static str> {
    let t = template(path_type);
    if !t.slot_hardened && t.suffix.is_empty() {
        Some(match path_type {
            HdPathType::Bip44 => "m/44'/60'/0'/0",
            HdPathType::Legacy => "m/44'/60'/0'",
            HdPathType::LedgerLive => unreachable!("hardened slot"),
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_path_shapes() {
        assert_eq!(derive_path(HdPathType::Bip44, 7).unwrap(), "m/44'/60'/0'/0/7");
        assert_eq!(derive_path(HdPathType::Legacy, 7).unwrap(), "m/44'/60'/0'/7");
        assert_eq!(
            derive_path(HdPathType::LedgerLive, 7).unwrap(),
            "m/44'/60'/7'/0/0"
        );
    }

    #[test]
    fn test_round_trip_all_variants() {
        let samples = [0u32, 1, 2, 9, 10, 99, 100, 419, 998, MAX_INDEX - 1];
        for path_type in [HdPathType::Bip44, HdPathType::Legacy] {
            for index in samples {
                let path = derive_path(path_type, index).unwrap();
                assert_eq!(index_from_path(&path).unwrap(), (path_type, index));
            }
        }
        // LedgerLive round-trips from index 1 upward; index 0 is the known
        // string collision resolved in favor of BIP44 (see below).
        for index in samples.into_iter().filter(|i| *i > 0) {
            let path = derive_path(HdPathType::LedgerLive, index).unwrap();
            assert_eq!(
                index_from_path(&path).unwrap(),
                (HdPathType::LedgerLive, index)
            );
        }
    }

    #[test]
    fn test_index_zero_collision() {
        let bip44 = derive_path(HdPathType::Bip44, 0).unwrap();
        let live = derive_path(HdPathType::LedgerLive, 0).unwrap();
        assert_eq!(bip44, live);
        assert_eq!(index_from_path(&bip44).unwrap(), (HdPathType::Bip44, 0));
    }

    #[test]
    fn test_unrecognized_shapes_fail() {
        for path in [
            "",
            "m",
            "m/44'/60'",
            "m/44'/0'/0'/0/0",
            "m/44'/60'/0'/1/5",
            "m/44'/60'/0'/0/5'",
            "m/44'/60'/5/0/0",
            "m/44'/60'/0'/0/05",
            "m/44'/60'/0'/0/x",
            "44'/60'/0'/0/0",
            "m/44'/60'/0'/0/0/0",
        ] {
            assert!(
                matches!(
                    index_from_path(path),
                    Err(KeyringError::InvalidDerivationPath(_))
                ),
                "expected failure for {:?}",
                path
            );
        }
    }

    #[test]
    fn test_max_index_bounds() {
        assert!(derive_path(HdPathType::Bip44, MAX_INDEX).is_err());
        let over = format!("m/44'/60'/0'/0/{}", MAX_INDEX);
        assert!(index_from_path(&over).is_err());
    }

    #[test]
    fn test_base_paths_distinct() {
        let bases = [
            base_path(HdPathType::Bip44),
            base_path(HdPathType::Legacy),
            base_path(HdPathType::LedgerLive),
        ];
        for i in 0..bases.len() {
            for j in (i + 1)..bases.len() {
                assert_ne!(bases[i], bases[j]);
            }
        }
    }

    #[test]
    fn test_local_parent_only_for_soft_slots() {
        assert_eq!(local_parent_path(HdPathType::Bip44), Some("m/44'/60'/0'/0"));
        assert_eq!(local_parent_path(HdPathType::Legacy), Some("m/44'/60'/0'"));
        assert_eq!(local_parent_path(HdPathType::LedgerLive), None);
    }

    #[test]
    fn test_serde_tags() {
        assert_eq!(
            serde_json::to_string(&HdPathType::Bip44).unwrap(),
            "\"BIP44\""
        );
        assert_eq!(
            serde_json::from_str::<HdPathType>("\"LedgerLive\"").unwrap(),
            HdPathType::LedgerLive
        );
    }
}
