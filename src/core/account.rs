//! Discovered-account store.
//!
//! Ordered by discovery, addressable case-insensitively in O(1), with the
//! page cursor and the per-variant base-public-key fingerprints used to
//! attribute accounts whose first derivation paths collide.

use std::collections::HashMap;
use std::ops::Range;
use std::str::FromStr;

use ethers::types::Address;
use ethers::utils::to_checksum;
use serde::{Deserialize, Serialize};

use crate::core::errors::KeyringError;
use crate::core::paths::{index_from_path_as, HdPathType, MAX_INDEX};

/// Accounts shown per discovery page unless configured otherwise.
pub const DEFAULT_PER_PAGE: usize = 5;

/// Normalize an address string to its checksum-cased form.
pub fn to_checksum_address(address: &str) -> Result<String, KeyringError> {
    let parsed = Address::from_str(address.trim())
        .map_err(|_| KeyringError::AddressNotFound(address.to_string()))?;
    Ok(to_checksum(&parsed, None))
}

/// One discovered account. Immutable once created; removed, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Checksum-cased address.
    pub address: String,
    /// Index within the path-type variant, `< MAX_INDEX`.
    pub index: u32,
    pub path_type: HdPathType,
    pub hd_path: String,
    /// Compressed public key at the variant's fingerprint node, recorded at
    /// discovery time. Absent only for accounts imported from state that
    /// predates fingerprinting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_public_key: Option<String>,
}

/// Per-address detail in the persisted state shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetail {
    pub hd_path: String,
    pub hd_path_type: HdPathType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_public_key: Option<String>,
}

/// Persisted keyring state, serialized at application save points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyringState {
    pub default_hd_path_type: HdPathType,
    pub accounts: Vec<String>,
    pub account_details: HashMap<String, AccountDetail>,
    pub page: usize,
    pub per_page: usize,
    pub unlocked_cursor: u32,
    #[serde(default)]
    pub used_hd_path_type_per_device: HashMap<String, HdPathType>,
}

/// Ordered collection of discovered accounts plus the discovery cursor.
#[derive(Debug, Clone)]
pub struct AccountIndex {
    accounts: Vec<Account>,
    /// Lowercased address -> position in `accounts`.
    by_address: HashMap<String, usize>,
    page: usize,
    per_page: usize,
    unlocked_cursor: u32,
    /// Live fingerprint cache: variant -> base public key observed on the
    /// currently connected device.
    base_public_keys: HashMap<HdPathType, String>,
}

impl AccountIndex {
    pub fn new(per_page: usize) -> Self {
        Self {
            accounts: Vec::new(),
            by_address: HashMap::new(),
            page: 0,
            per_page: per_page.max(1),
            unlocked_cursor: 0,
            base_public_keys: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn addresses(&self) -> Vec<String> {
        self.accounts.iter().map(|a| a.address.clone()).collect()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.by_address.contains_key(&address.trim().to_lowercase())
    }

    /// Case-insensitive lookup.
    pub fn get(&self, address: &str) -> Option<&Account> {
        self.by_address
            .get(&address.trim().to_lowercase())
            .map(|pos| &self.accounts[*pos])
    }

    /// Insert a discovered account. Returns `false` (and keeps the existing
    /// entry) when the address is already present; discovery is idempotent.
    pub fn insert(&mut self, account: Account) -> bool {
        let key = account.address.to_lowercase();
        if self.by_address.contains_key(&key) {
            return false;
        }
        self.by_address.insert(key, self.accounts.len());
        self.accounts.push(account);
        true
    }

    /// Remove by address, case-insensitively.
    pub fn remove(&mut self, address: &str) -> Result<Account, KeyringError> {
        let key = address.trim().to_lowercase();
        let pos = self
            .by_address
            .remove(&key)
            .ok_or_else(|| KeyringError::AddressNotFound(address.to_string()))?;
        let removed = self.accounts.remove(pos);
        // Positions after the removal point shifted down by one.
        for slot in self.by_address.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Ok(removed)
    }

    pub fn unlocked_cursor(&self) -> u32 {
        self.unlocked_cursor
    }

    pub fn set_unlocked_cursor(&mut self, index: u32) {
        self.unlocked_cursor = index;
    }

    pub fn per_page(&self) -> usize {
        self.per_page
    }

    /// Move the page cursor and return the index range of the resulting
    /// page. `page = max(1, page + direction)`; indices clamp below
    /// `MAX_INDEX`, so a request past the end yields an empty range rather
    /// than an error.
    pub fn advance_page(&mut self, direction: i32) -> Range<u32> {
        let page = (self.page as i64 + direction as i64).max(1) as usize;
        self.page = page;
        self.page_range(page)
    }

    /// Index range for an absolute page number, without moving the cursor.
    pub fn page_range(&self, page: usize) -> Range<u32> {
        let page = page.max(1);
        let start = (((page - 1) * self.per_page) as u64).min(MAX_INDEX as u64) as u32;
        let end = ((start as u64 + self.per_page as u64).min(MAX_INDEX as u64)) as u32;
        start..end
    }

    pub fn current_page(&self) -> usize {
        self.page
    }

    /// Back to the first page; the next `advance_page(1)` lands on page 1.
    pub fn reset_page(&mut self) {
        self.page = 0;
    }

    pub fn record_base_public_key(&mut self, path_type: HdPathType, key: String) {
        self.base_public_keys.insert(path_type, key);
    }

    pub fn base_public_key(&self, path_type: HdPathType) -> Option<&str> {
        self.base_public_keys.get(&path_type).map(String::as_str)
    }

    /// Accounts attributed to the given variant. Attribution compares the
    /// base public key recorded at discovery against the live fingerprint,
    /// never the path string alone; accounts imported without a fingerprint
    /// fall back to their stored variant tag.
    pub fn current_accounts(&self, path_type: HdPathType, live_base: &str) -> Vec<Account> {
        self.accounts
            .iter()
            .filter(|a| match a.base_public_key.as_deref() {
                Some(base) => base == live_base,
                None => a.path_type == path_type,
            })
            .cloned()
            .collect()
    }

    /// Assemble the persisted state shape.
    pub fn to_state(
        &self,
        default_hd_path_type: HdPathType,
        used_hd_path_type_per_device: HashMap<String, HdPathType>,
    ) -> KeyringState {
        let account_details = self
            .accounts
            .iter()
            .map(|a| {
                (
                    a.address.clone(),
                    AccountDetail {
                        hd_path: a.hd_path.clone(),
                        hd_path_type: a.path_type,
                        base_public_key: a.base_public_key.clone(),
                    },
                )
            })
            .collect();
        KeyringState {
            default_hd_path_type,
            accounts: self.addresses(),
            account_details,
            page: self.page,
            per_page: self.per_page,
            unlocked_cursor: self.unlocked_cursor,
            used_hd_path_type_per_device,
        }
    }

    /// Rebuild the index from persisted state, preserving discovery order.
    ///
    /// Addresses persisted without a detail record (wallets imported before
    /// the cache existed) come back in the second slot; resolving their
    /// index takes the bounded re-derivation scan.
    pub fn from_state(state: &KeyringState) -> Result<(Self, Vec<String>), KeyringError> {
        let mut index = AccountIndex::new(state.per_page);
        index.page = state.page;
        index.unlocked_cursor = state.unlocked_cursor;
        let mut bare = Vec::new();

        for address in &state.accounts {
            let Some(detail) = state.account_details.get(address) else {
                bare.push(to_checksum_address(address)?);
                continue;
            };
            let account_index = index_from_path_as(&detail.hd_path, detail.hd_path_type)?;
            let account = Account {
                address: to_checksum_address(address)?,
                index: account_index,
                path_type: detail.hd_path_type,
                hd_path: detail.hd_path.clone(),
                base_public_key: detail.base_public_key.clone(),
            };
            if !index.insert(account) {
                return Err(KeyringError::Unexpected(format!(
                    "duplicate address in persisted state: {}",
                    address
                )));
            }
        }
        Ok((index, bare))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::paths::derive_path;

    fn account(n: u8, index: u32) -> Account {
        // Synthetic but well-formed addresses: one distinct byte per account.
        let raw = format!("0x{:040x}", n as u128 + 0x1000);
        Account {
            address: to_checksum_address(&raw).unwrap(),
            index,
            path_type: HdPathType::Bip44,
            hd_path: derive_path(HdPathType::Bip44, index).unwrap(),
            base_public_key: Some("02aa".to_string()),
        }
    }

    #[test]
    fn test_insert_is_idempotent_and_ordered() {
        let mut index = AccountIndex::new(5);
        assert!(index.insert(account(1, 0)));
        assert!(index.insert(account(2, 1)));
        assert!(!index.insert(account(1, 0)), "duplicate must be skipped");

        assert_eq!(index.len(), 2);
        assert_eq!(index.accounts()[0].index, 0);
        assert_eq!(index.accounts()[1].index, 1);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut index = AccountIndex::new(5);
        let acct = account(7, 3);
        let upper = acct.address.to_uppercase().replace("0X", "0x");
        index.insert(acct.clone());

        assert!(index.contains(&upper));
        assert_eq!(index.get(&upper).unwrap().index, 3);
    }

    #[test]
    fn test_remove_unknown_address_fails() {
        let mut index = AccountIndex::new(5);
        index.insert(account(1, 0));
        let err = index.remove("0x0000000000000000000000000000000000009999");
        assert!(matches!(err, Err(KeyringError::AddressNotFound(_))));
    }

    #[test]
    fn test_remove_keeps_lookup_consistent() {
        let mut index = AccountIndex::new(5);
        let a = account(1, 0);
        let b = account(2, 1);
        let c = account(3, 2);
        index.insert(a.clone());
        index.insert(b.clone());
        index.insert(c.clone());

        index.remove(&a.address.to_lowercase()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(&b.address).unwrap().index, 1);
        assert_eq!(index.get(&c.address).unwrap().index, 2);
        assert!(!index.contains(&a.address));
    }

    #[test]
    fn test_page_arithmetic() {
        let mut index = AccountIndex::new(5);
        assert_eq!(index.advance_page(1), 0..5);
        assert_eq!(index.advance_page(1), 5..10);
        assert_eq!(index.advance_page(-1), 0..5);
        // Clamped at page 1.
        assert_eq!(index.advance_page(-5), 0..5);
    }

    #[test]
    fn test_pagination_is_pure_cursor_function() {
        // k sequential advances from the first page equal the direct range
        // for page k.
        for k in 1..=10 {
            let mut walked = AccountIndex::new(3);
            let mut last = 0..0;
            for _ in 0..k {
                last = walked.advance_page(1);
            }
            let direct = AccountIndex::new(3).page_range(k);
            assert_eq!(last, direct, "page {}", k);
        }
    }

    #[test]
    fn test_page_past_max_index_is_empty() {
        let mut index = AccountIndex::new(5);
        let range = index.advance_page((MAX_INDEX / 5 + 3) as i32);
        assert!(range.is_empty());
        assert!(range.start <= MAX_INDEX);
    }

    #[test]
    fn test_page_straddling_max_index_is_clamped() {
        let index = AccountIndex::new(7);
        // Page 143 of 7 covers 994..1001, which clamps to 994..1000.
        let range = index.page_range(143);
        assert_eq!(range, 994..MAX_INDEX);
    }

    #[test]
    fn test_current_accounts_by_fingerprint() {
        let mut index = AccountIndex::new(5);
        let mut live = account(1, 0);
        live.path_type = HdPathType::LedgerLive;
        live.hd_path = derive_path(HdPathType::LedgerLive, 0).unwrap();
        live.base_public_key = Some("02live".to_string());
        let mut bip = account(2, 1);
        bip.base_public_key = Some("02bip".to_string());
        let mut untagged = account(3, 2);
        untagged.base_public_key = None;

        index.insert(live.clone());
        index.insert(bip.clone());
        index.insert(untagged.clone());

        let current = index.current_accounts(HdPathType::LedgerLive, "02live");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].address, live.address);

        // Untagged accounts fall back to their stored variant.
        let current = index.current_accounts(HdPathType::Bip44, "02bip");
        assert_eq!(current.len(), 2);
    }

    #[test]
    fn test_state_round_trip() {
        let mut index = AccountIndex::new(5);
        index.insert(account(1, 0));
        index.insert(account(2, 4));
        index.set_unlocked_cursor(5);
        index.advance_page(2);

        let mut used = HashMap::new();
        used.insert("device-1".to_string(), HdPathType::LedgerLive);
        let state = index.to_state(HdPathType::Bip44, used);

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"accountDetails\""));
        assert!(json.contains("\"unlockedCursor\":5"));
        assert!(json.contains("\"defaultHdPathType\":\"BIP44\""));

        let restored_state: KeyringState = serde_json::from_str(&json).unwrap();
        let (restored, bare) = AccountIndex::from_state(&restored_state).unwrap();
        assert!(bare.is_empty());
        assert_eq!(restored.addresses(), index.addresses());
        assert_eq!(restored.unlocked_cursor(), 5);
        assert_eq!(restored.current_page(), 2);
        assert_eq!(restored.accounts()[1].index, 4);
    }

    #[test]
    fn test_state_without_details_yields_bare_addresses() {
        let mut index = AccountIndex::new(5);
        index.insert(account(1, 0));
        let mut state = index.to_state(HdPathType::Bip44, HashMap::new());
        let orphan = "0x000000000000000000000000000000000000dEaD".to_string();
        state.accounts.push(orphan.clone());

        let (restored, bare) = AccountIndex::from_state(&state).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(bare, vec![to_checksum_address(&orphan).unwrap()]);
    }

    #[test]
    fn test_state_restores_ledger_live_collision_path() {
        // A persisted LedgerLive account at index 0 shares its path string
        // with BIP44 index 0; the stored variant tag must win.
        let mut index = AccountIndex::new(5);
        let mut acct = account(9, 0);
        acct.path_type = HdPathType::LedgerLive;
        acct.hd_path = derive_path(HdPathType::LedgerLive, 0).unwrap();
        index.insert(acct.clone());

        let state = index.to_state(HdPathType::LedgerLive, HashMap::new());
        let (restored, _) = AccountIndex::from_state(&state).unwrap();
        assert_eq!(restored.accounts()[0].path_type, HdPathType::LedgerLive);
        assert_eq!(restored.accounts()[0].index, 0);
    }
}
