//! Keyring facade: account discovery and signing orchestration over one
//! vendor backend.
//!
//! A `KeyringCore` composes the backend capability object with the account
//! index, address deriver, device session, and sign orchestrator. No vendor
//! base classes, no shared globals: rejection notifications and pairing
//! interaction go through injected collaborators, and retry state is owned
//! by the instance.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::transaction::eip712::TypedData;
use ethers::types::{Address, RecoveryMessage, Signature};
use ethers::utils::{hash_message, to_checksum};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::KeyringConfig;
use crate::core::account::{to_checksum_address, Account, AccountIndex, KeyringState};
use crate::core::errors::KeyringError;
use crate::core::paths::{derive_path, HdPathType, MAX_INDEX};
use crate::hardware::backend::{
    DeviceSignature, PairingHooks, RejectionSink, VendorBackend,
};
use crate::hardware::deriver::AddressDeriver;
use crate::hardware::orchestrator::{SignOperation, SignOrchestrator};
use crate::hardware::session::DeviceSession;
use crate::signing::transaction::{
    encode_for_backend, finalize_transaction, to_typed_transaction, UnsignedTransaction,
};
use crate::signing::typed_data::{build_request, ensure_supported_version, signing_digest};
use crate::signing::{SignResult, SignedMessage, SignedTransaction};

pub struct KeyringCore {
    backend: Arc<dyn VendorBackend>,
    session: Arc<DeviceSession>,
    deriver: Arc<AddressDeriver>,
    orchestrator: SignOrchestrator,
    index: Mutex<AccountIndex>,
    /// Addresses restored from state without derivation details; resolved
    /// lazily via the bounded re-derivation scan.
    bare_addresses: Mutex<Vec<String>>,
    hd_path_type: Mutex<HdPathType>,
    used_hd_path_type_per_device: Mutex<HashMap<String, HdPathType>>,
}

impl KeyringCore {
    pub fn new(
        backend: Arc<dyn VendorBackend>,
        sink: Arc<dyn RejectionSink>,
        pairing: Arc<dyn PairingHooks>,
        config: KeyringConfig,
    ) -> Self {
        let session = Arc::new(DeviceSession::new(
            backend.clone(),
            pairing,
            config.reconnect_attempts,
            config.reconnect_delay(),
        ));
        Self {
            backend,
            session,
            deriver: Arc::new(AddressDeriver::new()),
            orchestrator: SignOrchestrator::new(sink),
            index: Mutex::new(AccountIndex::new(config.per_page)),
            bare_addresses: Mutex::new(Vec::new()),
            hd_path_type: Mutex::new(config.default_hd_path_type),
            used_hd_path_type_per_device: Mutex::new(HashMap::new()),
        }
    }

    /// Restore a keyring from persisted state.
    pub fn from_state(
        backend: Arc<dyn VendorBackend>,
        sink: Arc<dyn RejectionSink>,
        pairing: Arc<dyn PairingHooks>,
        config: KeyringConfig,
        state: &KeyringState,
    ) -> Result<Self, KeyringError> {
        let (index, bare) = AccountIndex::from_state(state)?;
        let keyring = Self::new(backend, sink, pairing, config);
        *keyring.index.lock() = index;
        *keyring.bare_addresses.lock() = bare;
        *keyring.hd_path_type.lock() = state.default_hd_path_type;
        *keyring.used_hd_path_type_per_device.lock() =
            state.used_hd_path_type_per_device.clone();
        Ok(keyring)
    }

    /// Persisted state shape, serialized at application save points.
    pub fn to_state(&self) -> KeyringState {
        let mut state = self.index.lock().to_state(
            *self.hd_path_type.lock(),
            self.used_hd_path_type_per_device.lock().clone(),
        );
        state
            .accounts
            .extend(self.bare_addresses.lock().iter().cloned());
        state
    }

    pub fn hd_path_type(&self) -> HdPathType {
        *self.hd_path_type.lock()
    }

    /// Switch the active derivation convention. Recorded per device so a
    /// wallet can restore the convention it last used with this backend.
    pub fn set_hd_path_type(&self, path_type: HdPathType) {
        info!(backend = self.backend.name(), %path_type, "switching hd path type");
        *self.hd_path_type.lock() = path_type;
        self.used_hd_path_type_per_device
            .lock()
            .insert(self.backend.name().to_string(), path_type);
        self.index.lock().reset_page();
    }

    /// Choose the starting index for the next `add_accounts` call.
    pub fn set_account_to_unlock(&self, index: u32) {
        self.index.lock().set_unlocked_cursor(index);
    }

    /// All known addresses, discovery order, checksum-cased.
    pub fn get_accounts(&self) -> Vec<String> {
        let mut addresses = self.index.lock().addresses();
        addresses.extend(self.bare_addresses.lock().iter().cloned());
        addresses
    }

    /// Remove an account by address, case-insensitively. Purges its cached
    /// path and fingerprint details.
    pub fn remove_account(&self, address: &str) -> Result<(), KeyringError> {
        let mut bare = self.bare_addresses.lock();
        if let Some(pos) = bare
            .iter()
            .position(|a| a.eq_ignore_ascii_case(address.trim()))
        {
            bare.remove(pos);
            return Ok(());
        }
        drop(bare);
        let removed = self.index.lock().remove(address)?;
        debug!(address = %removed.address, "account removed");
        Ok(())
    }

    /// Derive `n` sequential accounts starting at the unlocked cursor,
    /// skipping addresses already present. Returns the full account list.
    pub async fn add_accounts(&self, n: usize) -> Result<Vec<Account>, KeyringError> {
        let path_type = self.hd_path_type();
        self.session.open().await?;
        let result = self.discover_accounts(path_type, n).await;
        self.session.close().await;
        result?;

        let index = self.index.lock();
        Ok(index.accounts().to_vec())
    }

    async fn discover_accounts(
        &self,
        path_type: HdPathType,
        n: usize,
    ) -> Result<(), KeyringError> {
        let base = self
            .deriver
            .base_public_key(self.backend.as_ref(), path_type)
            .await?;
        self.index
            .lock()
            .record_base_public_key(path_type, base.clone());

        let start = self.index.lock().unlocked_cursor();
        let end = start.saturating_add(n as u32).min(MAX_INDEX);
        info!(
            backend = self.backend.name(),
            %path_type,
            start,
            count = n,
            "discovering accounts"
        );

        for i in start..end {
            let derived = self.derive_with_recovery(path_type, i, false).await?;
            let mut index = self.index.lock();
            if index.contains(&derived.address) {
                debug!(address = %derived.address, "already tracked, skipping");
                continue;
            }
            index.insert(Account {
                address: derived.address,
                index: i,
                path_type,
                hd_path: derive_path(path_type, i)?,
                base_public_key: Some(base.clone()),
            });
        }
        self.index.lock().reset_page();
        Ok(())
    }

    /// One page of derivable accounts in the given direction (`1` forward,
    /// `-1` back). Page entries are previews; they join the keyring only
    /// through `add_accounts`.
    pub async fn get_page(&self, direction: i32) -> Result<Vec<Account>, KeyringError> {
        let path_type = self.hd_path_type();
        let range = self.index.lock().advance_page(direction);

        self.session.open().await?;
        let result = self.page_accounts(path_type, range.clone()).await;
        let result = match result {
            // One bounded reconnect-and-retry of the same page request on a
            // transient drop; anything else surfaces immediately.
            Err(err) if err.is_transient() => {
                warn!(error = %err, "transient failure mid-page, reconnecting once");
                self.deriver.clear();
                self.session.reconnect().await?;
                self.page_accounts(path_type, range).await
            }
            other => other,
        };
        self.session.close().await;
        result
    }

    async fn page_accounts(
        &self,
        path_type: HdPathType,
        range: std::ops::Range<u32>,
    ) -> Result<Vec<Account>, KeyringError> {
        let base = self
            .deriver
            .base_public_key(self.backend.as_ref(), path_type)
            .await?;
        self.index
            .lock()
            .record_base_public_key(path_type, base.clone());

        let mut page = Vec::with_capacity(range.len());
        for i in range {
            let derived = self
                .deriver
                .derive(self.backend.as_ref(), path_type, i, false)
                .await?;
            page.push(Account {
                address: derived.address,
                index: i,
                path_type,
                hd_path: derive_path(path_type, i)?,
                base_public_key: Some(base.clone()),
            });
        }
        Ok(page)
    }

    /// Accounts attributed to the active path type via base-public-key
    /// fingerprints, not path strings (two variants share their first path).
    pub async fn get_current_accounts(&self) -> Result<Vec<Account>, KeyringError> {
        let path_type = self.hd_path_type();
        self.session.open().await?;
        let base = self
            .deriver
            .base_public_key(self.backend.as_ref(), path_type)
            .await;
        self.session.close().await;
        let base = base?;

        let mut index = self.index.lock();
        index.record_base_public_key(path_type, base.clone());
        Ok(index.current_accounts(path_type, &base))
    }

    /// `(path_type, index)` for a known address. O(1) through the cache;
    /// a cache miss falls back to a bounded re-derivation scan.
    pub async fn index_from_address(
        &self,
        address: &str,
    ) -> Result<(HdPathType, u32), KeyringError> {
        if let Some(account) = self.index.lock().get(address) {
            return Ok((account.path_type, account.index));
        }
        let account = self.rederive_bare_account(address).await?;
        Ok((account.path_type, account.index))
    }

    /// Show an owned address on the device for user confirmation.
    pub async fn verify_address(&self, address: &str) -> Result<(), KeyringError> {
        let cached = self.index.lock().get(address).cloned();
        let account = match cached {
            Some(account) => account,
            None => self.rederive_bare_account(address).await?,
        };
        self.session.open().await?;
        let result = self
            .deriver
            .derive(self.backend.as_ref(), account.path_type, account.index, true)
            .await;
        self.session.close().await;
        let derived = result?;

        if !derived.address.eq_ignore_ascii_case(&account.address) {
            return Err(KeyringError::Unexpected(format!(
                "device displayed {} at {}, expected {}",
                derived.address, account.hd_path, account.address
            )));
        }
        Ok(())
    }

    /// Sign a normalized unsigned transaction with the account that owns
    /// `address`. The signer recovered from the returned signature is
    /// always verified against the requested address.
    pub async fn sign_transaction(
        &self,
        address: &str,
        tx: &UnsignedTransaction,
    ) -> Result<SignedTransaction, KeyringError> {
        let requested = to_checksum_address(address)?;
        let typed = to_typed_transaction(tx)?;
        let fee_market = matches!(typed, TypedTransaction::Eip1559(_));
        let sighash = typed.sighash();
        let request = encode_for_backend(tx, &typed, self.backend.tx_encoding());
        let hd_path = self.resolve_hd_path(&requested).await?;

        info!(
            backend = self.backend.name(),
            address = %requested,
            path = %hd_path,
            fee_market,
            "signing transaction"
        );

        let notify = requested.clone();
        let backend = self.backend.clone();
        let session = self.session.clone();
        let op: SignOperation = Arc::new(move || {
            let backend = backend.clone();
            let session = session.clone();
            let request = request.clone();
            let hd_path = hd_path.clone();
            let typed = typed.clone();
            let requested = requested.clone();
            Box::pin(async move {
                session.open().await?;
                session.begin_signing();
                let device_result = backend.sign_transaction(&hd_path, &request).await;
                session.end_signing();
                session.close().await;

                let (raw, tx_hash, signature) =
                    finalize_transaction(&typed, &device_result?, fee_market)?;
                let signer =
                    verify_signer(&signature, RecoveryMessage::Hash(sighash), &requested)?;
                Ok(SignResult::Transaction(SignedTransaction {
                    raw,
                    tx_hash,
                    signature,
                    signer,
                }))
            })
        });

        match self.orchestrator.invoke(&notify, op).await? {
            SignResult::Transaction(signed) => Ok(signed),
            SignResult::Message(_) => Err(KeyringError::Unexpected(
                "transaction signing returned a message result".to_string(),
            )),
        }
    }

    /// Sign a personal message (EIP-191 prefixed) with the account that
    /// owns `address`.
    pub async fn sign_personal_message(
        &self,
        address: &str,
        message: &[u8],
    ) -> Result<SignedMessage, KeyringError> {
        let requested = to_checksum_address(address)?;
        let digest = hash_message(message);
        let hd_path = self.resolve_hd_path(&requested).await?;

        info!(
            backend = self.backend.name(),
            address = %requested,
            path = %hd_path,
            message_len = message.len(),
            "signing personal message"
        );

        let notify = requested.clone();
        let backend = self.backend.clone();
        let session = self.session.clone();
        let message = message.to_vec();
        let op: SignOperation = Arc::new(move || {
            let backend = backend.clone();
            let session = session.clone();
            let message = message.clone();
            let hd_path = hd_path.clone();
            let requested = requested.clone();
            Box::pin(async move {
                session.open().await?;
                session.begin_signing();
                let device_result = backend.sign_personal_message(&hd_path, &message).await;
                session.end_signing();
                session.close().await;

                let signature = message_signature(&device_result?)?;
                let signer =
                    verify_signer(&signature, RecoveryMessage::Hash(digest), &requested)?;
                Ok(SignResult::Message(SignedMessage {
                    signature: format!("0x{}", hex::encode(signature.to_vec())),
                    signer,
                }))
            })
        });

        match self.orchestrator.invoke(&notify, op).await? {
            SignResult::Message(signed) => Ok(signed),
            SignResult::Transaction(_) => Err(KeyringError::Unexpected(
                "message signing returned a transaction result".to_string(),
            )),
        }
    }

    /// Sign EIP-712 typed data with the account that owns `address`. Only
    /// one structure version is supported; anything else fails before the
    /// device is contacted.
    pub async fn sign_typed_data(
        &self,
        address: &str,
        typed_data: &TypedData,
        version: &str,
    ) -> Result<SignedMessage, KeyringError> {
        ensure_supported_version(version)?;

        let requested = to_checksum_address(address)?;
        let digest = signing_digest(typed_data)?;
        let request = build_request(typed_data, self.backend.typed_data_mode())?;
        let hd_path = self.resolve_hd_path(&requested).await?;

        info!(
            backend = self.backend.name(),
            address = %requested,
            path = %hd_path,
            "signing typed data"
        );

        let notify = requested.clone();
        let backend = self.backend.clone();
        let session = self.session.clone();
        let op: SignOperation = Arc::new(move || {
            let backend = backend.clone();
            let session = session.clone();
            let request = request.clone();
            let hd_path = hd_path.clone();
            let requested = requested.clone();
            Box::pin(async move {
                session.open().await?;
                session.begin_signing();
                let device_result = backend.sign_typed_data(&hd_path, &request).await;
                session.end_signing();
                session.close().await;

                let signature = message_signature(&device_result?)?;
                let signer =
                    verify_signer(&signature, RecoveryMessage::Hash(digest), &requested)?;
                Ok(SignResult::Message(SignedMessage {
                    signature: format!("0x{}", hex::encode(signature.to_vec())),
                    signer,
                }))
            })
        });

        match self.orchestrator.invoke(&notify, op).await? {
            SignResult::Message(signed) => Ok(signed),
            SignResult::Transaction(_) => Err(KeyringError::Unexpected(
                "typed data signing returned a transaction result".to_string(),
            )),
        }
    }

    /// Re-issue the last pending signing operation (prompt dismissed before
    /// the device answered).
    pub async fn resend(&self) -> Result<SignResult, KeyringError> {
        self.orchestrator.resend().await
    }

    /// Abandon the pending signing operation. Does not stop the hardware;
    /// it only suppresses any further reaction to its eventual result.
    pub fn reset_resend(&self) {
        self.orchestrator.reset_resend();
    }

    pub fn has_pending_sign(&self) -> bool {
        self.orchestrator.has_pending()
    }

    async fn resolve_hd_path(&self, address: &str) -> Result<String, KeyringError> {
        if let Some(account) = self.index.lock().get(address) {
            return Ok(account.hd_path.clone());
        }
        let account = self.rederive_bare_account(address).await?;
        Ok(account.hd_path)
    }

    /// Bounded linear re-derivation scan for addresses persisted without a
    /// cached path. On a hit the account joins the index with full details.
    async fn rederive_bare_account(&self, address: &str) -> Result<Account, KeyringError> {
        let is_bare = self
            .bare_addresses
            .lock()
            .iter()
            .any(|a| a.eq_ignore_ascii_case(address.trim()));
        if !is_bare {
            return Err(KeyringError::AddressNotFound(address.to_string()));
        }

        let path_type = self.hd_path_type();
        info!(
            backend = self.backend.name(),
            address,
            %path_type,
            max_index = MAX_INDEX,
            "address cache miss, scanning derivation range"
        );

        self.session.open().await?;
        let result = self.scan_for_address(path_type, address).await;
        self.session.close().await;
        let account = result?;

        self.bare_addresses
            .lock()
            .retain(|a| !a.eq_ignore_ascii_case(address.trim()));
        self.index.lock().insert(account.clone());
        Ok(account)
    }

    async fn scan_for_address(
        &self,
        path_type: HdPathType,
        address: &str,
    ) -> Result<Account, KeyringError> {
        let base = self
            .deriver
            .base_public_key(self.backend.as_ref(), path_type)
            .await?;
        for i in 0..MAX_INDEX {
            let derived = self.derive_with_recovery(path_type, i, false).await?;
            if derived.address.eq_ignore_ascii_case(address.trim()) {
                return Ok(Account {
                    address: derived.address,
                    index: i,
                    path_type,
                    hd_path: derive_path(path_type, i)?,
                    base_public_key: Some(base),
                });
            }
        }
        Err(KeyringError::IndexNotFound(address.to_string()))
    }

    /// Silent derivation with one bounded reconnect-and-retry on a
    /// transient transport failure.
    async fn derive_with_recovery(
        &self,
        path_type: HdPathType,
        index: u32,
        display: bool,
    ) -> Result<crate::hardware::backend::DerivedAddress, KeyringError> {
        match self
            .deriver
            .derive(self.backend.as_ref(), path_type, index, display)
            .await
        {
            Err(err) if err.is_transient() => {
                warn!(index, error = %err, "transient failure during derivation, reconnecting once");
                self.deriver.clear();
                self.session.reconnect().await?;
                self.deriver
                    .derive(self.backend.as_ref(), path_type, index, display)
                    .await
            }
            other => other,
        }
    }
}

/// Recover the signer from `signature` over `message` and require it to be
/// the requested address (checksum-normalized, case-insensitive). A
/// mismatch is fatal: returning the signature would hand the caller a
/// signature for a different account than it asked for.
fn verify_signer(
    signature: &Signature,
    message: RecoveryMessage,
    expected: &str,
) -> Result<String, KeyringError> {
    let recovered = signature
        .recover(message)
        .map_err(|e| KeyringError::unexpected("signature recovery", e))?;
    let expected_address = Address::from_str(expected)
        .map_err(|_| KeyringError::AddressNotFound(expected.to_string()))?;
    let recovered_checksum = to_checksum(&recovered, None);
    if recovered != expected_address {
        return Err(KeyringError::SignatureAddressMismatch {
            expected: expected.to_string(),
            recovered: recovered_checksum,
        });
    }
    Ok(recovered_checksum)
}

/// Message/typed-data signatures arrive as split parts or as one compact
/// 65-byte `r || s || v` blob.
fn message_signature(device_sig: &DeviceSignature) -> Result<Signature, KeyringError> {
    match device_sig {
        DeviceSignature::Parts { v, r, s } => {
            Ok(crate::signing::transaction::signature_from_parts(*v, r, s))
        }
        DeviceSignature::SignedBlob(blob) => {
            if blob.len() != 65 {
                return Err(KeyringError::Unexpected(format!(
                    "compact signature must be 65 bytes, got {}",
                    blob.len()
                )));
            }
            let mut r = [0u8; 32];
            let mut s = [0u8; 32];
            r.copy_from_slice(&blob[..32]);
            s.copy_from_slice(&blob[32..64]);
            Ok(crate::signing::transaction::signature_from_parts(
                blob[64] as u64,
                &r,
                &s,
            ))
        }
    }
}
