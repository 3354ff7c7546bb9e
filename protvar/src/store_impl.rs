// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::cache::StoreCache;
use crate::codec;
use crate::codec::CipherPayload;
use crate::counter::ReplayCounter;
use crate::error::Error;
use crate::integrity;
use crate::integrity::DigestVar;
use crate::integrity::HmacKey;
use crate::integrity::HmacRepair;
use protvar_format::Guid;
use protvar_format::VariableState;
use protvar_format::METADATA_HMAC_VARIABLE_GUID;
use protvar_format::METADATA_HMAC_VARIABLE_NAME;
use protvar_format::VARIABLE_KEY_SIZE;
use protvar_format::VAR_ERROR_FLAG_GUID;
use protvar_format::VAR_ERROR_FLAG_NAME;
use protvar_storage::ContextAdapter;
use protvar_storage::VariableEntry;
use zerocopy::IntoBytes;
use zeroize::Zeroize;
use zeroize::ZeroizeOnDrop;

/// The variable root key: the master secret every other key derives from.
///
/// Zeroed on drop; never printed.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RootKey([u8; VARIABLE_KEY_SIZE]);

impl RootKey {
    /// Wrap a root key obtained from the platform key service.
    pub fn new(key: [u8; VARIABLE_KEY_SIZE]) -> RootKey {
        RootKey(key)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootKey(..)")
    }
}

/// Offsets of the known unprotected variables.
///
/// These records live outside the integrity chain, so their positions are
/// tracked explicitly: the two MetaDataHmacVar copies drive the crash
/// classifier, and the error-log variable is exempt from protection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct UnprotectedIndex {
    pub hmac_in_del: Option<u32>,
    pub hmac_added: Option<u32>,
    pub error_flag: Option<u32>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum UnprotectedSlot {
    HmacInDel,
    HmacAdded,
    ErrorFlag,
}

/// Offsets of superseded copies between `update` and `write_final`.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct PendingUpdate {
    pub current: Option<u32>,
    pub current_in_del: Option<u32>,
}

/// The protected variable store: the single context object owning the
/// verified cache, the key material, and the write protocol state.
///
/// One instance exists per trust boundary. All operations are synchronous;
/// the embedder serializes access.
pub struct ProtectedStore<C: ContextAdapter, R: ReplayCounter> {
    pub(crate) adapter: C,
    pub(crate) counter: R,
    pub(crate) root_key: RootKey,
    pub(crate) hmac_key: HmacKey,
    pub(crate) cache: StoreCache,
    pub(crate) unprotected: UnprotectedIndex,
    /// Counter value as last read from or synced with the device.
    pub(crate) counter_value: u32,
    /// Set once recovery fixup has run; gates every write path.
    pub(crate) write_ready: bool,
    pub(crate) max_variable_size: u32,
    pub(crate) pending: Option<PendingUpdate>,
}

/// Structural damage found while scanning the store is a corrupt volume,
/// not a backend failure.
fn scan_error(err: protvar_storage::StoreError) -> Error {
    use protvar_storage::StoreError;
    match err {
        StoreError::InvalidStoreHeader | StoreError::MalformedRecord(_) => Error::VolumeCorrupted,
        other => Error::Storage(other),
    }
}

impl<C: ContextAdapter, R: ReplayCounter> ProtectedStore<C, R> {
    /// Initialize the protected variable services for this boot.
    ///
    /// Snapshots the store, rebuilds the trusted cache, repairs duplicate
    /// states left by an interrupted write, and verifies the integrity
    /// chain. On `CompromisedData` the store contents must not be used;
    /// halting is the embedder's policy.
    pub fn initialize(mut adapter: C, mut counter: R, root_key: RootKey) -> Result<Self, Error> {
        tracing::debug!("initializing protected variable store");

        let snapshot = adapter.init_variable_store().map_err(scan_error)?;
        let hmac_key = HmacKey::derive(root_key.as_bytes())?;

        // Offset table of all live and in-delete records, in store order.
        let mut offsets = Vec::new();
        let mut prev = None;
        while let Some(entry) = adapter.next_variable_info(prev).map_err(scan_error)? {
            if entry.is_live_or_in_delete() {
                offsets.push(entry.offset);
            }
            prev = Some(entry.offset);
        }
        tracing::debug!(valid = offsets.len(), "scanned variable store");

        let cache = StoreCache::restore(&snapshot, &offsets)?;
        let counter_value = counter.read()?;
        let max_variable_size = adapter.max_variable_size();

        let mut store = ProtectedStore {
            adapter,
            counter,
            root_key,
            hmac_key,
            cache,
            unprotected: UnprotectedIndex::default(),
            counter_value,
            write_ready: false,
            max_variable_size,
            pending: None,
        };

        store.fixup_variable_state()?;
        store.verify_integrity()?;

        Ok(store)
    }

    /// Which known unprotected variable `entry` is, if any.
    ///
    /// Offsets recorded in the index win; before the index is populated
    /// the reserved (name, GUID) pairs identify the records, with the two
    /// MetaDataHmacVar slots told apart by state.
    pub(crate) fn known_unprotected_slot(&self, entry: &VariableEntry) -> Option<UnprotectedSlot> {
        if self.unprotected.hmac_in_del == Some(entry.offset) {
            return Some(UnprotectedSlot::HmacInDel);
        }
        if self.unprotected.hmac_added == Some(entry.offset) {
            return Some(UnprotectedSlot::HmacAdded);
        }
        if self.unprotected.error_flag == Some(entry.offset) {
            return Some(UnprotectedSlot::ErrorFlag);
        }

        if entry.is_variable(
            METADATA_HMAC_VARIABLE_NAME.as_bytes(),
            &METADATA_HMAC_VARIABLE_GUID,
        ) {
            return match entry.state() {
                Some(VariableState::InDeleteTransition) => Some(UnprotectedSlot::HmacInDel),
                _ => Some(UnprotectedSlot::HmacAdded),
            };
        }
        if entry.is_variable(VAR_ERROR_FLAG_NAME.as_bytes(), &VAR_ERROR_FLAG_GUID) {
            return Some(UnprotectedSlot::ErrorFlag);
        }
        None
    }

    /// Whether `entry` participates in the integrity chain.
    ///
    /// Live records always do; in-delete records still do (their content
    /// was covered when the crash hit), as long as they carry data.
    pub(crate) fn is_valid_protected(&self, entry: &VariableEntry) -> bool {
        match entry.state() {
            Some(VariableState::Added) => self.known_unprotected_slot(entry).is_none(),
            Some(VariableState::InDeleteTransition) => {
                self.known_unprotected_slot(entry).is_none() && !entry.data.is_empty()
            }
            _ => false,
        }
    }

    /// Verify the stored digest against the chain computed from the cache
    /// and the counter device, applying the metadata-only repair the crash
    /// classifier calls for.
    fn verify_integrity(&mut self) -> Result<(), Error> {
        let entries = self.cache.entries()?;

        let mut added_data: Option<&[u8]> = None;
        let mut in_del_data: Option<&[u8]> = None;
        let mut protected: Vec<&VariableEntry> = Vec::new();

        for entry in &entries {
            if !entry.is_live_or_in_delete() {
                continue;
            }
            if self.is_valid_protected(entry) {
                protected.push(entry);
            } else {
                match self.known_unprotected_slot(entry) {
                    Some(UnprotectedSlot::HmacAdded) => added_data = Some(entry.data.as_slice()),
                    Some(UnprotectedSlot::HmacInDel) => in_del_data = Some(entry.data.as_slice()),
                    _ => {}
                }
            }
        }

        if added_data.is_none() && in_del_data.is_none() && protected.is_empty() {
            tracing::debug!("empty store, nothing to verify");
            return Ok(());
        }

        let digest = integrity::compute_digest(
            &self.hmac_key,
            protected.iter().map(|e| DigestVar::from_entry(e)),
            self.counter_value,
        )?;
        let digest_plus = if added_data.is_some() && in_del_data.is_some() {
            Some(integrity::compute_digest(
                &self.hmac_key,
                protected.iter().map(|e| DigestVar::from_entry(e)),
                self.counter_value + 1,
            )?)
        } else {
            None
        };

        let repair = integrity::classify_hmac(
            added_data,
            in_del_data,
            &digest,
            digest_plus.as_ref(),
            protected.len(),
        )?;

        match repair {
            HmacRepair::None => {}
            HmacRepair::PromoteInDel => {
                self.unprotected.hmac_added = self.unprotected.hmac_in_del.take();
            }
            HmacRepair::SwapAddedInDel => {
                core::mem::swap(
                    &mut self.unprotected.hmac_added,
                    &mut self.unprotected.hmac_in_del,
                );
            }
            HmacRepair::AdvanceCounter => {
                self.counter.increment()?;
                self.counter_value += 1;
            }
        }

        tracing::debug!(
            ?repair,
            counter = self.counter_value,
            protected = protected.len(),
            "variable store integrity verified"
        );
        Ok(())
    }

    /// Plain data of the record at `offset`.
    ///
    /// Encrypted payloads are decrypted in place in the cache so repeat
    /// reads skip the key schedule.
    pub fn get_data(&mut self, offset: u32) -> Result<Vec<u8>, Error> {
        let entry = self.cache.get(offset)?;
        if !entry.is_live_or_in_delete() {
            return Err(Error::NotFound);
        }
        if self.known_unprotected_slot(&entry).is_some() {
            return Ok(entry.data);
        }

        match codec::parse_payload(&entry.data) {
            CipherPayload::Encrypted { .. } => {
                let plain = codec::decrypt_payload(
                    self.root_key.as_bytes(),
                    &entry.name,
                    &entry.vendor_guid,
                    entry.attributes,
                    &entry.data,
                )?;
                let region = self.cache.data_region_mut(offset)?;
                codec::rewrite_plain_in_place(region, &plain);
                Ok(plain)
            }
            CipherPayload::Plain(plain) => Ok(plain.to_vec()),
            CipherPayload::Raw(raw) => Ok(raw.to_vec()),
        }
    }

    /// Look up a variable by (name, vendor) and return `(attributes,
    /// plain data)`.
    ///
    /// A live copy is preferred; a not-yet-reclaimed in-delete copy
    /// counts when no live copy exists. Falls back to the cross-trust
    /// lookup service when the local cache has no such record.
    pub fn get_data_by_name(
        &mut self,
        name: &[u8],
        vendor: &Guid,
    ) -> Result<Option<(u32, Vec<u8>)>, Error> {
        if let Some(entry) = self.cache.find(name, vendor)? {
            let data = self.get_data(entry.offset)?;
            return Ok(Some((entry.attributes, data)));
        }
        Ok(self.adapter.find_variable(name, vendor)?)
    }

    /// Whether recovery fixup has run and writes are accepted.
    pub fn is_write_ready(&self) -> bool {
        self.write_ready
    }

    /// Whether the store uses the authenticated record format.
    pub fn auth_format(&self) -> bool {
        self.cache.auth_format()
    }

    /// The counter value as last synced with the device.
    pub fn counter_value(&self) -> u32 {
        self.counter_value
    }

    /// The verified store image, for embedders persisting after reclaim.
    pub fn store_image(&self) -> &[u8] {
        self.cache.image()
    }

    /// Number of live protected variables.
    pub fn protected_count(&self) -> Result<usize, Error> {
        let entries = self.cache.entries()?;
        Ok(entries
            .iter()
            .filter(|e| e.state() == Some(VariableState::Added) && self.is_valid_protected(e))
            .count())
    }
}
