// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Boot-time repair of interrupted writes.
//!
//! Two passes exist. `fixup_variable_state` runs during initialization,
//! before the chain is verified: it records where the known unprotected
//! variables live and eliminates superseded duplicates, so verification
//! sees exactly the set the last committed digest covered.
//! `fixup_hmac_variable` runs lazily before the first write of a boot: it
//! turns the repair verification decided on into physical state-byte
//! patches, once the write back-end is available.

use crate::counter::ReplayCounter;
use crate::error::Error;
use crate::store_impl::ProtectedStore;
use crate::store_impl::UnprotectedSlot;
use protvar_format::VariableState;
use protvar_storage::ContextAdapter;

impl<C: ContextAdapter, R: ReplayCounter> ProtectedStore<C, R> {
    /// Record the unprotected-variable index and delete any
    /// in-delete-transition record whose (name, vendor) has a live
    /// counterpart elsewhere in the store.
    ///
    /// Cache-only patches; flash copies of the duplicates stay untouched
    /// until a reclaim removes them physically.
    pub(crate) fn fixup_variable_state(&mut self) -> Result<(), Error> {
        self.unprotected = Default::default();

        let entries = self.cache.entries()?;
        let mut duplicates = Vec::new();

        for entry in &entries {
            if !entry.is_live_or_in_delete() {
                continue;
            }

            if let Some(slot) = self.known_unprotected_slot(entry) {
                let slot_ref = match slot {
                    UnprotectedSlot::HmacInDel => &mut self.unprotected.hmac_in_del,
                    UnprotectedSlot::HmacAdded => &mut self.unprotected.hmac_added,
                    UnprotectedSlot::ErrorFlag => &mut self.unprotected.error_flag,
                };
                if slot_ref.is_none() {
                    *slot_ref = Some(entry.offset);
                }
                continue;
            }

            if entry.state() != Some(VariableState::InDeleteTransition) {
                continue;
            }

            let has_live_counterpart = entries.iter().any(|other| {
                other.offset != entry.offset
                    && other.state() == Some(VariableState::Added)
                    && other.is_variable(&entry.name, &entry.vendor_guid)
            });
            if has_live_counterpart {
                tracing::debug!(
                    name = %entry.name_lossy(),
                    offset = entry.offset,
                    "removing superseded in-delete copy"
                );
                duplicates.push(entry.offset);
            }
        }

        for offset in duplicates {
            self.cache
                .patch_state(offset, VariableState::Deleted.raw())?;
        }
        Ok(())
    }

    /// Apply verification's repair decision to the physical store.
    ///
    /// Idempotent, and deferred until the first write of a boot because
    /// the write back-end may not exist at initialization time. After this
    /// returns, the in-delete MetaDataHmacVar slot is empty and writes are
    /// accepted.
    pub fn fixup_hmac_variable(&mut self) -> Result<(), Error> {
        if self.write_ready {
            return Ok(());
        }

        let targets = [
            (self.unprotected.hmac_in_del, VariableState::Deleted),
            (self.unprotected.hmac_added, VariableState::Added),
        ];
        for (offset, target) in targets {
            let Some(offset) = offset else { continue };
            let entry = self.cache.get(offset)?;
            if entry.raw_state != target.raw() {
                tracing::debug!(offset, state = target.raw(), "patching metadata copy state");
                self.adapter.update_variable_store(offset, target.raw())?;
                self.cache.patch_state(offset, target.raw())?;
            }
        }

        self.unprotected.hmac_in_del = None;
        self.write_ready = true;
        Ok(())
    }
}
