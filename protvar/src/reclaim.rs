// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Garbage collection of the variable store.
//!
//! Compaction works on the verified cache, never the flash copy, and makes
//! a single pass in store order: the digest iterates the store in order,
//! so a reclaim that reordered live records would break the chain it is
//! not recomputing.

use crate::codec;
use crate::counter::ReplayCounter;
use crate::error::Error;
use crate::store_impl::ProtectedStore;
use crate::store_impl::UnprotectedIndex;
use crate::store_impl::UnprotectedSlot;
use protvar_format::header_size;
use protvar_format::VariableAttributes;
use protvar_format::VariableState;
use protvar_format::VAR_ADDED;
use protvar_storage::image::first_variable_offset;
use protvar_storage::image::read_record;
use protvar_storage::ContextAdapter;

/// Per-attribute-class space accounting.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    /// Bytes held by hardware-error-record variables.
    pub hw_err: u32,
    /// Bytes held by all other variables.
    pub common: u32,
    /// Subset of `common` attributed to user variables.
    pub common_user: u32,
}

/// Space quotas the compacted store must respect.
#[derive(Copy, Clone, Debug)]
pub struct SpaceBudget {
    /// Cap on hardware-error-record bytes.
    pub hw_err_max: u32,
    /// Cap on all other variable bytes.
    pub common_max: u32,
    /// Cap on the user-variable share of `common_max`.
    pub common_user_max: u32,
}

/// Result of a reclaim pass.
#[derive(Debug)]
pub struct ReclaimOutcome {
    /// Start of free space in the compacted store.
    pub last_offset: u32,
    /// Recomputed space accounting over the kept records.
    pub usage: SpaceUsage,
    /// Where the pending new buffer was appended, if one was given. Pass
    /// this to [`ProtectedStore::write_final`] after persisting the image.
    pub appended_offset: Option<u32>,
}

impl<C: ContextAdapter, R: ReplayCounter> ProtectedStore<C, R> {
    /// Compact the store, dropping dead records and the superseded copies
    /// of the in-flight update, promoting orphaned in-delete records, and
    /// appending `pending_new` (the staged HMAC + variable buffer).
    ///
    /// The cache image is replaced and the unprotected index rewritten;
    /// the embedder persists [`ProtectedStore::store_image`] to flash and
    /// finalizes with `write_final`.
    pub fn reclaim(
        &mut self,
        current: Option<u32>,
        current_in_del: Option<u32>,
        pending_new: Option<&[u8]>,
        budget: &SpaceBudget,
    ) -> Result<ReclaimOutcome, Error> {
        if !self.write_ready {
            return Err(Error::NotReady);
        }

        let auth_format = self.cache.auth_format();
        let store_size = self.cache.store_size();
        let old_image = self.cache.image().to_vec();
        let entries = self.cache.entries()?;

        let superseded =
            |offset: u32| Some(offset) == current || Some(offset) == current_in_del;

        let mut new_image = vec![0xFFu8; store_size as usize];
        new_image[..first_variable_offset() as usize]
            .copy_from_slice(&old_image[..first_variable_offset() as usize]);

        let mut cursor = first_variable_offset();
        let mut usage = SpaceUsage::default();
        let mut index = UnprotectedIndex::default();

        for entry in &entries {
            if superseded(entry.offset) {
                continue;
            }

            let promote = match entry.state() {
                Some(VariableState::Added) => false,
                Some(VariableState::InDeleteTransition) => {
                    if self.known_unprotected_slot(entry).is_some() {
                        // The retired integrity-metadata copy dies here.
                        continue;
                    }
                    let has_live_counterpart = entries.iter().any(|other| {
                        other.offset != entry.offset
                            && !superseded(other.offset)
                            && other.state() == Some(VariableState::Added)
                            && other.is_variable(&entry.name, &entry.vendor_guid)
                    });
                    if has_live_counterpart {
                        continue;
                    }
                    // Orphan: the crash that left it behind also lost its
                    // replacement, so it is still the live content.
                    true
                }
                _ => continue,
            };

            let src = entry.offset as usize..(entry.offset + entry.total_size) as usize;
            let dst = cursor as usize..cursor as usize + entry.total_size as usize;
            new_image[dst].copy_from_slice(&old_image[src]);
            if promote {
                tracing::debug!(
                    name = %entry.name_lossy(),
                    "promoting orphaned in-delete record"
                );
                new_image[cursor as usize + 4] = VAR_ADDED;
            }

            // The compacted image goes back to flash, so payloads that
            // were decrypted in place in the cache are restored to their
            // as-stored ciphertext form.
            if self.known_unprotected_slot(entry).is_none() {
                if let Some(flash_true) = codec::reencrypt_cached_payload(
                    self.root_key.as_bytes(),
                    &entry.name,
                    &entry.vendor_guid,
                    entry.attributes,
                    &entry.data,
                )? {
                    if flash_true.len() == entry.data.len() {
                        let data_at =
                            cursor + header_size(auth_format) + entry.name.len() as u32;
                        new_image[data_at as usize..data_at as usize + flash_true.len()]
                            .copy_from_slice(&flash_true);
                    }
                }
            }

            match self.known_unprotected_slot(entry) {
                Some(UnprotectedSlot::HmacAdded) => index.hmac_added = Some(cursor),
                Some(UnprotectedSlot::HmacInDel) => index.hmac_in_del = Some(cursor),
                Some(UnprotectedSlot::ErrorFlag) => index.error_flag = Some(cursor),
                None => {}
            }

            account(&mut usage, entry.attributes, entry.total_size, || {
                self.adapter.is_user_variable(entry)
            });
            cursor += entry.total_size;
        }

        let mut appended_offset = None;
        if let Some(buffer) = pending_new.filter(|b| !b.is_empty()) {
            if cursor as usize + buffer.len() > store_size as usize {
                return Err(Error::OutOfResources);
            }

            // The class accounting keys off the record at the front of the
            // buffer, the way the original accounting did.
            let first = read_record(buffer, 0, buffer.len() as u32, auth_format)
                .map_err(|_| Error::InvalidParameter)?
                .ok_or(Error::InvalidParameter)?;
            account(&mut usage, first.attributes, buffer.len() as u32, || {
                self.adapter.is_user_variable(&first)
            });

            if usage.hw_err > budget.hw_err_max
                || usage.common > budget.common_max
                || usage.common_user > budget.common_user_max
            {
                return Err(Error::OutOfResources);
            }

            new_image[cursor as usize..cursor as usize + buffer.len()]
                .copy_from_slice(buffer);
            appended_offset = Some(cursor);
            cursor += buffer.len() as u32;
        }

        self.cache.replace_image(new_image)?;
        self.unprotected = index;
        // Superseded copies are physically gone; nothing left to retire.
        self.pending = None;

        tracing::debug!(
            last_offset = cursor,
            ?usage,
            "reclaimed variable store"
        );

        Ok(ReclaimOutcome {
            last_offset: cursor,
            usage,
            appended_offset,
        })
    }
}

fn account(usage: &mut SpaceUsage, attributes: u32, size: u32, is_user: impl FnOnce() -> bool) {
    if VariableAttributes::from(attributes).hardware_error_record() {
        usage.hw_err += size;
    } else {
        usage.common += size;
        if is_user() {
            usage.common_user += size;
        }
    }
}
