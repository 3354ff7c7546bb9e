// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The single legal path for mutating a protected variable.
//!
//! An update stages everything recoverable first: superseded copies move
//! to in-delete-transition, the refreshed MetaDataHmacVar is built at
//! counter+1 and handed back glued in front of the new variable bytes, so
//! the embedder commits both records in one contiguous flash write. Until
//! [`ProtectedStore::write_final`] runs, every effect can be undone by the
//! boot-time crash classifier; `write_final` is the point of no return.

use crate::codec;
use crate::codec::EncryptOutcome;
use crate::counter::ReplayCounter;
use crate::error::Error;
use crate::integrity;
use crate::integrity::DigestVar;
use crate::store_impl::PendingUpdate;
use crate::store_impl::ProtectedStore;
use crate::store_impl::UnprotectedSlot;
use protvar_format::Guid;
use protvar_format::VariableAttributes;
use protvar_format::VariableState;
use protvar_format::METADATA_HMAC_VARIABLE_GUID;
use protvar_format::METADATA_HMAC_VARIABLE_NAME;
use protvar_format::VAR_ADDED;
use protvar_format::VAR_ERROR_FLAG_GUID;
use protvar_format::VAR_ERROR_FLAG_NAME;
use protvar_storage::image::build_record;
use protvar_storage::image::RecordSpec;
use protvar_storage::AuthFields;
use protvar_storage::ContextAdapter;
use zerocopy::IntoBytes;

/// A new variable (or new content for an existing one).
#[derive(Clone, Debug)]
pub struct NewVariable {
    /// UTF-16LE name, NUL terminator included.
    pub name: Vec<u8>,
    /// Vendor GUID qualifying the name.
    pub vendor_guid: Guid,
    /// Attribute word; append-write is stripped before storage.
    pub attributes: u32,
    /// Plaintext payload; the coordinator encrypts it.
    pub data: Vec<u8>,
    /// Auth header fields, for authenticated-format stores.
    pub auth: Option<AuthFields>,
}

impl NewVariable {
    fn is_metadata_hmac(&self) -> bool {
        self.name == METADATA_HMAC_VARIABLE_NAME.as_bytes()
            && self.vendor_guid == METADATA_HMAC_VARIABLE_GUID
    }

    fn is_error_flag(&self) -> bool {
        self.name == VAR_ERROR_FLAG_NAME.as_bytes() && self.vendor_guid == VAR_ERROR_FLAG_GUID
    }
}

/// The staged write an update produced.
///
/// `buffer` holds the refreshed MetaDataHmacVar immediately followed by
/// the new variable record (when the update is not a pure delete). The
/// embedder writes the whole buffer at a free offset in one contiguous
/// flash program, then calls [`ProtectedStore::write_final`] with that
/// offset.
#[derive(Debug)]
pub struct UpdateOutput {
    /// The two records to program in one contiguous flash write.
    pub buffer: Vec<u8>,
    /// Size of the MetaDataHmacVar record at the front of `buffer`; zero
    /// for unprotected targets.
    pub hmac_record_size: u32,
    /// Size of the new variable record following it, if any.
    pub variable_record_size: u32,
}

impl<C: ContextAdapter, R: ReplayCounter> ProtectedStore<C, R> {
    /// Stage an add, replace, or delete of one variable.
    ///
    /// `current` is the live copy being superseded (`None` when adding),
    /// `current_in_del` a leftover in-delete copy of the same variable,
    /// and `new` the replacement content (`None` for a pure delete).
    pub fn update(
        &mut self,
        current: Option<u32>,
        current_in_del: Option<u32>,
        new: Option<NewVariable>,
    ) -> Result<UpdateOutput, Error> {
        if !self.write_ready {
            return Err(Error::NotReady);
        }
        if current.is_none() && current_in_del.is_none() && new.is_none() {
            return Err(Error::InvalidParameter);
        }

        // The integrity metadata is managed only by this library.
        if new.as_ref().is_some_and(|n| n.is_metadata_hmac()) {
            return Err(Error::AccessDenied);
        }
        let current_entry = current.map(|offset| self.cache.get(offset)).transpose()?;
        if let Some(entry) = &current_entry {
            if matches!(
                self.known_unprotected_slot(entry),
                Some(UnprotectedSlot::HmacAdded) | Some(UnprotectedSlot::HmacInDel)
            ) {
                return Err(Error::AccessDenied);
            }
        }
        if let Some(offset) = current_in_del {
            let entry = self.cache.get(offset)?;
            if entry.state() != Some(VariableState::InDeleteTransition) {
                return Err(Error::InvalidParameter);
            }
        }

        // The error-log variable bypasses encryption and the chain.
        let unprotected_target = new.as_ref().is_some_and(|n| n.is_error_flag())
            || current_entry.as_ref().is_some_and(|e| {
                matches!(
                    self.known_unprotected_slot(e),
                    Some(UnprotectedSlot::ErrorFlag)
                )
            });
        if unprotected_target {
            return self.update_unprotected(current, current_in_del, new);
        }

        // Build the new record up front; nothing is staged yet if the
        // payload turns out oversized.
        let auth_format = self.cache.auth_format();
        let new_record = match &new {
            Some(new_var) => {
                let attributes =
                    u32::from(VariableAttributes::from(new_var.attributes).with_append_write(false));
                let data = match codec::encrypt_payload(
                    self.root_key.as_bytes(),
                    &new_var.name,
                    &new_var.vendor_guid,
                    attributes,
                    &new_var.data,
                )? {
                    EncryptOutcome::Encrypted(payload) => payload,
                    EncryptOutcome::Plaintext => new_var.data.clone(),
                };
                let record = build_record(
                    auth_format,
                    &RecordSpec {
                        state: VAR_ADDED,
                        attributes,
                        vendor_guid: new_var.vendor_guid,
                        name: &new_var.name,
                        data: &data,
                        auth: new_var.auth,
                    },
                );
                if record.len() as u32 > self.max_variable_size {
                    return Err(Error::BadBufferSize);
                }
                Some((record, attributes, data))
            }
            None => None,
        };

        // Stage: supersede the current copy...
        if let Some(offset) = current {
            let state = VariableState::InDeleteTransition.raw();
            self.adapter.update_variable_store(offset, state)?;
            self.cache.patch_state(offset, state)?;
        }

        // ...retire the live MetaDataHmacVar the same way...
        if let Some(old) = self.unprotected.hmac_added {
            self.cache.get(old).map_err(|_| Error::NotFound)?;
            let state = VariableState::InDeleteTransition.raw();
            self.adapter.update_variable_store(old, state)?;
            self.cache.patch_state(old, state)?;
            self.unprotected.hmac_in_del = Some(old);
            self.unprotected.hmac_added = None;
        }

        // ...and refresh the chain at counter+1 over what will be the
        // post-write content set.
        self.counter_value = self.counter.read()?;
        let entries = self.cache.entries()?;
        let selected: Vec<_> = entries
            .iter()
            .filter(|e| {
                Some(e.offset) != current
                    && Some(e.offset) != current_in_del
                    && self.is_valid_protected(e)
            })
            .collect();

        // Payloads decrypted in place must go back to their flash-true
        // form before they are fed to the chain.
        let mut rebuilt = Vec::with_capacity(selected.len());
        for entry in &selected {
            rebuilt.push(codec::reencrypt_cached_payload(
                self.root_key.as_bytes(),
                &entry.name,
                &entry.vendor_guid,
                entry.attributes,
                &entry.data,
            )?);
        }

        let mut digest_vars: Vec<DigestVar<'_>> = selected
            .iter()
            .zip(&rebuilt)
            .map(|(entry, flash_true)| DigestVar {
                name: &entry.name,
                vendor_guid: entry.vendor_guid,
                attributes: entry.attributes,
                data: flash_true.as_deref().unwrap_or(&entry.data),
                auth: entry.auth.unwrap_or(AuthFields::ZEROED),
            })
            .collect();
        if let Some((_, attributes, data)) = &new_record {
            let new_var = new.as_ref().unwrap();
            digest_vars.push(DigestVar {
                name: &new_var.name,
                vendor_guid: new_var.vendor_guid,
                attributes: *attributes,
                data,
                auth: new_var.auth.unwrap_or(AuthFields::ZEROED),
            });
        }
        let digest =
            integrity::compute_digest(&self.hmac_key, digest_vars, self.counter_value + 1)?;

        let hmac_record = build_record(
            auth_format,
            &RecordSpec {
                state: VAR_ADDED,
                attributes: VariableAttributes::NV_BS_RT.into(),
                vendor_guid: METADATA_HMAC_VARIABLE_GUID,
                name: METADATA_HMAC_VARIABLE_NAME.as_bytes(),
                data: &digest,
                auth: None,
            },
        );

        let mut buffer = hmac_record.clone();
        let variable_record_size = match &new_record {
            Some((record, ..)) => {
                buffer.extend_from_slice(record);
                record.len() as u32
            }
            None => 0,
        };

        self.pending = Some(PendingUpdate {
            current,
            current_in_del,
        });

        tracing::debug!(
            hmac_size = hmac_record.len(),
            variable_size = variable_record_size,
            counter = self.counter_value + 1,
            "staged protected variable update"
        );

        Ok(UpdateOutput {
            buffer,
            hmac_record_size: hmac_record.len() as u32,
            variable_record_size,
        })
    }

    /// Update path for the known unprotected variables: no encryption, no
    /// chain refresh, old copies retired immediately.
    fn update_unprotected(
        &mut self,
        current: Option<u32>,
        current_in_del: Option<u32>,
        new: Option<NewVariable>,
    ) -> Result<UpdateOutput, Error> {
        for offset in [current, current_in_del].into_iter().flatten() {
            let state = VariableState::Deleted.raw();
            self.adapter.update_variable_store(offset, state)?;
            self.cache.patch_state(offset, state)?;
        }
        // The new copy's offset is unknown until it is written.
        self.unprotected.error_flag = None;
        self.pending = None;

        let buffer = match &new {
            Some(new_var) => build_record(
                self.cache.auth_format(),
                &RecordSpec {
                    state: VAR_ADDED,
                    attributes: new_var.attributes,
                    vendor_guid: new_var.vendor_guid,
                    name: &new_var.name,
                    data: &new_var.data,
                    auth: new_var.auth,
                },
            ),
            None => Vec::new(),
        };
        let variable_record_size = buffer.len() as u32;

        Ok(UpdateOutput {
            buffer,
            hmac_record_size: 0,
            variable_record_size,
        })
    }

    /// Commit a staged update after its buffer reached the flash at
    /// `offset`. Point of no return.
    ///
    /// Advances the replay counter, retires the superseded MetaDataHmacVar
    /// and variable copies for good, records the new live offsets, and
    /// syncs the cache. A counter failure here is fatal to the write.
    pub fn write_final(&mut self, buffer: &[u8], offset: u32) -> Result<(), Error> {
        // Nothing was written: it was a pure delete of an unprotected
        // variable.
        if buffer.is_empty() || offset == 0 {
            return Ok(());
        }

        self.cache.write_bytes(offset, buffer)?;

        let written = self.cache.get(offset)?;
        if written.is_variable(VAR_ERROR_FLAG_NAME.as_bytes(), &VAR_ERROR_FLAG_GUID) {
            self.unprotected.error_flag = Some(offset);
            return Ok(());
        }

        // Retire the superseded variable copies before the counter moves:
        // with them out of the chain's view, the store matches the new
        // digest at counter+1, which is exactly the state the crash
        // classifier repairs by advancing the counter.
        if let Some(pending) = self.pending.take() {
            for superseded in [pending.current, pending.current_in_del]
                .into_iter()
                .flatten()
            {
                let state = VariableState::Deleted.raw();
                self.adapter.update_variable_store(superseded, state)?;
                self.cache.patch_state(superseded, state)?;
            }
        }

        self.counter.increment()?;
        self.counter_value += 1;

        if let Some(old) = self.unprotected.hmac_in_del.take() {
            let state = VariableState::Deleted.raw();
            self.adapter.update_variable_store(old, state)?;
            self.cache.patch_state(old, state)?;
        }
        self.unprotected.hmac_added = Some(offset);

        tracing::debug!(
            offset,
            counter = self.counter_value,
            "finalized protected variable update"
        );
        Ok(())
    }
}
