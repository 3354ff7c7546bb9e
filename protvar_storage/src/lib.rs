// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Abstractions over the host services a protected variable store is built
//! on: the store-context adapter trait, a bounds-checked record cursor over
//! flat store images, and an in-memory flash implementation for tests and
//! embedders without real hardware.

#![forbid(unsafe_code)]

pub mod image;
pub mod in_memory;

use protvar_format::EfiTime;
use protvar_format::Guid;
use protvar_format::VariableState;
use thiserror::Error;

/// Errors from the storage boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store header fields are inconsistent.
    #[error("variable store header is malformed")]
    InvalidStoreHeader,
    /// A record declares sizes that do not fit in the store.
    #[error("record at {0:#x} has malformed size fields")]
    MalformedRecord(u32),
    /// An offset does not point at a record.
    #[error("no record at offset {0:#x}")]
    NotFound(u32),
    /// An offset lies outside the store image.
    #[error("offset {0:#x} is outside the store")]
    OutOfBounds(u32),
    /// Error committing a change to the backing store.
    #[error("error committing data to the backing store")]
    Commit(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Auth-format-only header fields of a record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AuthFields {
    pub monotonic_count: u64,
    pub timestamp: EfiTime,
    pub pub_key_index: u32,
}

impl AuthFields {
    /// All-zero auth fields, fed to the integrity digest when absent.
    pub const ZEROED: AuthFields = AuthFields {
        monotonic_count: 0,
        timestamp: EfiTime::ZEROED,
        pub_key_index: 0,
    };
}

/// A parsed variable record, detached from the image it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariableEntry {
    /// Offset of the record header from the store base. Stable identity of
    /// the record until it is physically reclaimed.
    pub offset: u32,
    /// Raw state byte as stored.
    pub raw_state: u8,
    pub attributes: u32,
    pub vendor_guid: Guid,
    /// UTF-16LE name, NUL terminator included.
    pub name: Vec<u8>,
    pub data: Vec<u8>,
    /// Present only in the authenticated store format.
    pub auth: Option<AuthFields>,
    /// Aligned size of the whole record.
    pub total_size: u32,
}

impl VariableEntry {
    /// Decoded lifecycle state; `None` for undefined encodings.
    pub fn state(&self) -> Option<VariableState> {
        VariableState::from_raw(self.raw_state)
    }

    /// Live, or superseded but not yet reclaimed.
    pub fn is_live_or_in_delete(&self) -> bool {
        matches!(
            self.state(),
            Some(VariableState::Added) | Some(VariableState::InDeleteTransition)
        )
    }

    /// Whether this record is the given (name, vendor) variable.
    pub fn is_variable(&self, name: &[u8], vendor: &Guid) -> bool {
        self.name == name && self.vendor_guid == *vendor
    }

    /// Lossy printable name, for diagnostics only.
    pub fn name_lossy(&self) -> String {
        let units: Vec<u16> = self
            .name
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }
}

/// A one-time snapshot of the raw store taken at initialization.
#[derive(Clone, Debug)]
pub struct StoreSnapshot {
    /// The raw store image, store header included.
    pub image: Vec<u8>,
    /// Whether records use the authenticated header format.
    pub auth_format: bool,
}

/// Host services consumed by the protected variable library.
///
/// One adapter exists per trust boundary; all methods are synchronous and
/// the caller serializes access. Implementors store and retrieve bytes; all
/// integrity and confidentiality logic lives above this trait.
pub trait ContextAdapter {
    /// Largest single record the backing store accepts.
    fn max_variable_size(&self) -> u32;

    /// Snapshot the raw store for one-time cache construction.
    fn init_variable_store(&mut self) -> Result<StoreSnapshot, StoreError>;

    /// Read the record at `offset`.
    fn get_variable_info(&self, offset: u32) -> Result<VariableEntry, StoreError>;

    /// Return the record after the one at `prev`, or the first record when
    /// `prev` is `None`. Forward-only and restartable; returns `Ok(None)`
    /// at the end of the log.
    fn next_variable_info(&self, prev: Option<u32>) -> Result<Option<VariableEntry>, StoreError>;

    /// Patch the state byte of the record at `offset` in place.
    ///
    /// This is the only mutation the library ever performs through the
    /// adapter; everything else goes through whole-record writes done by
    /// the embedder.
    fn update_variable_store(&mut self, offset: u32, state: u8) -> Result<(), StoreError>;

    /// Whether the record counts against the user-variable quota.
    fn is_user_variable(&self, entry: &VariableEntry) -> bool;

    /// Cross-trust lookup of a variable's plain payload by name, for read
    /// paths that cannot decrypt locally. Returns `(attributes, data)`.
    fn find_variable(
        &mut self,
        name: &[u8],
        vendor: &Guid,
    ) -> Result<Option<(u32, Vec<u8>)>, StoreError>;
}
