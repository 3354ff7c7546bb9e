// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The trusted in-memory mirror of the on-flash variable store.
//!
//! Reconstructed once at initialization from a verified snapshot plus the
//! offset table of valid records, with tombstone records filling the gaps
//! left by invalid ones so that every offset keeps meaning the same record
//! it meant on flash. After verification this image, not the flash, is the
//! source of truth for reads.

use crate::error::Error;
use protvar_format::align4;
use protvar_format::header_size;
use protvar_format::utf16_lit;
use protvar_format::Guid;
use protvar_format::VariableState;
use protvar_storage::image::build_record;
use protvar_storage::image::first_variable_offset;
use protvar_storage::image::read_record;
use protvar_storage::image::read_store_header;
use protvar_storage::image::RecordSpec;
use protvar_storage::image::VariableCursor;
use protvar_storage::StoreError;
use protvar_storage::StoreSnapshot;
use protvar_storage::VariableEntry;
use zerocopy::IntoBytes;

/// The congruent in-memory image of the variable store.
#[derive(Debug)]
pub(crate) struct StoreCache {
    image: Vec<u8>,
    store_size: u32,
    auth_format: bool,
}

impl StoreCache {
    /// Rebuild a congruent image from `snapshot`, keeping only the records
    /// named by `offsets` (ascending, store order) and tombstoning the
    /// gaps between them.
    pub fn restore(snapshot: &StoreSnapshot, offsets: &[u32]) -> Result<StoreCache, Error> {
        let (header, auth_format) =
            read_store_header(&snapshot.image).map_err(|_| Error::VolumeCorrupted)?;
        if auth_format != snapshot.auth_format {
            return Err(Error::VolumeCorrupted);
        }

        let store_size = header.size;
        let mut image = vec![0xFF; store_size as usize];
        image[..first_variable_offset() as usize]
            .copy_from_slice(&snapshot.image[..first_variable_offset() as usize]);

        let mut expected = first_variable_offset();
        for (index, &offset) in offsets.iter().enumerate() {
            if offset < expected || offset >= store_size {
                return Err(Error::VolumeCorrupted);
            }

            let entry = read_record(&snapshot.image, offset, store_size, auth_format)
                .map_err(|_| Error::VolumeCorrupted)?
                .ok_or(Error::VolumeCorrupted)?;
            let record_end = offset
                .checked_add(entry.total_size)
                .ok_or(Error::VolumeCorrupted)?;
            if record_end > store_size {
                return Err(Error::VolumeCorrupted);
            }

            // Bridge the gap to this record with a dead dummy so cursor
            // walks see a contiguous log.
            if offset > expected {
                write_tombstone(&mut image, expected, offset - expected, auth_format, index)?;
            }

            image[offset as usize..record_end as usize].copy_from_slice(
                &snapshot.image[offset as usize..record_end as usize],
            );
            expected = record_end;
        }

        Ok(StoreCache {
            image,
            store_size,
            auth_format,
        })
    }

    pub fn auth_format(&self) -> bool {
        self.auth_format
    }

    pub fn store_size(&self) -> u32 {
        self.store_size
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Read the record at `offset`.
    pub fn get(&self, offset: u32) -> Result<VariableEntry, Error> {
        match read_record(&self.image, offset, self.store_size, self.auth_format) {
            Ok(Some(entry)) => Ok(entry),
            Ok(None) => Err(Error::NotFound),
            Err(StoreError::MalformedRecord(_)) => Err(Error::VolumeCorrupted),
            Err(err) => Err(err.into()),
        }
    }

    /// Lazy walk over all records in store order.
    pub fn iter(&self) -> VariableCursor<'_> {
        VariableCursor::new(&self.image, self.store_size, self.auth_format)
    }

    /// Collect the records in store order, failing on a malformed log.
    pub fn entries(&self) -> Result<Vec<VariableEntry>, Error> {
        self.iter()
            .collect::<Result<_, _>>()
            .map_err(|_| Error::VolumeCorrupted)
    }

    /// First Added copy of (name, vendor), else first live in-delete copy.
    pub fn find(&self, name: &[u8], vendor: &Guid) -> Result<Option<VariableEntry>, Error> {
        let mut in_delete = None;
        for entry in self.iter() {
            let entry = entry.map_err(|_| Error::VolumeCorrupted)?;
            if !entry.is_variable(name, vendor) {
                continue;
            }
            match entry.state() {
                Some(VariableState::Added) => return Ok(Some(entry)),
                Some(VariableState::InDeleteTransition) => {
                    in_delete.get_or_insert(entry);
                }
                _ => {}
            }
        }
        Ok(in_delete)
    }

    /// Patch the state byte of the record at `offset`.
    pub fn patch_state(&mut self, offset: u32, state: u8) -> Result<(), Error> {
        self.get(offset)?;
        self.image[offset as usize + 4] = state;
        Ok(())
    }

    /// Overwrite `bytes` at `offset`, as the flash write it mirrors did.
    pub fn write_bytes(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        let end = offset as usize + bytes.len();
        if end > self.store_size as usize {
            return Err(Error::OutOfResources);
        }
        self.image[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Mutable view of the stored payload of the record at `offset`, for
    /// in-place decrypt caching.
    pub fn data_region_mut(&mut self, offset: u32) -> Result<&mut [u8], Error> {
        let entry = self.get(offset)?;
        let data_start = offset + header_size(self.auth_format) + entry.name.len() as u32;
        let data_end = data_start + entry.data.len() as u32;
        Ok(&mut self.image[data_start as usize..data_end as usize])
    }

    /// Offset just past the last record.
    pub fn first_free_offset(&self) -> Result<u32, Error> {
        let mut next = first_variable_offset();
        for entry in self.iter() {
            let entry = entry.map_err(|_| Error::VolumeCorrupted)?;
            next = entry.offset + entry.total_size;
        }
        Ok(next)
    }

    /// Swap in a freshly compacted image (reclaim).
    pub fn replace_image(&mut self, image: Vec<u8>) -> Result<(), Error> {
        let (header, auth_format) =
            read_store_header(&image).map_err(|_| Error::VolumeCorrupted)?;
        if auth_format != self.auth_format {
            return Err(Error::VolumeCorrupted);
        }
        self.store_size = header.size;
        self.image = image;
        Ok(())
    }
}

/// Fill `[offset, offset + gap)` with a single dead record.
fn write_tombstone(
    image: &mut [u8],
    offset: u32,
    gap: u32,
    auth_format: bool,
    index: usize,
) -> Result<(), Error> {
    // Name is a single digit keyed to the gap's position in the table,
    // mirroring nothing on flash; the record only exists to keep offsets
    // walkable.
    let mut name = utf16_lit::<2>("0\0");
    name[0] += (index % 10) as u16;

    let overhead = header_size(auth_format) + name.as_bytes().len() as u32;
    if gap < align4(overhead) {
        // Too narrow for a record; erased bytes end a cursor walk, but a
        // gap this small cannot hold a valid variable anyway.
        return Ok(());
    }
    let data_size = gap - overhead;

    let record = build_record(
        auth_format,
        &RecordSpec {
            state: VariableState::Deleted.raw(),
            attributes: 0,
            vendor_guid: Guid::default(),
            name: name.as_bytes(),
            data: &vec![0xFF; data_size as usize],
            auth: None,
        },
    );
    debug_assert!(record.len() as u32 == gap);
    image[offset as usize..(offset + gap) as usize].copy_from_slice(&record);
    Ok(())
}
