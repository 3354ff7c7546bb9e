// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides an in-memory implementation of [`ContextAdapter`] over a flat
//! flash image, plus a builder for constructing valid store images in
//! tests.

use crate::image::build_record;
use crate::image::first_variable_offset;
use crate::image::read_record;
use crate::image::read_store_header;
use crate::image::RecordSpec;
use crate::image::VariableCursor;
use crate::ContextAdapter;
use crate::StoreError;
use crate::StoreSnapshot;
use crate::VariableEntry;
use protvar_format::Guid;
use protvar_format::VariableState;
use protvar_format::VariableStoreHeader;
use protvar_format::AUTHENTICATED_VARIABLE_STORE_SIGNATURE;
use protvar_format::METADATA_HMAC_VARIABLE_GUID;
use protvar_format::VARIABLE_STORE_FORMATTED;
use protvar_format::VARIABLE_STORE_HEALTHY;
use protvar_format::VARIABLE_STORE_SIGNATURE;
use protvar_format::VAR_ERROR_FLAG_GUID;
use zerocopy::IntoBytes;

/// Default record size cap, matching the usual firmware configuration.
pub const DEFAULT_MAX_VARIABLE_SIZE: u32 = 0x2000;

/// An in-memory flash image implementing [`ContextAdapter`].
#[derive(Debug, Clone)]
pub struct InMemoryFlash {
    image: Vec<u8>,
    store_size: u32,
    auth_format: bool,
    max_variable_size: u32,
}

impl InMemoryFlash {
    /// Wrap an existing store image, validating its header.
    pub fn new(image: Vec<u8>) -> Result<Self, StoreError> {
        let (header, auth_format) = read_store_header(&image)?;
        Ok(InMemoryFlash {
            store_size: header.size,
            auth_format,
            image,
            max_variable_size: DEFAULT_MAX_VARIABLE_SIZE,
        })
    }

    /// Override the record size cap.
    pub fn with_max_variable_size(mut self, max: u32) -> Self {
        self.max_variable_size = max;
        self
    }

    /// The raw image, store header included.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Whether records use the authenticated header format.
    pub fn auth_format(&self) -> bool {
        self.auth_format
    }

    /// Program `bytes` at `offset`, the way the platform flash driver
    /// writes a prepared record buffer.
    pub fn write_bytes(&mut self, offset: u32, bytes: &[u8]) -> Result<(), StoreError> {
        let end = offset as usize + bytes.len();
        if end > self.store_size as usize {
            return Err(StoreError::OutOfBounds(offset));
        }
        self.image[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Offset just past the last record, where the next write lands.
    pub fn first_free_offset(&self) -> Result<u32, StoreError> {
        let mut next = first_variable_offset();
        for entry in VariableCursor::new(&self.image, self.store_size, self.auth_format) {
            let entry = entry?;
            next = entry.offset + entry.total_size;
        }
        Ok(next)
    }

    /// Replace the whole store content, e.g. after a reclaim.
    pub fn replace_image(&mut self, image: Vec<u8>) -> Result<(), StoreError> {
        let (header, auth_format) = read_store_header(&image)?;
        self.store_size = header.size;
        self.auth_format = auth_format;
        self.image = image;
        Ok(())
    }
}

impl ContextAdapter for InMemoryFlash {
    fn max_variable_size(&self) -> u32 {
        self.max_variable_size
    }

    fn init_variable_store(&mut self) -> Result<StoreSnapshot, StoreError> {
        Ok(StoreSnapshot {
            image: self.image.clone(),
            auth_format: self.auth_format,
        })
    }

    fn get_variable_info(&self, offset: u32) -> Result<VariableEntry, StoreError> {
        read_record(&self.image, offset, self.store_size, self.auth_format)?
            .ok_or(StoreError::NotFound(offset))
    }

    fn next_variable_info(&self, prev: Option<u32>) -> Result<Option<VariableEntry>, StoreError> {
        let mut cursor = match prev {
            Some(offset) => {
                VariableCursor::resume_after(&self.image, self.store_size, self.auth_format, offset)?
            }
            None => VariableCursor::new(&self.image, self.store_size, self.auth_format),
        };
        cursor.next().transpose()
    }

    fn update_variable_store(&mut self, offset: u32, state: u8) -> Result<(), StoreError> {
        // The state byte sits right after StartId in both header formats.
        self.get_variable_info(offset)?;
        self.image[offset as usize + 4] = state;
        Ok(())
    }

    fn is_user_variable(&self, entry: &VariableEntry) -> bool {
        entry.vendor_guid != METADATA_HMAC_VARIABLE_GUID
            && entry.vendor_guid != VAR_ERROR_FLAG_GUID
    }

    fn find_variable(
        &mut self,
        name: &[u8],
        vendor: &Guid,
    ) -> Result<Option<(u32, Vec<u8>)>, StoreError> {
        let mut in_delete = None;
        for entry in VariableCursor::new(&self.image, self.store_size, self.auth_format) {
            let entry = entry?;
            if !entry.is_variable(name, vendor) {
                continue;
            }
            match entry.state() {
                Some(VariableState::Added) => {
                    return Ok(Some((entry.attributes, entry.data)));
                }
                Some(VariableState::InDeleteTransition) => {
                    in_delete = Some((entry.attributes, entry.data));
                }
                _ => {}
            }
        }
        Ok(in_delete)
    }
}

/// Builds a valid store image record by record.
pub struct StoreBuilder {
    auth_format: bool,
    store_size: u32,
    records: Vec<u8>,
}

impl StoreBuilder {
    /// Start an empty store of `store_size` bytes.
    pub fn new(auth_format: bool, store_size: u32) -> Self {
        StoreBuilder {
            auth_format,
            store_size,
            records: Vec::new(),
        }
    }

    /// Append a record; returns its offset in the finished store.
    pub fn push(&mut self, spec: &RecordSpec<'_>) -> u32 {
        let offset = first_variable_offset() + self.records.len() as u32;
        self.records
            .extend_from_slice(&build_record(self.auth_format, spec));
        offset
    }

    /// Produce the image, erased-flash filled to the declared size.
    pub fn finish(self) -> Vec<u8> {
        let mut image = Vec::with_capacity(self.store_size as usize);
        let header = VariableStoreHeader {
            signature: if self.auth_format {
                AUTHENTICATED_VARIABLE_STORE_SIGNATURE
            } else {
                VARIABLE_STORE_SIGNATURE
            },
            size: self.store_size,
            format: VARIABLE_STORE_FORMATTED,
            state: VARIABLE_STORE_HEALTHY,
            reserved: 0,
            reserved1: 0,
        };
        image.extend_from_slice(header.as_bytes());
        image.resize(first_variable_offset() as usize, 0xFF);
        image.extend_from_slice(&self.records);
        assert!(image.len() <= self.store_size as usize, "store overflow");
        image.resize(self.store_size as usize, 0xFF);
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protvar_format::utf16_lit;
    use protvar_format::VAR_ADDED;
    use zerocopy::IntoBytes;

    fn flash_with(names: &[&[u8]]) -> (InMemoryFlash, Vec<u32>) {
        let mut builder = StoreBuilder::new(false, 0x1000);
        let mut offsets = Vec::new();
        for (i, name) in names.iter().enumerate() {
            offsets.push(builder.push(&RecordSpec {
                state: VAR_ADDED,
                attributes: 7,
                vendor_guid: Guid::new(i as u32, 0, 0, [0; 8]),
                name,
                data: &[i as u8; 4],
                auth: None,
            }));
        }
        (InMemoryFlash::new(builder.finish()).unwrap(), offsets)
    }

    #[test]
    fn enumerate_and_get() {
        let name1 = utf16_lit::<5>("var1\0");
        let name2 = utf16_lit::<5>("var2\0");
        let (flash, offsets) = flash_with(&[name1.as_bytes(), name2.as_bytes()]);

        let first = flash.next_variable_info(None).unwrap().unwrap();
        assert_eq!(first.offset, offsets[0]);
        let second = flash.next_variable_info(Some(first.offset)).unwrap().unwrap();
        assert_eq!(second.offset, offsets[1]);
        assert!(flash.next_variable_info(Some(second.offset)).unwrap().is_none());

        // Restartable: same cursor key, same answer.
        let again = flash.next_variable_info(Some(first.offset)).unwrap().unwrap();
        assert_eq!(again, second);

        let direct = flash.get_variable_info(offsets[1]).unwrap();
        assert_eq!(direct, second);
    }

    #[test]
    fn state_patch() {
        let name = utf16_lit::<5>("var1\0");
        let (mut flash, offsets) = flash_with(&[name.as_bytes()]);

        flash.update_variable_store(offsets[0], 0x3E).unwrap();
        let entry = flash.get_variable_info(offsets[0]).unwrap();
        assert_eq!(entry.state(), Some(VariableState::InDeleteTransition));
        // Everything else untouched.
        assert_eq!(entry.data, vec![0u8; 4]);
    }

    #[test]
    fn find_prefers_added_copy() {
        let name = utf16_lit::<5>("var1\0");
        let guid = Guid::new(9, 9, 9, [9; 8]);
        let mut builder = StoreBuilder::new(false, 0x1000);
        builder.push(&RecordSpec {
            state: 0x3E,
            attributes: 7,
            vendor_guid: guid,
            name: name.as_bytes(),
            data: &[1],
            auth: None,
        });
        builder.push(&RecordSpec {
            state: VAR_ADDED,
            attributes: 7,
            vendor_guid: guid,
            name: name.as_bytes(),
            data: &[2],
            auth: None,
        });
        let mut flash = InMemoryFlash::new(builder.finish()).unwrap();

        let (_, data) = flash.find_variable(name.as_bytes(), &guid).unwrap().unwrap();
        assert_eq!(data, vec![2]);
    }

    #[test]
    fn append_after_last_record() {
        let name1 = utf16_lit::<5>("var1\0");
        let (mut flash, _) = flash_with(&[name1.as_bytes()]);
        let free = flash.first_free_offset().unwrap();

        let name2 = utf16_lit::<5>("var2\0");
        let record = build_record(
            false,
            &RecordSpec {
                state: VAR_ADDED,
                attributes: 7,
                vendor_guid: Guid::new(2, 0, 0, [0; 8]),
                name: name2.as_bytes(),
                data: &[0xCC; 3],
                auth: None,
            },
        );
        flash.write_bytes(free, &record).unwrap();

        let entry = flash.get_variable_info(free).unwrap();
        assert_eq!(entry.name_lossy(), "var2");
        assert_eq!(flash.first_free_offset().unwrap(), free + entry.total_size);
    }
}
