// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parsing and serialization of variable records in a flat store image.
//!
//! The cursor here is the only way the rest of the workspace walks a store:
//! it is lazy, restartable, bounded by the store's end sentinel, and fails
//! closed on the first malformed length field instead of wandering off the
//! end of the buffer.

use crate::AuthFields;
use crate::StoreError;
use crate::VariableEntry;
use protvar_format::align4;
use protvar_format::header_size;
use protvar_format::AuthenticatedVariableHeader;
use protvar_format::Guid;
use protvar_format::VariableHeader;
use protvar_format::VariableStoreHeader;
use protvar_format::AUTHENTICATED_VARIABLE_STORE_SIGNATURE;
use protvar_format::VARIABLE_DATA;
use protvar_format::VARIABLE_STORE_FORMATTED;
use protvar_format::VARIABLE_STORE_HEALTHY;
use protvar_format::VARIABLE_STORE_SIGNATURE;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Read and validate the store header of `image`.
///
/// Returns the header and whether the store uses the authenticated record
/// format.
pub fn read_store_header(image: &[u8]) -> Result<(VariableStoreHeader, bool), StoreError> {
    let (header, _) =
        VariableStoreHeader::read_from_prefix(image).map_err(|_| StoreError::InvalidStoreHeader)?;

    let auth_format = if header.signature == AUTHENTICATED_VARIABLE_STORE_SIGNATURE {
        true
    } else if header.signature == VARIABLE_STORE_SIGNATURE {
        false
    } else {
        return Err(StoreError::InvalidStoreHeader);
    };

    let size = header.size;
    if header.format != VARIABLE_STORE_FORMATTED
        || header.state != VARIABLE_STORE_HEALTHY
        || (size as usize) < size_of::<VariableStoreHeader>()
        || size as usize > image.len()
    {
        return Err(StoreError::InvalidStoreHeader);
    }

    Ok((header, auth_format))
}

/// Offset of the first record in any store.
pub const fn first_variable_offset() -> u32 {
    align4(size_of::<VariableStoreHeader>() as u32)
}

/// Parse the record at `offset`, bounded by `end`.
///
/// `Ok(None)` means the log ends here (erased flash or out of room for a
/// header); a record that starts correctly but declares impossible sizes is
/// a hard error.
pub fn read_record(
    image: &[u8],
    offset: u32,
    end: u32,
    auth_format: bool,
) -> Result<Option<VariableEntry>, StoreError> {
    let end = end.min(image.len() as u32);
    let header_len = header_size(auth_format);
    if offset
        .checked_add(header_len)
        .map_or(true, |next| next > end)
    {
        return Ok(None);
    }

    let record = &image[offset as usize..end as usize];
    let (start_id, raw_state, attributes, vendor_guid, name_size, data_size, auth) = if auth_format
    {
        let (header, _) = AuthenticatedVariableHeader::read_from_prefix(record)
            .map_err(|_| StoreError::MalformedRecord(offset))?;
        (
            header.start_id,
            header.state,
            header.attributes,
            header.vendor_guid,
            header.name_size,
            header.data_size,
            Some(AuthFields {
                monotonic_count: header.monotonic_count,
                timestamp: header.timestamp,
                pub_key_index: header.pub_key_index,
            }),
        )
    } else {
        let (header, _) = VariableHeader::read_from_prefix(record)
            .map_err(|_| StoreError::MalformedRecord(offset))?;
        (
            header.start_id,
            header.state,
            header.attributes,
            header.vendor_guid,
            header.name_size,
            header.data_size,
            None,
        )
    };

    if start_id != VARIABLE_DATA {
        return Ok(None);
    }

    // Sizes come from flash; anything inconsistent ends the walk with an
    // error rather than a partial record.
    let name_end = header_len
        .checked_add(name_size)
        .ok_or(StoreError::MalformedRecord(offset))?;
    let data_end = name_end
        .checked_add(data_size)
        .ok_or(StoreError::MalformedRecord(offset))?;
    if name_size < 2
        || name_size % 2 != 0
        || offset
            .checked_add(data_end)
            .map_or(true, |record_end| record_end > end)
    {
        return Err(StoreError::MalformedRecord(offset));
    }

    let name = record[header_len as usize..name_end as usize].to_vec();
    let data = record[name_end as usize..data_end as usize].to_vec();

    Ok(Some(VariableEntry {
        offset,
        raw_state,
        attributes,
        vendor_guid,
        name,
        data,
        auth,
        total_size: align4(data_end),
    }))
}

/// Lazy, restartable walk over the records of a store image.
pub struct VariableCursor<'a> {
    image: &'a [u8],
    end: u32,
    next: u32,
    auth_format: bool,
    done: bool,
}

impl<'a> VariableCursor<'a> {
    /// Walk `image` from the first record to its end sentinel.
    ///
    /// `end` is the store's declared size, already validated against the
    /// image length by [`read_store_header`].
    pub fn new(image: &'a [u8], end: u32, auth_format: bool) -> Self {
        VariableCursor {
            image,
            end,
            next: first_variable_offset(),
            auth_format,
            done: false,
        }
    }

    /// Resume a walk right after the record at `offset`.
    pub fn resume_after(
        image: &'a [u8],
        end: u32,
        auth_format: bool,
        offset: u32,
    ) -> Result<Self, StoreError> {
        let entry = read_record(image, offset, end, auth_format)?
            .ok_or(StoreError::NotFound(offset))?;
        Ok(VariableCursor {
            image,
            end,
            next: offset + entry.total_size,
            auth_format,
            done: false,
        })
    }
}

impl Iterator for VariableCursor<'_> {
    type Item = Result<VariableEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_record(self.image, self.next, self.end, self.auth_format) {
            Ok(Some(entry)) => {
                self.next += entry.total_size;
                Some(Ok(entry))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Input to [`build_record`].
pub struct RecordSpec<'a> {
    pub state: u8,
    pub attributes: u32,
    pub vendor_guid: Guid,
    /// UTF-16LE name, NUL terminator included.
    pub name: &'a [u8],
    pub data: &'a [u8],
    /// Ignored unless the store uses the authenticated format.
    pub auth: Option<AuthFields>,
}

/// Serialize a record, padded with erased-flash bytes up to alignment.
pub fn build_record(auth_format: bool, spec: &RecordSpec<'_>) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        align4(header_size(auth_format) + spec.name.len() as u32 + spec.data.len() as u32)
            as usize,
    );

    if auth_format {
        let auth = spec.auth.unwrap_or(AuthFields::ZEROED);
        let header = AuthenticatedVariableHeader {
            start_id: VARIABLE_DATA,
            state: spec.state,
            reserved: 0,
            attributes: spec.attributes,
            name_size: spec.name.len() as u32,
            data_size: spec.data.len() as u32,
            vendor_guid: spec.vendor_guid,
            monotonic_count: auth.monotonic_count,
            timestamp: auth.timestamp,
            pub_key_index: auth.pub_key_index,
        };
        out.extend_from_slice(header.as_bytes());
    } else {
        let header = VariableHeader {
            start_id: VARIABLE_DATA,
            state: spec.state,
            reserved: 0,
            attributes: spec.attributes,
            name_size: spec.name.len() as u32,
            data_size: spec.data.len() as u32,
            vendor_guid: spec.vendor_guid,
        };
        out.extend_from_slice(header.as_bytes());
    }

    out.extend_from_slice(spec.name);
    out.extend_from_slice(spec.data);
    while out.len() % 4 != 0 {
        out.push(0xFF);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use protvar_format::utf16_lit;
    use protvar_format::VariableState;
    use protvar_format::VAR_ADDED;

    fn test_image(records: &[Vec<u8>]) -> Vec<u8> {
        let mut image = Vec::new();
        let mut size = size_of::<VariableStoreHeader>() as u32;
        for record in records {
            size += record.len() as u32;
        }
        let header = VariableStoreHeader {
            signature: VARIABLE_STORE_SIGNATURE,
            size: size + 64,
            format: VARIABLE_STORE_FORMATTED,
            state: VARIABLE_STORE_HEALTHY,
            reserved: 0,
            reserved1: 0,
        };
        image.extend_from_slice(header.as_bytes());
        for record in records {
            image.extend_from_slice(record);
        }
        image.resize((size + 64) as usize, 0xFF);
        image
    }

    #[test]
    fn cursor_walks_records() {
        let name1 = utf16_lit::<5>("var1\0");
        let name2 = utf16_lit::<5>("var2\0");
        let rec1 = build_record(
            false,
            &RecordSpec {
                state: VAR_ADDED,
                attributes: 7,
                vendor_guid: Guid::new(1, 2, 3, [4; 8]),
                name: name1.as_bytes(),
                data: &[0xAA; 5],
                auth: None,
            },
        );
        let rec2 = build_record(
            false,
            &RecordSpec {
                state: VAR_ADDED,
                attributes: 7,
                vendor_guid: Guid::new(5, 6, 7, [8; 8]),
                name: name2.as_bytes(),
                data: &[0xBB; 8],
                auth: None,
            },
        );
        let image = test_image(&[rec1, rec2]);
        let (header, auth_format) = read_store_header(&image).unwrap();
        assert!(!auth_format);

        let entries: Vec<_> = VariableCursor::new(&image, header.size, auth_format)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].offset, first_variable_offset());
        assert_eq!(entries[0].data, vec![0xAA; 5]);
        assert_eq!(entries[0].state(), Some(VariableState::Added));
        assert_eq!(entries[1].name_lossy(), "var2");
        assert_eq!(
            entries[1].offset,
            entries[0].offset + entries[0].total_size
        );
        // Restart mid-walk.
        let resumed: Vec<_> =
            VariableCursor::resume_after(&image, header.size, auth_format, entries[0].offset)
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();
        assert_eq!(resumed, entries[1..]);
    }

    #[test]
    fn cursor_fails_closed_on_bad_length() {
        let name = utf16_lit::<5>("var1\0");
        let mut rec = build_record(
            false,
            &RecordSpec {
                state: VAR_ADDED,
                attributes: 7,
                vendor_guid: Guid::new(1, 2, 3, [4; 8]),
                name: name.as_bytes(),
                data: &[0xAA; 5],
                auth: None,
            },
        );
        // Corrupt DataSize to run past the store end.
        rec[14..18].copy_from_slice(&0xFFFF_0000u32.to_le_bytes());
        let image = test_image(&[rec]);
        let (header, auth_format) = read_store_header(&image).unwrap();

        let mut cursor = VariableCursor::new(&image, header.size, auth_format);
        assert!(matches!(
            cursor.next(),
            Some(Err(StoreError::MalformedRecord(_)))
        ));
        assert!(cursor.next().is_none());
    }

    #[test]
    fn store_header_validation() {
        let image = test_image(&[]);
        read_store_header(&image).unwrap();

        let mut bad_sig = image.clone();
        bad_sig[0] ^= 0xFF;
        assert!(matches!(
            read_store_header(&bad_sig),
            Err(StoreError::InvalidStoreHeader)
        ));

        let mut bad_size = image.clone();
        bad_size[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            read_store_header(&bad_size),
            Err(StoreError::InvalidStoreHeader)
        ));

        let mut bad_format = image;
        bad_format[20] = 0;
        assert!(matches!(
            read_store_header(&bad_format),
            Err(StoreError::InvalidStoreHeader)
        ));
    }

    #[test]
    fn auth_record_round_trip() {
        let name = utf16_lit::<5>("auth\0");
        let auth = AuthFields {
            monotonic_count: 0x1122334455667788,
            timestamp: protvar_format::EfiTime {
                year: 2020,
                month: 1,
                day: 2,
                ..protvar_format::EfiTime::ZEROED
            },
            pub_key_index: 9,
        };
        let rec = build_record(
            true,
            &RecordSpec {
                state: VAR_ADDED,
                attributes: 0x27,
                vendor_guid: Guid::new(1, 2, 3, [4; 8]),
                name: name.as_bytes(),
                data: &[1, 2, 3],
                auth: Some(auth),
            },
        );

        let mut image = Vec::new();
        let header = VariableStoreHeader {
            signature: AUTHENTICATED_VARIABLE_STORE_SIGNATURE,
            size: (size_of::<VariableStoreHeader>() + rec.len() + 16) as u32,
            format: VARIABLE_STORE_FORMATTED,
            state: VARIABLE_STORE_HEALTHY,
            reserved: 0,
            reserved1: 0,
        };
        image.extend_from_slice(header.as_bytes());
        image.extend_from_slice(&rec);
        image.resize(header.size as usize, 0xFF);

        let (header, auth_format) = read_store_header(&image).unwrap();
        assert!(auth_format);
        let entry = read_record(&image, first_variable_offset(), header.size, true)
            .unwrap()
            .unwrap();
        assert_eq!(entry.auth, Some(auth));
        assert_eq!(entry.data, vec![1, 2, 3]);
    }
}
