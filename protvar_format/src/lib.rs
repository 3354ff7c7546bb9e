// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Protected variable store format definitions.
//!
//! Everything in this crate describes bytes as they appear on the
//! non-volatile store: record headers, the cipher header prefixed to
//! encrypted payloads, state encodings, and the reserved names/GUIDs the
//! integrity machinery depends on. No I/O and no crypto live here.

#![no_std]
#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use core::fmt;
use static_assertions::const_assert;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

/// Alignment of each record in the store.
pub const HEADER_ALIGNMENT: u32 = 4;

/// Round `n` up to the record alignment.
pub const fn align4(n: u32) -> u32 {
    (n + (HEADER_ALIGNMENT - 1)) & !(HEADER_ALIGNMENT - 1)
}

/// First field of every record header.
pub const VARIABLE_DATA: u32 = 0x55AA;

/// `Format` byte of a formatted store header.
pub const VARIABLE_STORE_FORMATTED: u8 = 0x5A;
/// `State` byte of a healthy store header.
pub const VARIABLE_STORE_HEALTHY: u8 = 0xFE;

/// A vendor GUID in its wire representation (RFC 4122 mixed-endian, as UEFI
/// stores it).
#[repr(C, packed)]
#[derive(
    Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned, Default,
)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

const_assert!(size_of::<Guid>() == 16);

impl Guid {
    /// Construct a GUID from its four natural components.
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Guid {
            data1,
            data2,
            data3,
            data4,
        }
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Guid {
            data1,
            data2,
            data3,
            data4,
        } = *self;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            data1,
            data2,
            data3,
            data4[0],
            data4[1],
            data4[2],
            data4[3],
            data4[4],
            data4[5],
            data4[6],
            data4[7],
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// UEFI time representation carried by authenticated variables.
#[repr(C, packed)]
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned,
)]
pub struct EfiTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub pad1: u8,
    pub nanosecond: u32,
    pub timezone: i16,
    pub daylight: u8,
    pub pad2: u8,
}

const_assert!(size_of::<EfiTime>() == 16);

impl EfiTime {
    /// The all-zero timestamp, used wherever auth fields are absent.
    pub const ZEROED: EfiTime = EfiTime {
        year: 0,
        month: 0,
        day: 0,
        hour: 0,
        minute: 0,
        second: 0,
        pad1: 0,
        nanosecond: 0,
        timezone: 0,
        daylight: 0,
        pad2: 0,
    };
}

/// Header of the variable store region.
#[repr(C, packed)]
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned,
)]
pub struct VariableStoreHeader {
    pub signature: Guid,
    /// Total size of the store, header included.
    pub size: u32,
    pub format: u8,
    pub state: u8,
    pub reserved: u16,
    pub reserved1: u32,
}

const_assert!(size_of::<VariableStoreHeader>() == 28);

/// Header of a variable record in the normal (non-authenticated) format.
///
/// `Name` (UTF-16LE, NUL-terminated, `name_size` bytes) follows immediately,
/// then `data_size` bytes of payload. The next record starts at the next
/// 4-byte boundary.
#[repr(C, packed)]
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned,
)]
pub struct VariableHeader {
    pub start_id: u32,
    pub state: u8,
    pub reserved: u8,
    pub attributes: u32,
    pub name_size: u32,
    pub data_size: u32,
    pub vendor_guid: Guid,
}

const_assert!(size_of::<VariableHeader>() == 34);

/// Header of a variable record in the authenticated format.
#[repr(C, packed)]
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned,
)]
pub struct AuthenticatedVariableHeader {
    pub start_id: u32,
    pub state: u8,
    pub reserved: u8,
    pub attributes: u32,
    pub name_size: u32,
    pub data_size: u32,
    pub vendor_guid: Guid,
    pub monotonic_count: u64,
    pub timestamp: EfiTime,
    pub pub_key_index: u32,
}

const_assert!(size_of::<AuthenticatedVariableHeader>() == 62);

/// Size of a record header for the given store format.
pub const fn header_size(auth_format: bool) -> u32 {
    if auth_format {
        size_of::<AuthenticatedVariableHeader>() as u32
    } else {
        size_of::<VariableHeader>() as u32
    }
}

/// Total aligned size of a record with the given name and data sizes.
pub const fn record_size(auth_format: bool, name_size: u32, data_size: u32) -> u32 {
    align4(header_size(auth_format) + name_size + data_size)
}

/// Raw state byte of a live record.
pub const VAR_ADDED: u8 = 0x3F;
/// Mask combined onto a live record entering delete-transition.
pub const VAR_IN_DELETED_TRANSITION: u8 = 0xFE;
/// Mask combined onto a record once fully deleted.
pub const VAR_DELETED: u8 = 0xFD;

/// Record lifecycle state.
///
/// The store encodes states as AND-combined bit masks; this enum names only
/// the combinations that a correct writer can produce. Decoding anything
/// else fails closed (`from_raw` returns `None`) so that stray flash bits
/// can never masquerade as a live record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VariableState {
    /// Erased flash; no record has been written here.
    Uninitialized,
    /// Live record.
    Added,
    /// Logically superseded, not yet reclaimed.
    InDeleteTransition,
    /// Dead record awaiting reclaim.
    Deleted,
}

impl VariableState {
    /// Decode a raw state byte. `0x3D` (a live record deleted without
    /// passing through delete-transition) also decodes as `Deleted`.
    pub fn from_raw(raw: u8) -> Option<VariableState> {
        match raw {
            0xFF => Some(VariableState::Uninitialized),
            VAR_ADDED => Some(VariableState::Added),
            0x3E => Some(VariableState::InDeleteTransition),
            0x3C | 0x3D => Some(VariableState::Deleted),
            _ => None,
        }
    }

    /// Canonical byte encoding of this state.
    pub fn raw(self) -> u8 {
        match self {
            VariableState::Uninitialized => 0xFF,
            VariableState::Added => VAR_ADDED,
            VariableState::InDeleteTransition => VAR_ADDED & VAR_IN_DELETED_TRANSITION,
            VariableState::Deleted => VAR_ADDED & VAR_IN_DELETED_TRANSITION & VAR_DELETED,
        }
    }

    /// Whether a record may move from `self` to `to`.
    ///
    /// The only legal movements are forward through the lifecycle, plus the
    /// recovery promotion of a delete-transition record back to live; a
    /// deleted record never comes back in place.
    pub fn can_transition(self, to: VariableState) -> bool {
        use VariableState::*;
        matches!(
            (self, to),
            (Uninitialized, Added)
                | (Added, InDeleteTransition)
                | (Added, Deleted)
                | (InDeleteTransition, Added)
                | (InDeleteTransition, Deleted)
        )
    }
}

const_assert!(VAR_ADDED & VAR_IN_DELETED_TRANSITION == 0x3E);
const_assert!(VAR_ADDED & VAR_IN_DELETED_TRANSITION & VAR_DELETED == 0x3C);

/// Variable attribute word, UEFI spec 8.2.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct VariableAttributes {
    pub non_volatile: bool,
    pub bootservice_access: bool,
    pub runtime_access: bool,
    pub hardware_error_record: bool,
    pub authenticated_write_access: bool,
    pub time_based_authenticated_write_access: bool,
    pub append_write: bool,
    pub enhanced_authenticated_access: bool,

    #[bits(24)]
    _reserved: u32,
}

impl VariableAttributes {
    /// NV + BS + RT, the attributes of the integrity metadata variable.
    pub const NV_BS_RT: VariableAttributes = VariableAttributes::new()
        .with_non_volatile(true)
        .with_bootservice_access(true)
        .with_runtime_access(true);

    /// Whether any of the authenticated-write attribute bits is set.
    ///
    /// Such payloads carry certificate framing consumed at parse time and
    /// are stored as cleartext under the integrity chain.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated_write_access()
            || self.time_based_authenticated_write_access()
            || self.enhanced_authenticated_access()
    }
}

/// Signature GUID of a store in the normal variable format.
pub const VARIABLE_STORE_SIGNATURE: Guid = Guid::new(
    0xddcf3616,
    0x3275,
    0x4164,
    [0x98, 0xb6, 0xfe, 0x85, 0x70, 0x7f, 0xfe, 0x7d],
);

/// Signature GUID of a store in the authenticated variable format.
pub const AUTHENTICATED_VARIABLE_STORE_SIGNATURE: Guid = Guid::new(
    0xaaf32c78,
    0x947b,
    0x439a,
    [0xa1, 0x80, 0x2e, 0x14, 0x4e, 0xc3, 0x77, 0x92],
);

/// Payload stored as cleartext behind a cipher header.
pub const ENC_TYPE_NULL: u32 = 0;
/// Payload encrypted with AES (TPM algorithm ID).
pub const ENC_TYPE_AES: u32 = 0x6;

/// AES block size; ciphertext lengths are multiples of this.
pub const ENC_BLOCK_SIZE: usize = 16;
/// Byte used to pad plaintext up to the block size.
pub const ENC_PADDING_BYTE: u8 = 0x0F;

/// Header prefixed to the `Data` of every protected variable that went
/// through the cipher codec.
#[repr(C, packed)]
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned,
)]
pub struct CipherHeader {
    /// `ENC_TYPE_AES` or `ENC_TYPE_NULL`.
    pub data_type: u32,
    /// Always `size_of::<CipherHeader>()` (0x20).
    pub header_size: u32,
    /// Length of the plaintext.
    pub plain_data_size: u32,
    /// Length of the ciphertext (excluding this header).
    pub cipher_data_size: u32,
    pub iv: [u8; 16],
}

const_assert!(size_of::<CipherHeader>() == 0x20);

/// Build a UTF-16LE array out of an ASCII literal at compile time.
///
/// The compiler has no wide-string literals; reserved names below embed
/// their NUL terminator in the source literal.
pub const fn utf16_lit<const N: usize>(s: &str) -> [u16; N] {
    let bytes = s.as_bytes();
    assert!(bytes.len() == N, "literal length mismatch");
    let mut out = [0u16; N];
    let mut i = 0;
    while i < N {
        assert!(bytes[i] < 0x80, "ASCII only");
        out[i] = bytes[i] as u16;
        i += 1;
    }
    out
}

/// Name of the integrity metadata variable, NUL included.
pub const METADATA_HMAC_VARIABLE_NAME: [u16; 16] = utf16_lit("MetaDataHmacVar\0");
/// `NameSize` of the integrity metadata variable.
pub const METADATA_HMAC_VARIABLE_NAME_SIZE: u32 = 32;
/// Vendor GUID of the integrity metadata variable.
pub const METADATA_HMAC_VARIABLE_GUID: Guid = Guid::new(
    0xb54cda50,
    0xec54,
    0x4b20,
    [0x8b, 0x46, 0x86, 0xdb, 0xd1, 0xb6, 0xb8, 0x58],
);
/// Size of the stored digest.
pub const METADATA_HMAC_SIZE: u32 = 32;

/// Separator fed between fields of the integrity digest, `":"` in UTF-16LE.
pub const METADATA_HMAC_SEP: [u8; 2] = [b':', 0];

/// HKDF info label for the integrity-chain key, `"HMAC_KEY"` in UTF-16LE
/// without terminator.
pub const METADATA_HMAC_KEY_NAME: [u16; 8] = utf16_lit("HMAC_KEY");

/// HKDF info suffix for per-variable encryption keys, `"VAR_ENC_KEY"` in
/// UTF-16LE without terminator.
pub const ENC_KEY_NAME: [u16; 11] = utf16_lit("VAR_ENC_KEY");

/// Name of the reserved error-log variable, NUL included.
pub const VAR_ERROR_FLAG_NAME: [u16; 13] = utf16_lit("VarErrorFlag\0");
/// Vendor GUID of the reserved error-log variable.
pub const VAR_ERROR_FLAG_GUID: Guid = Guid::new(
    0x04b37fe8,
    0xf6ae,
    0x480b,
    [0xbd, 0xd5, 0x37, 0xd9, 0x8c, 0x5e, 0x89, 0xaa],
);

/// Size of the variable root key and every key derived from it.
pub const VARIABLE_KEY_SIZE: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        for state in [
            VariableState::Uninitialized,
            VariableState::Added,
            VariableState::InDeleteTransition,
            VariableState::Deleted,
        ] {
            assert_eq!(VariableState::from_raw(state.raw()), Some(state));
        }
    }

    #[test]
    fn state_fails_closed() {
        assert_eq!(VariableState::from_raw(0x00), None);
        assert_eq!(VariableState::from_raw(0x3B), None);
        assert_eq!(VariableState::from_raw(0x7F), None);
        // Directly-deleted live record still reads as deleted.
        assert_eq!(
            VariableState::from_raw(VAR_ADDED & VAR_DELETED),
            Some(VariableState::Deleted)
        );
    }

    #[test]
    fn state_transitions() {
        use VariableState::*;
        assert!(Uninitialized.can_transition(Added));
        assert!(Added.can_transition(InDeleteTransition));
        assert!(Added.can_transition(Deleted));
        assert!(InDeleteTransition.can_transition(Added));
        assert!(InDeleteTransition.can_transition(Deleted));

        assert!(!Deleted.can_transition(Added));
        assert!(!Deleted.can_transition(InDeleteTransition));
        assert!(!Added.can_transition(Uninitialized));
        assert!(!InDeleteTransition.can_transition(Uninitialized));
    }

    #[test]
    fn record_sizes() {
        assert_eq!(header_size(false), 34);
        assert_eq!(header_size(true), 62);
        // "MetaDataHmacVar" + 32-byte digest, normal format.
        assert_eq!(
            record_size(false, METADATA_HMAC_VARIABLE_NAME_SIZE, METADATA_HMAC_SIZE),
            align4(34 + 32 + 32)
        );
        assert_eq!(align4(34), 36);
        assert_eq!(align4(36), 36);
    }

    #[test]
    fn utf16_literals() {
        use zerocopy::IntoBytes;

        assert_eq!(METADATA_HMAC_VARIABLE_NAME[0], b'M' as u16);
        assert_eq!(METADATA_HMAC_VARIABLE_NAME[14], b'r' as u16);
        assert_eq!(METADATA_HMAC_VARIABLE_NAME[15], 0);
        assert_eq!(
            METADATA_HMAC_VARIABLE_NAME.as_bytes().len() as u32,
            METADATA_HMAC_VARIABLE_NAME_SIZE
        );
        assert_eq!(METADATA_HMAC_KEY_NAME.as_bytes().len(), 0x10);
        assert_eq!(ENC_KEY_NAME.as_bytes().len(), 0x16);
    }

    #[test]
    fn guid_display() {
        let guid = Guid::new(
            0x98E33DF3,
            0x3FFF,
            0x4FE2,
            [0xB1, 0xEE, 0x8D, 0xF5, 0x49, 0x4A, 0x6B, 0x37],
        );
        extern crate alloc;
        use alloc::string::ToString;
        assert_eq!(guid.to_string(), "98e33df3-3fff-4fe2-b1ee-8df5494a6b37");
    }
}
