// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The chained HMAC over all protected variables plus the replay counter.
//!
//! The digest is order-sensitive: variables are fed in store order, which
//! is why everything that rewrites the store (updates, reclaim) is careful
//! to preserve that order.

use crate::encrypt;
use crate::error::Error;
use protvar_format::Guid;
use protvar_format::METADATA_HMAC_KEY_NAME;
use protvar_format::METADATA_HMAC_SEP;
use protvar_format::METADATA_HMAC_SIZE;
use protvar_storage::AuthFields;
use protvar_storage::VariableEntry;
use zerocopy::IntoBytes;
use zeroize::Zeroize;
use zeroize::ZeroizeOnDrop;

/// The HKDF-derived integrity-chain key.
///
/// Never leaves the trusted context; zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct HmacKey([u8; 32]);

impl HmacKey {
    /// Derive the integrity-chain key from the variable root key
    /// (label `"HMAC_KEY"`, UTF-16LE, empty salt).
    pub fn derive(root_key: &[u8]) -> Result<HmacKey, Error> {
        Ok(HmacKey(encrypt::hkdf_sha256(
            root_key,
            METADATA_HMAC_KEY_NAME.as_bytes(),
        )?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HmacKey(..)")
    }
}

/// One variable's contribution to the digest.
pub(crate) struct DigestVar<'a> {
    pub name: &'a [u8],
    pub vendor_guid: Guid,
    pub attributes: u32,
    /// The full stored payload, cipher header included.
    pub data: &'a [u8],
    pub auth: AuthFields,
}

impl<'a> DigestVar<'a> {
    pub fn from_entry(entry: &'a VariableEntry) -> DigestVar<'a> {
        DigestVar {
            name: &entry.name,
            vendor_guid: entry.vendor_guid,
            attributes: entry.attributes,
            data: &entry.data,
            auth: entry.auth.unwrap_or(AuthFields::ZEROED),
        }
    }

    /// Feed this variable into the digest message:
    ///
    /// ```text
    /// ":" || Name
    /// ":" || VendorGuid || Attributes || CipherDataSize
    /// ":" || CipherData
    /// ":" || PubKeyIndex || MonotonicCount || TimeStamp
    /// ```
    fn append_to(&self, message: &mut Vec<u8>) {
        message.extend_from_slice(&METADATA_HMAC_SEP);
        message.extend_from_slice(self.name);

        message.extend_from_slice(&METADATA_HMAC_SEP);
        message.extend_from_slice(self.vendor_guid.as_bytes());
        message.extend_from_slice(&self.attributes.to_le_bytes());
        message.extend_from_slice(&(self.data.len() as u32).to_le_bytes());

        message.extend_from_slice(&METADATA_HMAC_SEP);
        message.extend_from_slice(self.data);

        message.extend_from_slice(&METADATA_HMAC_SEP);
        message.extend_from_slice(&self.auth.pub_key_index.to_le_bytes());
        message.extend_from_slice(&self.auth.monotonic_count.to_le_bytes());
        message.extend_from_slice(self.auth.timestamp.as_bytes());
    }
}

/// Compute the 32-byte chain digest over `vars` (in store order) and the
/// replay counter.
pub(crate) fn compute_digest<'a>(
    hmac_key: &HmacKey,
    vars: impl IntoIterator<Item = DigestVar<'a>>,
    counter: u32,
) -> Result<[u8; 32], Error> {
    let mut message = Vec::new();
    for var in vars {
        var.append_to(&mut message);
    }
    message.extend_from_slice(&counter.to_le_bytes());
    let digest = encrypt::hmac_sha256(hmac_key.as_bytes(), &message)?;
    message.zeroize();
    Ok(digest)
}

/// The metadata-only repair a successful verification calls for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HmacRepair {
    /// Clean boot; nothing to fix.
    None,
    /// Only an in-delete copy exists and it matches: promote it.
    PromoteInDel,
    /// Both copies exist and the in-delete one matches: the crash hit
    /// before the new record was committed, so the roles are swapped.
    SwapAddedInDel,
    /// Both copies exist and the added one matches at counter+1: the crash
    /// hit before the counter advanced.
    AdvanceCounter,
}

/// Classify the stored digest copies against the freshly computed chain.
///
/// This table enumerates every crash point of the two-record write
/// protocol; anything outside it is compromise.
pub(crate) fn classify_hmac(
    added: Option<&[u8]>,
    in_del: Option<&[u8]>,
    digest: &[u8; 32],
    digest_plus: Option<&[u8; 32]>,
    protected_count: usize,
) -> Result<HmacRepair, Error> {
    if added.map_or(false, |d| d.len() != METADATA_HMAC_SIZE as usize)
        || in_del.map_or(false, |d| d.len() != METADATA_HMAC_SIZE as usize)
    {
        return Err(Error::CompromisedData);
    }

    match (added, in_del) {
        (None, None) => {
            if protected_count != 0 {
                // Protected data with no digest over it is orphaned data.
                Err(Error::CompromisedData)
            } else {
                Ok(HmacRepair::None)
            }
        }
        (Some(added), None) => {
            if added == digest.as_slice() {
                Ok(HmacRepair::None)
            } else {
                Err(Error::CompromisedData)
            }
        }
        (None, Some(in_del)) => {
            // Crash before the new copy was committed.
            if in_del == digest.as_slice() {
                Ok(HmacRepair::PromoteInDel)
            } else {
                Err(Error::CompromisedData)
            }
        }
        (Some(added), Some(in_del)) => {
            let digest_plus = digest_plus.ok_or(Error::CompromisedData)?;
            if in_del == digest.as_slice() {
                Ok(HmacRepair::SwapAddedInDel)
            } else if added == digest_plus.as_slice() {
                Ok(HmacRepair::AdvanceCounter)
            } else if added == digest.as_slice() {
                Ok(HmacRepair::None)
            } else {
                // The in-delete copy matching counter+1 cannot happen with
                // both copies present; kept as a defended fallback rather
                // than assumed unreachable.
                Err(Error::CompromisedData)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protvar_format::utf16_lit;

    fn key() -> HmacKey {
        HmacKey::derive(&[0x42; 32]).unwrap()
    }

    fn var<'a>(name: &'a [u8], data: &'a [u8]) -> DigestVar<'a> {
        DigestVar {
            name,
            vendor_guid: Guid::new(1, 2, 3, [4; 8]),
            attributes: 7,
            data,
            auth: AuthFields::ZEROED,
        }
    }

    #[test]
    fn digest_is_deterministic() {
        let name = utf16_lit::<5>("var1\0");
        let a = compute_digest(&key(), [var(name.as_bytes(), &[1, 2, 3])], 0x77).unwrap();
        let b = compute_digest(&key(), [var(name.as_bytes(), &[1, 2, 3])], 0x77).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn digest_is_order_sensitive() {
        let name1 = utf16_lit::<5>("var1\0");
        let name2 = utf16_lit::<5>("var2\0");
        let forward = compute_digest(
            &key(),
            [var(name1.as_bytes(), &[1]), var(name2.as_bytes(), &[2])],
            0x77,
        )
        .unwrap();
        let reversed = compute_digest(
            &key(),
            [var(name2.as_bytes(), &[2]), var(name1.as_bytes(), &[1])],
            0x77,
        )
        .unwrap();
        assert_ne!(forward, reversed);
    }

    #[test]
    fn digest_is_counter_sensitive() {
        let name = utf16_lit::<5>("var1\0");
        let at_counter = compute_digest(&key(), [var(name.as_bytes(), &[1])], 0x77).unwrap();
        let at_next = compute_digest(&key(), [var(name.as_bytes(), &[1])], 0x78).unwrap();
        assert_ne!(at_counter, at_next);
    }

    #[test]
    fn hmac_key_derivation_is_stable() {
        let a = HmacKey::derive(&[0x42; 32]).unwrap();
        let b = HmacKey::derive(&[0x42; 32]).unwrap();
        let c = HmacKey::derive(&[0x43; 32]).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn classify_clean_boot() {
        let digest = [0xAA; 32];
        assert_eq!(
            classify_hmac(Some(digest.as_slice()), None, &digest, None, 3).unwrap(),
            HmacRepair::None
        );
        assert!(matches!(
            classify_hmac(Some([0xBB; 32].as_slice()), None, &digest, None, 3),
            Err(Error::CompromisedData)
        ));
    }

    #[test]
    fn classify_missing_copies() {
        let digest = [0xAA; 32];
        // Empty store is trivially fine; orphaned data is not.
        assert_eq!(
            classify_hmac(None, None, &digest, None, 0).unwrap(),
            HmacRepair::None
        );
        assert!(matches!(
            classify_hmac(None, None, &digest, None, 1),
            Err(Error::CompromisedData)
        ));
    }

    #[test]
    fn classify_in_delete_only() {
        let digest = [0xAA; 32];
        assert_eq!(
            classify_hmac(None, Some(digest.as_slice()), &digest, None, 1).unwrap(),
            HmacRepair::PromoteInDel
        );
        assert!(matches!(
            classify_hmac(None, Some([0xBB; 32].as_slice()), &digest, None, 1),
            Err(Error::CompromisedData)
        ));
    }

    #[test]
    fn classify_both_copies() {
        let digest = [0xAA; 32];
        let digest_plus = [0xBB; 32];
        let other = [0xCC; 32];

        assert_eq!(
            classify_hmac(Some(other.as_slice()), Some(digest.as_slice()), &digest, Some(&digest_plus), 1).unwrap(),
            HmacRepair::SwapAddedInDel
        );
        assert_eq!(
            classify_hmac(
                Some(digest_plus.as_slice()),
                Some(other.as_slice()),
                &digest,
                Some(&digest_plus),
                1
            )
            .unwrap(),
            HmacRepair::AdvanceCounter
        );
        assert_eq!(
            classify_hmac(Some(digest.as_slice()), Some(other.as_slice()), &digest, Some(&digest_plus), 1).unwrap(),
            HmacRepair::None
        );
        // Neither copy matching either counter: compromised.
        assert!(matches!(
            classify_hmac(Some(other.as_slice()), Some(other.as_slice()), &digest, Some(&digest_plus), 1),
            Err(Error::CompromisedData)
        ));
        // The defended "impossible" sub-case: in-delete matching counter+1.
        assert!(matches!(
            classify_hmac(
                Some(other.as_slice()),
                Some(digest_plus.as_slice()),
                &digest,
                Some(&digest_plus),
                1
            ),
            Err(Error::CompromisedData)
        ));
    }
}
