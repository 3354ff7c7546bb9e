// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Crypto primitive bindings consumed by the cipher codec and the
//! integrity chain: AES-256-CBC, HMAC-SHA256, HKDF-SHA256, and the CSPRNG.
//!
//! Only the OpenSSL backend exists today; the module split keeps the door
//! open for a platform backend the way the storage layer is pluggable.

mod ossl;

pub(crate) use ossl::aes256_cbc_decrypt;
pub(crate) use ossl::aes256_cbc_encrypt;
pub(crate) use ossl::hkdf_sha256;
pub(crate) use ossl::hmac_sha256;
pub(crate) use ossl::random_iv;
