// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::md::Md;
use openssl::pkey::Id;
use openssl::pkey::PKey;
use openssl::pkey_ctx::PkeyCtx;
use openssl::sign::Signer;
use openssl::symm::Cipher;
use openssl::symm::Crypter;
use openssl::symm::Mode;
use protvar_format::ENC_BLOCK_SIZE;
use protvar_format::VARIABLE_KEY_SIZE;

/// HKDF-SHA256 extract-and-expand with an empty salt, RFC 5869.
pub fn hkdf_sha256(
    ikm: &[u8],
    info: &[u8],
) -> Result<[u8; VARIABLE_KEY_SIZE], ErrorStack> {
    let mut ctx = PkeyCtx::new_id(Id::HKDF)?;
    ctx.derive_init()?;
    ctx.set_hkdf_md(Md::sha256())?;
    ctx.set_hkdf_key(ikm)?;
    ctx.set_hkdf_salt(&[])?;
    ctx.add_hkdf_info(info)?;
    let mut key = [0u8; VARIABLE_KEY_SIZE];
    ctx.derive(Some(&mut key))?;
    Ok(key)
}

/// One-shot HMAC-SHA256.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ErrorStack> {
    let key = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
    signer.update(data)?;
    let digest = signer.sign_to_vec()?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// AES-256-CBC over block-aligned data. Padding is the caller's business.
pub fn aes256_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    cbc(Mode::Encrypt, key, iv, data)
}

/// Inverse of [`aes256_cbc_encrypt`]; output length equals input length.
pub fn aes256_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    cbc(Mode::Decrypt, key, iv, data)
}

fn cbc(mode: Mode, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    let cipher = Cipher::aes_256_cbc();
    let mut crypter = Crypter::new(cipher, mode, key, Some(iv))?;
    crypter.pad(false);
    let mut out = vec![0u8; data.len() + cipher.block_size()];
    let mut n = crypter.update(data, &mut out)?;
    n += crypter.finalize(&mut out[n..])?;
    out.truncate(n);
    Ok(out)
}

/// A fresh random initialization vector.
pub fn random_iv() -> Result<[u8; ENC_BLOCK_SIZE], ErrorStack> {
    let mut iv = [0u8; ENC_BLOCK_SIZE];
    openssl::rand::rand_bytes(&mut iv)?;
    Ok(iv)
}
