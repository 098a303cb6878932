//! Per-block authenticated encryption and Argon2id key derivation.
//!
//! Four providers share the flags byte's 3-bit encryption nibble: `None`,
//! `AesGcm`, `ChaCha20Poly1305`, `AesCbcHmacSha256`. The two AEAD providers
//! derive their nonce deterministically from the block key and `block_id`
//! (a BLAKE3 keyed hash truncated to the nonce length) so no nonce needs to
//! be stored — a given `(key, block_id)` pair is only ever encrypted once
//! in this engine's write model (§4.2) — and additionally bind `block_id`
//! as AEAD associated data, so ciphertext from one block cannot be
//! transplanted onto another even if the nonce derivation were ever reused.
//! CBC has no such guarantee: reusing an IV under CBC leaks plaintext
//! structure, so its IV is always fresh random bytes stored alongside the
//! ciphertext, and the whole thing is MACed (encrypt-then-MAC, HMAC-SHA256
//! over `iv || ciphertext || block_id`).

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce as GcmNonce};
use chacha20poly1305::aead::{Aead as ChaChaAead, Payload as ChaChaPayload};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit as ChaChaKeyInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

pub const NONCE_LEN: usize = 12;
const CBC_IV_LEN: usize = 16;
const HMAC_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionId {
    None,
    AesGcm,
    ChaCha20Poly1305,
    AesCbcHmacSha256,
}

impl EncryptionId {
    pub fn to_nibble(self) -> u8 {
        match self {
            EncryptionId::None => 0,
            EncryptionId::AesGcm => 1,
            EncryptionId::ChaCha20Poly1305 => 2,
            EncryptionId::AesCbcHmacSha256 => 3,
        }
    }

    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0 => Some(EncryptionId::None),
            1 => Some(EncryptionId::AesGcm),
            2 => Some(EncryptionId::ChaCha20Poly1305),
            3 => Some(EncryptionId::AesCbcHmacSha256),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed — wrong key or corrupted data")]
    DecryptionFailed,
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encrypted payload too short")]
    TooShort,
    #[error("block is encrypted but no key was provided")]
    MissingKey,
}

/// Derive a 256-bit master key from a password and salt (the archive UUID)
/// using Argon2id with conservative parameters.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    use argon2::{Algorithm, Argon2, Params, Version};
    let params = Params::new(64 * 1024, 3, 1, Some(32)).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

fn deterministic_nonce(key: &[u8; 32], block_id: i64, len: usize) -> Vec<u8> {
    let mut ctx = blake3::Hasher::new_keyed(key);
    ctx.update(&block_id.to_le_bytes());
    let mut out = vec![0u8; len];
    ctx.finalize_xof().fill(&mut out);
    out
}

fn subkey(key: &[u8; 32], context: &str) -> [u8; 32] {
    blake3::derive_key(context, key)
}

pub fn encrypt(id: EncryptionId, key: &[u8; 32], block_id: i64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match id {
        EncryptionId::None => Ok(plaintext.to_vec()),
        EncryptionId::AesGcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailed)?;
            let nonce_bytes = deterministic_nonce(key, block_id, NONCE_LEN);
            let nonce = GcmNonce::from_slice(&nonce_bytes);
            let aad = block_id.to_le_bytes();
            let ciphertext = cipher
                .encrypt(nonce, Payload { msg: plaintext, aad: &aad })
                .map_err(|_| CryptoError::EncryptionFailed)?;
            Ok(ciphertext)
        }
        EncryptionId::ChaCha20Poly1305 => {
            let cipher =
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailed)?;
            let nonce_bytes = deterministic_nonce(key, block_id, 12);
            let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
            let aad = block_id.to_le_bytes();
            cipher
                .encrypt(nonce, ChaChaPayload { msg: plaintext, aad: &aad })
                .map_err(|_| CryptoError::EncryptionFailed)
        }
        EncryptionId::AesCbcHmacSha256 => {
            let enc_key = subkey(key, "mailarc.dev v1 cbc-encrypt");
            let mac_key = subkey(key, "mailarc.dev v1 cbc-mac");

            let mut iv = [0u8; CBC_IV_LEN];
            AeadOsRng.fill_bytes(&mut iv);

            let encryptor = cbc::Encryptor::<aes::Aes256>::new(
                aes::cipher::generic_array::GenericArray::from_slice(&enc_key),
                aes::cipher::generic_array::GenericArray::from_slice(&iv),
            );
            let ciphertext = encryptor.encrypt_padded_vec_mut::<aes::cipher::block_padding::Pkcs7>(plaintext);

            let mut mac = Hmac::<Sha256>::new_from_slice(&mac_key).map_err(|_| CryptoError::EncryptionFailed)?;
            mac.update(&iv);
            mac.update(&ciphertext);
            mac.update(&block_id.to_le_bytes());
            let tag = mac.finalize().into_bytes();

            let mut out = Vec::with_capacity(CBC_IV_LEN + ciphertext.len() + HMAC_LEN);
            out.extend_from_slice(&iv);
            out.extend_from_slice(&ciphertext);
            out.extend_from_slice(&tag);
            Ok(out)
        }
    }
}

pub fn decrypt(id: EncryptionId, key: &[u8; 32], block_id: i64, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match id {
        EncryptionId::None => Ok(data.to_vec()),
        EncryptionId::AesGcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailed)?;
            let nonce_bytes = deterministic_nonce(key, block_id, NONCE_LEN);
            let nonce = GcmNonce::from_slice(&nonce_bytes);
            let aad = block_id.to_le_bytes();
            cipher
                .decrypt(nonce, Payload { msg: data, aad: &aad })
                .map_err(|_| CryptoError::DecryptionFailed)
        }
        EncryptionId::ChaCha20Poly1305 => {
            let cipher =
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailed)?;
            let nonce_bytes = deterministic_nonce(key, block_id, 12);
            let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
            let aad = block_id.to_le_bytes();
            cipher
                .decrypt(nonce, ChaChaPayload { msg: data, aad: &aad })
                .map_err(|_| CryptoError::DecryptionFailed)
        }
        EncryptionId::AesCbcHmacSha256 => {
            if data.len() < CBC_IV_LEN + HMAC_LEN {
                return Err(CryptoError::TooShort);
            }
            let (iv_and_ct, tag) = data.split_at(data.len() - HMAC_LEN);
            let (iv, ciphertext) = iv_and_ct.split_at(CBC_IV_LEN);

            let enc_key = subkey(key, "mailarc.dev v1 cbc-encrypt");
            let mac_key = subkey(key, "mailarc.dev v1 cbc-mac");

            let mut mac = Hmac::<Sha256>::new_from_slice(&mac_key).map_err(|_| CryptoError::DecryptionFailed)?;
            mac.update(iv);
            mac.update(ciphertext);
            mac.update(&block_id.to_le_bytes());
            mac.verify_slice(tag).map_err(|_| CryptoError::DecryptionFailed)?;

            let decryptor = cbc::Decryptor::<aes::Aes256>::new(
                aes::cipher::generic_array::GenericArray::from_slice(&enc_key),
                aes::cipher::generic_array::GenericArray::from_slice(iv),
            );
            decryptor
                .decrypt_padded_vec_mut::<aes::cipher::block_padding::Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::DecryptionFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_identity() {
        let key = [0u8; 32];
        let data = b"plaintext";
        let ct = encrypt(EncryptionId::None, &key, 1, data).unwrap();
        assert_eq!(ct, data);
        let pt = decrypt(EncryptionId::None, &key, 1, &ct).unwrap();
        assert_eq!(pt, data);
    }

    #[test]
    fn aes_gcm_roundtrip() {
        let key = [7u8; 32];
        let data = b"an email body worth protecting";
        let ct = encrypt(EncryptionId::AesGcm, &key, 42, data).unwrap();
        assert_ne!(ct, data);
        let pt = decrypt(EncryptionId::AesGcm, &key, 42, &ct).unwrap();
        assert_eq!(pt, data);
    }

    #[test]
    fn aes_gcm_wrong_block_id_fails() {
        let key = [7u8; 32];
        let data = b"secret";
        let ct = encrypt(EncryptionId::AesGcm, &key, 42, data).unwrap();
        assert!(decrypt(EncryptionId::AesGcm, &key, 43, &ct).is_err());
    }

    #[test]
    fn chacha20_poly1305_roundtrip() {
        let key = [3u8; 32];
        let data = b"another secret email";
        let ct = encrypt(EncryptionId::ChaCha20Poly1305, &key, 99, data).unwrap();
        let pt = decrypt(EncryptionId::ChaCha20Poly1305, &key, 99, &ct).unwrap();
        assert_eq!(pt, data);
    }

    #[test]
    fn aes_cbc_hmac_roundtrip() {
        let key = [9u8; 32];
        let data = b"cbc protected payload that spans several AES blocks of data";
        let ct = encrypt(EncryptionId::AesCbcHmacSha256, &key, 5, data).unwrap();
        let pt = decrypt(EncryptionId::AesCbcHmacSha256, &key, 5, &ct).unwrap();
        assert_eq!(pt, data);
    }

    #[test]
    fn aes_cbc_hmac_tamper_detected() {
        let key = [9u8; 32];
        let data = b"cbc protected payload";
        let mut ct = encrypt(EncryptionId::AesCbcHmacSha256, &key, 5, data).unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(decrypt(EncryptionId::AesCbcHmacSha256, &key, 5, &ct).is_err());
    }

    #[test]
    fn cbc_nonce_is_random_each_call() {
        let key = [1u8; 32];
        let data = b"same plaintext";
        let a = encrypt(EncryptionId::AesCbcHmacSha256, &key, 1, data).unwrap();
        let b = encrypt(EncryptionId::AesCbcHmacSha256, &key, 1, data).unwrap();
        assert_ne!(a[..16], b[..16]);
    }
}
