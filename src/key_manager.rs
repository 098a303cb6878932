//! Key Manager (C3): locked/unlocked master-key state machine and
//! per-block key derivation/storage.
//!
//! The serialized key map is itself written back to the container as a
//! `KeyManager` block, encrypted under the master key via the codec layer's
//! AEAD path — the key manager dogfoods the same encryption primitives it
//! hands out to callers, rather than inventing a second format.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, EncryptionId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivationMode {
    /// Block keys are derived on demand from the master key + block_id.
    /// Nothing per-block is persisted.
    Derive,
    /// Block keys are generated randomly and stored, wrapped under the
    /// master key, in the key map.
    Random,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct StoredBlockKey {
    block_id: i64,
    /// AES-256-GCM-wrapped 32-byte key, keyed by the master key.
    wrapped: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct KeyManagerSnapshot {
    version: u32,
    stored_keys: Vec<StoredBlockKey>,
}

enum State {
    Locked,
    Unlocked {
        master_key: [u8; 32],
        mode: KeyDerivationMode,
        random_keys: HashMap<i64, [u8; 32]>,
    },
}

/// C3. Construct with [`KeyManager::new`], call [`unlock`] before any
/// block-key operation.
pub struct KeyManager {
    state: State,
}

impl KeyManager {
    pub fn new() -> Self {
        Self { state: State::Locked }
    }

    pub fn is_unlocked(&self) -> bool {
        matches!(self.state, State::Unlocked { .. })
    }

    pub fn unlock(&mut self, password: &str, archive_salt: &[u8], mode: KeyDerivationMode) -> Result<()> {
        let master_key = crypto::derive_key(password, archive_salt).map_err(|e| Error::AuthFailure(e.to_string()))?;
        self.state = State::Unlocked { master_key, mode, random_keys: HashMap::new() };
        Ok(())
    }

    pub fn lock(&mut self) {
        self.state = State::Locked;
    }

    /// Produce (and, in `Random` mode, remember) the key for `block_id`.
    pub fn generate_block_key(&mut self, block_id: i64) -> Result<[u8; 32]> {
        match &mut self.state {
            State::Locked => Err(Error::AuthFailure("key manager is locked".into())),
            State::Unlocked { master_key, mode, random_keys } => match mode {
                KeyDerivationMode::Derive => Ok(derive_block_key(master_key, block_id)),
                KeyDerivationMode::Random => {
                    if let Some(existing) = random_keys.get(&block_id) {
                        return Ok(*existing);
                    }
                    let key = random_key();
                    random_keys.insert(block_id, key);
                    Ok(key)
                }
            },
        }
    }

    /// Fetch a previously generated key. In `Derive` mode this always
    /// succeeds (it's recomputed); in `Random` mode the key must already
    /// have been generated or restored from a snapshot.
    pub fn get_block_key(&self, block_id: i64) -> Result<[u8; 32]> {
        match &self.state {
            State::Locked => Err(Error::AuthFailure("key manager is locked".into())),
            State::Unlocked { master_key, mode, random_keys } => match mode {
                KeyDerivationMode::Derive => Ok(derive_block_key(master_key, block_id)),
                KeyDerivationMode::Random => random_keys
                    .get(&block_id)
                    .copied()
                    .ok_or_else(|| Error::not_found(format!("no stored key for block {block_id}"))),
            },
        }
    }

    /// Serialize the random-key table, wrapping each key under the master
    /// key. Returns `None` in `Derive` mode (nothing to persist).
    pub fn snapshot(&self) -> Result<Option<KeyManagerSnapshot>> {
        match &self.state {
            State::Locked => Err(Error::AuthFailure("key manager is locked".into())),
            State::Unlocked { master_key, mode: KeyDerivationMode::Derive, .. } => {
                let _ = master_key;
                Ok(None)
            }
            State::Unlocked { master_key, mode: KeyDerivationMode::Random, random_keys } => {
                let mut stored_keys = Vec::with_capacity(random_keys.len());
                for (block_id, key) in random_keys {
                    let wrapped = crypto::encrypt(EncryptionId::AesGcm, master_key, *block_id, key)
                        .map_err(|e| Error::AuthFailure(e.to_string()))?;
                    stored_keys.push(StoredBlockKey { block_id: *block_id, wrapped });
                }
                Ok(Some(KeyManagerSnapshot { version: 1, stored_keys }))
            }
        }
    }

    /// Restore random keys from a snapshot decoded from a `KeyManager`
    /// block. Requires the manager already be unlocked with the matching
    /// master key.
    pub fn restore(&mut self, snapshot: &KeyManagerSnapshot) -> Result<()> {
        match &mut self.state {
            State::Locked => Err(Error::AuthFailure("key manager is locked".into())),
            State::Unlocked { master_key, random_keys, .. } => {
                for stored in &snapshot.stored_keys {
                    let plain = crypto::decrypt(EncryptionId::AesGcm, master_key, stored.block_id, &stored.wrapped)
                        .map_err(|_| Error::AuthFailure("key map decryption failed".into()))?;
                    let key: [u8; 32] = plain
                        .as_slice()
                        .try_into()
                        .map_err(|_| Error::corrupt(stored.block_id, "stored key has wrong length"))?;
                    random_keys.insert(stored.block_id, key);
                }
                Ok(())
            }
        }
    }
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new()
    }
}

fn derive_block_key(master_key: &[u8; 32], block_id: i64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(master_key);
    hasher.update(b"mailarc.dev v1 block-key");
    hasher.update(&block_id.to_le_bytes());
    *hasher.finalize().as_bytes()
}

fn random_key() -> [u8; 32] {
    use aes_gcm::aead::rand_core::RngCore;
    let mut key = [0u8; 32];
    aes_gcm::aead::OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_mode_is_deterministic_and_stateless() {
        let mut km = KeyManager::new();
        km.unlock("hunter2", b"0123456789abcdef", KeyDerivationMode::Derive).unwrap();
        let a = km.generate_block_key(10).unwrap();
        let b = km.get_block_key(10).unwrap();
        assert_eq!(a, b);
        assert!(km.snapshot().unwrap().is_none());
    }

    #[test]
    fn random_mode_roundtrips_through_snapshot() {
        let mut km = KeyManager::new();
        km.unlock("hunter2", b"0123456789abcdef", KeyDerivationMode::Random).unwrap();
        let key = km.generate_block_key(77).unwrap();
        let snap = km.snapshot().unwrap().unwrap();

        let mut km2 = KeyManager::new();
        km2.unlock("hunter2", b"0123456789abcdef", KeyDerivationMode::Random).unwrap();
        km2.restore(&snap).unwrap();
        assert_eq!(km2.get_block_key(77).unwrap(), key);
    }

    #[test]
    fn locked_manager_refuses_operations() {
        let km = KeyManager::new();
        assert!(km.get_block_key(1).is_err());
    }

    #[test]
    fn different_passwords_derive_different_keys() {
        let mut a = KeyManager::new();
        a.unlock("password-a", b"salt1234salt1234", KeyDerivationMode::Derive).unwrap();
        let mut b = KeyManager::new();
        b.unlock("password-b", b"salt1234salt1234", KeyDerivationMode::Derive).unwrap();
        assert_ne!(a.generate_block_key(1).unwrap(), b.generate_block_key(1).unwrap());
    }
}
