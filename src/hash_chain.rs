//! Tamper-evident history over the blocks written so far.
//!
//! `block_hash = SHA-256(header_bytes || payload_bytes)`,
//! `chain_hash = SHA-256(prev_chain_hash || block_hash)`. Entries are
//! themselves persisted as blocks with `block_id >= HASH_CHAIN_ID_BASE`,
//! so the chain is recoverable by a plain forward scan like everything
//! else in the container.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::block::BlockType;
use crate::error::{Error, Result};

/// SHA-256 of the fixed ASCII string `"mailarc genesis"`, padded with
/// zeroes — the fixed starting point every chain is anchored to.
pub const GENESIS: [u8; 32] = [
    0x6d, 0x61, 0x69, 0x6c, 0x61, 0x72, 0x63, 0x20, 0x67, 0x65, 0x6e, 0x65, 0x73, 0x69, 0x73, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashChainEntry {
    pub sequence: u64,
    pub referenced_block_id: i64,
    pub timestamp: i64,
    pub block_hash: [u8; 32],
    pub previous_chain_hash: [u8; 32],
    pub chain_hash: [u8; 32],
    pub block_type: BlockType,
    pub block_size: i64,
}

pub fn block_hash(header_bytes: &[u8], payload_bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(header_bytes);
    hasher.update(payload_bytes);
    hasher.finalize().into()
}

fn chain_hash(prev_chain_hash: &[u8; 32], block_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_chain_hash);
    hasher.update(block_hash);
    hasher.finalize().into()
}

/// In-memory append-only chain, rebuilt from a scan on open.
#[derive(Debug, Default)]
pub struct HashChain {
    entries: Vec<HashChainEntry>,
}

impl HashChain {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn from_entries(entries: Vec<HashChainEntry>) -> Self {
        Self { entries }
    }

    pub fn tail(&self) -> [u8; 32] {
        self.entries.last().map(|e| e.chain_hash).unwrap_or(GENESIS)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        referenced_block_id: i64,
        timestamp: i64,
        block_type: BlockType,
        block_size: i64,
        header_bytes: &[u8],
        payload_bytes: &[u8],
    ) -> HashChainEntry {
        let bh = block_hash(header_bytes, payload_bytes);
        let prev = self.tail();
        let ch = chain_hash(&prev, &bh);
        let entry = HashChainEntry {
            sequence: self.entries.len() as u64,
            referenced_block_id,
            timestamp,
            block_hash: bh,
            previous_chain_hash: prev,
            chain_hash: ch,
            block_type,
            block_size,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Recompute `block_hash`/`chain_hash` for one entry against the raw
    /// bytes it claims to cover and the chain position it claims to hold.
    pub fn verify_block(&self, index: usize, header_bytes: &[u8], payload_bytes: &[u8]) -> Result<()> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| Error::not_found(format!("no hash chain entry at index {index}")))?;
        let expected_block_hash = block_hash(header_bytes, payload_bytes);
        if expected_block_hash != entry.block_hash {
            return Err(Error::ChainBroken {
                sequence: entry.sequence,
                reason: "block_hash mismatch".into(),
            });
        }
        let prev = if index == 0 { GENESIS } else { self.entries[index - 1].chain_hash };
        if prev != entry.previous_chain_hash {
            return Err(Error::ChainBroken {
                sequence: entry.sequence,
                reason: "previous_chain_hash does not match the preceding entry".into(),
            });
        }
        let expected_chain_hash = chain_hash(&prev, &entry.block_hash);
        if expected_chain_hash != entry.chain_hash {
            return Err(Error::ChainBroken {
                sequence: entry.sequence,
                reason: "chain_hash mismatch".into(),
            });
        }
        Ok(())
    }

    /// Walk the whole chain checking link-to-link consistency (not the
    /// underlying block bytes — use `verify_block` per-entry for that).
    pub fn verify_chain(&self) -> Result<()> {
        let mut prev = GENESIS;
        for entry in &self.entries {
            if entry.previous_chain_hash != prev {
                return Err(Error::ChainBroken {
                    sequence: entry.sequence,
                    reason: "previous_chain_hash does not match the preceding entry".into(),
                });
            }
            let expected = chain_hash(&prev, &entry.block_hash);
            if expected != entry.chain_hash {
                return Err(Error::ChainBroken {
                    sequence: entry.sequence,
                    reason: "chain_hash does not follow from previous entry".into(),
                });
            }
            prev = entry.chain_hash;
        }
        Ok(())
    }

    /// Merkle root over every `block_hash` in the chain, pairwise
    /// SHA-256, duplicating the last node on an odd level.
    pub fn export_merkle_root(&self) -> [u8; 32] {
        if self.entries.is_empty() {
            return GENESIS;
        }
        let mut level: Vec<[u8; 32]> = self.entries.iter().map(|e| e.block_hash).collect();
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(*level.last().unwrap());
            }
            level = level
                .chunks(2)
                .map(|pair| {
                    let mut hasher = Sha256::new();
                    hasher.update(pair[0]);
                    hasher.update(pair[1]);
                    hasher.finalize().into()
                })
                .collect();
        }
        level[0]
    }

    pub fn entries(&self) -> &[HashChainEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_verify_single_entry() {
        let mut chain = HashChain::new();
        chain.append(1, 1_700_000_000, BlockType::EmailBatch, 7, b"header", b"payload");
        chain.verify_block(0, b"header", b"payload").unwrap();
        chain.verify_chain().unwrap();
    }

    #[test]
    fn verify_block_detects_payload_tamper() {
        let mut chain = HashChain::new();
        chain.append(1, 1_700_000_000, BlockType::EmailBatch, 7, b"header", b"payload");
        assert!(chain.verify_block(0, b"header", b"tampered").is_err());
    }

    #[test]
    fn chain_links_depend_on_order() {
        let mut chain = HashChain::new();
        chain.append(1, 1_700_000_000, BlockType::EmailBatch, 2, b"h1", b"p1");
        chain.append(2, 1_700_000_001, BlockType::EmailBatch, 2, b"h2", b"p2");
        chain.verify_chain().unwrap();

        let mut broken = HashChain::from_entries(chain.entries().to_vec());
        broken.entries.swap(0, 1);
        assert!(broken.verify_chain().is_err());
    }

    #[test]
    fn merkle_root_handles_odd_count() {
        let mut chain = HashChain::new();
        chain.append(1, 1_700_000_000, BlockType::EmailBatch, 2, b"h1", b"p1");
        chain.append(2, 1_700_000_001, BlockType::EmailBatch, 2, b"h2", b"p2");
        chain.append(3, 1_700_000_002, BlockType::EmailBatch, 2, b"h3", b"p3");
        let root = chain.export_merkle_root();
        assert_ne!(root, GENESIS);
    }

    #[test]
    fn empty_chain_root_is_genesis() {
        let chain = HashChain::new();
        assert_eq!(chain.export_merkle_root(), GENESIS);
        assert_eq!(chain.tail(), GENESIS);
    }
}
