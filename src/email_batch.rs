//! Email Batch Writer (C6): dedup, adaptive batching, and the
//! `EmailBatch` block layout.
//!
//! One email at a time is accepted; the batch is flushed either when the
//! adaptive target is hit or the caller forces a flush. Batch layout
//! (before the codec layer runs) is a length-prefixed TOC followed by the
//! raw email bytes back to back, exactly as spec.md lays it out — `local_id`
//! is the TOC index, and offsets are derived from cumulative lengths, never
//! stored.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::codec::CodecId;
use crate::config::adaptive_batch_target;
use crate::error::{Error, Result};
use crate::index_store::IndexStore;

pub const ENVELOPE_HASH_NS: &str = "idx.envelope_hash";
pub const CONTENT_HASH_NS: &str = "idx.content_hash";
pub const MESSAGE_ID_NS: &str = "idx.message_id";
pub const COMPOUND_KEY_NS: &str = "idx.compound_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeId {
    pub block_id: i64,
    pub local_id: u32,
}

impl CompositeId {
    pub fn to_key(self) -> String {
        format!("{}:{}", self.block_id, self.local_id)
    }

    pub fn from_key(s: &str) -> Result<Self> {
        let (block_id, local_id) = s.split_once(':').ok_or_else(|| Error::invalid("malformed composite id"))?;
        Ok(CompositeId {
            block_id: block_id.parse().map_err(|_| Error::invalid("malformed composite id"))?,
            local_id: local_id.parse().map_err(|_| Error::invalid("malformed composite id"))?,
        })
    }
}

struct PendingEmail {
    envelope_hash: [u8; 32],
    content_hash: [u8; 32],
    bytes: Vec<u8>,
}

/// C6. Not durable until [`EmailBatchWriter::flush`] returns — the caller
/// is expected to hold exactly one writer per archive (§5's single-writer
/// model). Holds no reference to the index store itself: the caller passes
/// one in explicitly to the two methods that touch it, so the writer can
/// live as a long-lived field alongside the store on the engine facade
/// without any lifetime entanglement between the two.
pub struct EmailBatchWriter {
    pending: Vec<PendingEmail>,
    pending_bytes: u64,
    target_bytes: u64,
    block_size_override: Option<u64>,
}

pub struct FlushedBatch {
    pub payload: Vec<u8>,
    pub codec_hint: CodecId,
    pub composite_ids: Vec<(CompositeId, [u8; 32])>,
}

impl EmailBatchWriter {
    pub fn new(database_size_bytes: u64, block_size_override: Option<u64>) -> Self {
        let target_bytes = block_size_override.unwrap_or_else(|| adaptive_batch_target(database_size_bytes));
        Self { pending: Vec::new(), pending_bytes: 0, target_bytes, block_size_override }
    }

    /// Re-evaluates the adaptive target against the current database
    /// size. If the in-progress batch was started under a smaller target,
    /// the caller must flush before calling this with a larger size.
    pub fn retarget(&mut self, database_size_bytes: u64) {
        self.target_bytes = self.block_size_override.unwrap_or_else(|| adaptive_batch_target(database_size_bytes));
    }

    /// Returns `Some(existing composite id)` if this envelope_hash has
    /// already been stored (dedup hit); the caller skips appending.
    pub fn dedup_lookup(&self, index: &IndexStore, envelope_hash: &[u8; 32]) -> Option<CompositeId> {
        index
            .get(ENVELOPE_HASH_NS, envelope_hash)
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|key| CompositeId::from_key(&key).ok())
    }

    /// Appends one email to the in-progress batch. Returns `true` if the
    /// batch should now be flushed (size trigger hit).
    pub fn add_email(&mut self, envelope_hash: [u8; 32], content_hash: [u8; 32], bytes: Vec<u8>) -> bool {
        self.pending_bytes += bytes.len() as u64;
        self.pending.push(PendingEmail { envelope_hash, content_hash, bytes });
        self.pending_bytes >= self.target_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Serializes the TOC + data layout. Returns `None` if nothing is
    /// pending. The caller is responsible for compressing (LZ4 by default
    /// per spec.md §4.6), encrypting, and writing the block via C1/C2/C3,
    /// then calling [`EmailBatchWriter::record_indexes`] once the block is
    /// durable.
    pub fn serialize_batch(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(self.pending.len() as u32).unwrap();
        for email in &self.pending {
            buf.write_u32::<LittleEndian>(email.bytes.len() as u32).unwrap();
            buf.extend_from_slice(&email.envelope_hash);
            buf.extend_from_slice(&email.content_hash);
        }
        for email in &self.pending {
            buf.extend_from_slice(&email.bytes);
        }
        Some(buf)
    }

    /// Index updates MUST run only after the batch block is durable
    /// (§4.6/§5 ordering guarantee 2). Returns each email's composite id
    /// paired with its envelope_hash, for the caller to thread into C7.
    pub fn record_indexes(&mut self, index: &IndexStore, block_id: i64) -> Vec<(CompositeId, [u8; 32])> {
        let mut out = Vec::with_capacity(self.pending.len());
        for (local_id, email) in self.pending.drain(..).enumerate() {
            let composite = CompositeId { block_id, local_id: local_id as u32 };
            let key = composite.to_key();
            index.put(ENVELOPE_HASH_NS, email.envelope_hash.to_vec(), key.clone().into_bytes());
            index.put(CONTENT_HASH_NS, email.content_hash.to_vec(), key.clone().into_bytes());
            index.put(COMPOUND_KEY_NS, key.clone().into_bytes(), serialize_location(composite));
            out.push((composite, email.envelope_hash));
        }
        self.pending_bytes = 0;
        out
    }
}

pub(crate) fn serialize_location(id: CompositeId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.write_i64::<LittleEndian>(id.block_id).unwrap();
    buf.write_u32::<LittleEndian>(id.local_id).unwrap();
    buf
}

pub fn deserialize_location(bytes: &[u8]) -> Result<CompositeId> {
    let mut cur = Cursor::new(bytes);
    let block_id = cur.read_i64::<LittleEndian>().map_err(Error::Io)?;
    let local_id = cur.read_u32::<LittleEndian>().map_err(Error::Io)?;
    Ok(CompositeId { block_id, local_id })
}

/// TOC entry as read back from a decoded `EmailBatch` payload. Exactly the
/// three fields spec.md §4.6 fixes as the on-disk layout — the message-id
/// is never duplicated into the TOC; it lives solely in the
/// `message_id → compound_key` index.
#[derive(Debug, Clone)]
pub struct TocEntry {
    pub length: u32,
    pub envelope_hash: [u8; 32],
    pub content_hash: [u8; 32],
}

/// Parses an `EmailBatch` payload (post codec/crypto) back into its TOC
/// and the byte ranges of each email, computing offsets from the
/// cumulative lengths as spec.md requires.
pub fn parse_batch(payload: &[u8]) -> Result<Vec<(TocEntry, std::ops::Range<usize>)>> {
    let mut cur = Cursor::new(payload);
    let count = cur.read_u32::<LittleEndian>().map_err(Error::Io)? as usize;
    let mut toc = Vec::with_capacity(count);
    for _ in 0..count {
        let length = cur.read_u32::<LittleEndian>().map_err(Error::Io)?;
        let mut envelope_hash = [0u8; 32];
        let mut content_hash = [0u8; 32];
        std::io::Read::read_exact(&mut cur, &mut envelope_hash).map_err(Error::Io)?;
        std::io::Read::read_exact(&mut cur, &mut content_hash).map_err(Error::Io)?;
        toc.push(TocEntry { length, envelope_hash, content_hash });
    }

    let data_start = cur.position() as usize;
    let mut offset = data_start;
    let mut ranges = Vec::with_capacity(count);
    for entry in toc {
        let end = offset + entry.length as usize;
        if end > payload.len() {
            return Err(Error::corrupt(-1, "email batch TOC length exceeds payload"));
        }
        ranges.push((entry, offset..end));
        offset = end;
    }
    Ok(ranges)
}

/// Fetch one email's bytes from a decoded batch payload by `local_id`.
pub fn get_email(payload: &[u8], local_id: u32) -> Result<Vec<u8>> {
    let entries = parse_batch(payload)?;
    let (_, range) = entries
        .get(local_id as usize)
        .ok_or_else(|| Error::not_found(format!("local_id {local_id}")))?;
    Ok(payload[range.clone()].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(seed: u8) -> [u8; 32] {
        [seed; 32]
    }

    #[test]
    fn batch_roundtrip_single_email() {
        let index = IndexStore::new();
        let mut writer = EmailBatchWriter::new(0, None);
        writer.add_email(hash(1), hash(2), b"From: a@x\r\nSubject: hi\r\n\r\nhello".to_vec());
        let payload = writer.serialize_batch().unwrap();
        let ids = writer.record_indexes(&index, 42);
        assert_eq!(ids.len(), 1);

        let entries = parse_batch(&payload).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.envelope_hash, hash(1));
        let fetched = get_email(&payload, 0).unwrap();
        assert_eq!(fetched, b"From: a@x\r\nSubject: hi\r\n\r\nhello");
    }

    #[test]
    fn batch_roundtrip_multiple_emails() {
        let index = IndexStore::new();
        let mut writer = EmailBatchWriter::new(0, None);
        writer.add_email(hash(1), hash(10), b"email one".to_vec());
        writer.add_email(hash(2), hash(20), b"email two, a bit longer".to_vec());
        let payload = writer.serialize_batch().unwrap();
        writer.record_indexes(&index, 7);

        assert_eq!(get_email(&payload, 0).unwrap(), b"email one");
        assert_eq!(get_email(&payload, 1).unwrap(), b"email two, a bit longer");
    }

    #[test]
    fn dedup_returns_existing_composite_id() {
        let index = IndexStore::new();
        let mut writer = EmailBatchWriter::new(0, None);
        let envelope_hash = hash(5);
        writer.add_email(envelope_hash, hash(6), b"email".to_vec());
        writer.serialize_batch();
        writer.record_indexes(&index, 1);

        assert_eq!(writer.dedup_lookup(&index, &envelope_hash), Some(CompositeId { block_id: 1, local_id: 0 }));
    }

    #[test]
    fn adaptive_target_picks_expected_tier() {
        let small = EmailBatchWriter::new(0, None);
        let large = EmailBatchWriter::new(600 * 1024 * 1024 * 1024, None);
        assert_eq!(small.target_bytes, 50 * 1024 * 1024);
        assert_eq!(large.target_bytes, 1024 * 1024 * 1024);
    }

    #[test]
    fn override_bypasses_adaptive_sizer() {
        let writer = EmailBatchWriter::new(0, Some(123));
        assert_eq!(writer.target_bytes, 123);
    }

    #[test]
    fn composite_id_key_roundtrip() {
        let id = CompositeId { block_id: 99, local_id: 3 };
        assert_eq!(CompositeId::from_key(&id.to_key()).unwrap(), id);
    }
}
