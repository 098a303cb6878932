//! On-disk block frame: the 61-byte fixed-overhead envelope every block in
//! the container is wrapped in.
//!
//! This module only frames and validates bytes — it knows nothing about
//! compression or encryption. The engine facade compresses and encrypts a
//! payload first, then hands the resulting bytes to [`encode_frame`]; on
//! read it reverses the order.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor, Read, Write};

use crate::error::{Error, Result};

pub const HEADER_MAGIC: u64 = 0x00EE_411D_BBD1_14EE;
pub const FOOTER_MAGIC: u64 = !HEADER_MAGIC;
pub const FIXED_OVERHEAD: u64 = 61;
pub const FORMAT_VERSION: u16 = 1;

/// Ordinary blocks, checkpoint blocks, and hash-chain entries share one id
/// space, partitioned by range so a reader can classify a block_id without
/// reading its type byte.
pub const CHECKPOINT_ID_BASE: i64 = 1_000_000_000_000;
pub const HASH_CHAIN_ID_BASE: i64 = 2_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockType {
    Metadata,
    Wal,
    FolderTree,
    Folder,
    FolderEnvelope,
    Segment,
    EmailBatch,
    KeyManager,
    HashChain,
    Cleanup,
    FreeSpace,
}

impl BlockType {
    fn to_u8(self) -> u8 {
        match self {
            BlockType::Metadata => 0,
            BlockType::Wal => 1,
            BlockType::FolderTree => 2,
            BlockType::Folder => 3,
            BlockType::FolderEnvelope => 4,
            BlockType::Segment => 5,
            BlockType::EmailBatch => 6,
            BlockType::KeyManager => 7,
            BlockType::HashChain => 8,
            BlockType::Cleanup => 9,
            BlockType::FreeSpace => 10,
        }
    }

    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => BlockType::Metadata,
            1 => BlockType::Wal,
            2 => BlockType::FolderTree,
            3 => BlockType::Folder,
            4 => BlockType::FolderEnvelope,
            5 => BlockType::Segment,
            6 => BlockType::EmailBatch,
            7 => BlockType::KeyManager,
            8 => BlockType::HashChain,
            9 => BlockType::Cleanup,
            10 => BlockType::FreeSpace,
            other => return Err(Error::invalid(format!("unknown block_type byte {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    RawBytes,
    Json,
    Protobuf,
    CapnProto,
}

impl PayloadEncoding {
    fn to_u8(self) -> u8 {
        match self {
            PayloadEncoding::RawBytes => 0,
            PayloadEncoding::Json => 1,
            PayloadEncoding::Protobuf => 2,
            PayloadEncoding::CapnProto => 3,
        }
    }

    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => PayloadEncoding::RawBytes,
            1 => PayloadEncoding::Json,
            2 => PayloadEncoding::Protobuf,
            3 => PayloadEncoding::CapnProto,
            other => return Err(Error::invalid(format!("unknown payload_encoding byte {other}"))),
        })
    }
}

/// Low nibble: compression id (0-15). Bits 4-6: encryption id (0-7).
/// Bit 0x80: tombstone marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub compression_id: u8,
    pub encryption_id: u8,
    pub tombstone: bool,
}

impl Flags {
    pub fn to_byte(self) -> u8 {
        (self.compression_id & 0x0F) | ((self.encryption_id & 0x07) << 4) | if self.tombstone { 0x80 } else { 0 }
    }

    pub fn from_byte(b: u8) -> Self {
        Flags {
            compression_id: b & 0x0F,
            encryption_id: (b >> 4) & 0x07,
            tombstone: b & 0x80 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    pub version: u16,
    pub block_type: BlockType,
    pub flags: Flags,
    pub payload_encoding: PayloadEncoding,
    pub timestamp: i64,
    pub block_id: i64,
    pub payload_length: i64,
}

impl BlockHeader {
    fn write_unchecksummed(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_u64::<LittleEndian>(HEADER_MAGIC)?;
        buf.write_u16::<LittleEndian>(self.version)?;
        buf.write_u8(self.block_type.to_u8())?;
        buf.write_u8(self.flags.to_byte())?;
        buf.write_u8(self.payload_encoding.to_u8())?;
        buf.write_i64::<LittleEndian>(self.timestamp)?;
        buf.write_i64::<LittleEndian>(self.block_id)?;
        buf.write_i64::<LittleEndian>(self.payload_length)?;
        Ok(())
    }
}

pub struct Block {
    pub header: BlockHeader,
    pub payload: Vec<u8>,
}

/// Frame `payload` (already compressed/encrypted by the caller) into the
/// on-disk byte sequence, computing both checksums and both magics.
pub fn encode_frame(header: &BlockHeader, payload: &[u8]) -> Result<Vec<u8>> {
    if header.block_id == 0 {
        return Err(Error::invalid("block_id 0 is reserved, callers must assign a nonzero id"));
    }
    if header.payload_length as usize != payload.len() {
        return Err(Error::invalid("payload_length does not match payload bytes"));
    }

    let mut buf = Vec::with_capacity(FIXED_OVERHEAD as usize + payload.len());
    header.write_unchecksummed(&mut buf).map_err(Error::Io)?;
    debug_assert_eq!(buf.len(), 37);

    let header_checksum = crc32fast::hash(&buf);
    buf.write_u32::<LittleEndian>(header_checksum).map_err(Error::Io)?;
    debug_assert_eq!(buf.len(), 41);

    buf.extend_from_slice(payload);

    let payload_checksum = if payload.is_empty() { 0 } else { crc32fast::hash(payload) };
    buf.write_u32::<LittleEndian>(payload_checksum).map_err(Error::Io)?;
    buf.write_u64::<LittleEndian>(FOOTER_MAGIC).map_err(Error::Io)?;

    let total_length = FIXED_OVERHEAD + payload.len() as u64;
    buf.write_u64::<LittleEndian>(total_length).map_err(Error::Io)?;

    Ok(buf)
}

/// Parse one frame from the front of `bytes`. Returns the decoded block
/// plus the number of bytes consumed. Does not reverse codec/crypto — the
/// returned payload is exactly what `encode_frame` was given.
pub fn decode_frame(bytes: &[u8]) -> Result<(Block, usize)> {
    if bytes.len() < 41 {
        return Err(Error::corrupt(-1, "buffer shorter than fixed header"));
    }
    let mut cur = Cursor::new(bytes);

    let header_magic = cur.read_u64::<LittleEndian>().map_err(Error::Io)?;
    if header_magic != HEADER_MAGIC {
        return Err(Error::corrupt(-1, "bad header_magic"));
    }
    let version = cur.read_u16::<LittleEndian>().map_err(Error::Io)?;
    let block_type = BlockType::from_u8(cur.read_u8().map_err(Error::Io)?)?;
    let flags = Flags::from_byte(cur.read_u8().map_err(Error::Io)?);
    let payload_encoding = PayloadEncoding::from_u8(cur.read_u8().map_err(Error::Io)?)?;
    let timestamp = cur.read_i64::<LittleEndian>().map_err(Error::Io)?;
    let block_id = cur.read_i64::<LittleEndian>().map_err(Error::Io)?;
    let payload_length = cur.read_i64::<LittleEndian>().map_err(Error::Io)?;

    let header_end = cur.position() as usize;
    debug_assert_eq!(header_end, 37);
    let header_checksum = cur.read_u32::<LittleEndian>().map_err(Error::Io)?;
    let computed_header_checksum = crc32fast::hash(&bytes[0..37]);
    if header_checksum != computed_header_checksum {
        return Err(Error::corrupt(block_id, "header checksum mismatch"));
    }

    if payload_length < 0 {
        return Err(Error::corrupt(block_id, "negative payload_length"));
    }
    let payload_length = payload_length as usize;
    let payload_start = 41usize;
    let payload_end = payload_start
        .checked_add(payload_length)
        .ok_or_else(|| Error::corrupt(block_id, "payload_length overflow"))?;
    if bytes.len() < payload_end + 4 + 8 + 8 {
        return Err(Error::corrupt(block_id, "buffer truncated before footer"));
    }

    let payload = bytes[payload_start..payload_end].to_vec();

    let mut tail = Cursor::new(&bytes[payload_end..]);
    let payload_checksum = tail.read_u32::<LittleEndian>().map_err(Error::Io)?;
    let computed_payload_checksum = if payload.is_empty() { 0 } else { crc32fast::hash(&payload) };
    if payload_checksum != computed_payload_checksum {
        return Err(Error::corrupt(block_id, "payload checksum mismatch"));
    }

    let footer_magic = tail.read_u64::<LittleEndian>().map_err(Error::Io)?;
    if footer_magic != FOOTER_MAGIC {
        return Err(Error::corrupt(block_id, "bad footer_magic"));
    }
    let total_length = tail.read_u64::<LittleEndian>().map_err(Error::Io)?;
    let expected_total = FIXED_OVERHEAD + payload_length as u64;
    if total_length != expected_total {
        return Err(Error::corrupt(block_id, "total_length does not match frame size"));
    }

    let header = BlockHeader {
        version,
        block_type,
        flags,
        payload_encoding,
        timestamp,
        block_id,
        payload_length: payload_length as i64,
    };

    Ok((Block { header, payload }, payload_end + 4 + 8 + 8))
}

/// The fixed 41-byte header prefix (magic through header_checksum) with no
/// payload attached. Unlike [`encode_frame`], this needs no payload bytes
/// at all — it's what the hash chain hashes alongside the payload,
/// since a block's identity for chaining purposes is its header fields,
/// not the frame encoding of some particular payload it happened to carry.
pub fn encode_header(header: &BlockHeader) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(41);
    header.write_unchecksummed(&mut buf).map_err(Error::Io)?;
    let header_checksum = crc32fast::hash(&buf);
    buf.write_u32::<LittleEndian>(header_checksum).map_err(Error::Io)?;
    Ok(buf)
}

/// Reads exactly one frame from a `Read` stream whose cursor sits at a
/// frame boundary. Used by the forward scanner once `locate_magic` has
/// found a candidate offset.
pub fn read_frame<R: Read>(mut r: R) -> Result<Block> {
    let mut fixed = [0u8; 41];
    r.read_exact(&mut fixed).map_err(Error::Io)?;
    let payload_length = i64::from_le_bytes(fixed[29..37].try_into().unwrap());
    if payload_length < 0 {
        return Err(Error::corrupt(-1, "negative payload_length"));
    }
    let mut rest = vec![0u8; payload_length as usize + 4 + 8 + 8];
    r.read_exact(&mut rest).map_err(Error::Io)?;

    let mut whole = Vec::with_capacity(41 + rest.len());
    whole.extend_from_slice(&fixed);
    whole.extend_from_slice(&rest);
    let (block, _) = decode_frame(&whole)?;
    Ok(block)
}

pub fn write_frame<W: Write>(mut w: W, header: &BlockHeader, payload: &[u8]) -> Result<()> {
    let bytes = encode_frame(header, payload)?;
    w.write_all(&bytes).map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(block_id: i64, payload_len: usize) -> BlockHeader {
        BlockHeader {
            version: FORMAT_VERSION,
            block_type: BlockType::EmailBatch,
            flags: Flags { compression_id: 0, encryption_id: 0, tombstone: false },
            payload_encoding: PayloadEncoding::RawBytes,
            timestamp: 1_700_000_000,
            block_id,
            payload_length: payload_len as i64,
        }
    }

    #[test]
    fn roundtrip_empty_payload() {
        let header = sample_header(1, 0);
        let bytes = encode_frame(&header, &[]).unwrap();
        assert_eq!(bytes.len(), FIXED_OVERHEAD as usize);
        let (block, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(block.header.block_id, 1);
        assert!(block.payload.is_empty());
    }

    #[test]
    fn roundtrip_nonempty_payload() {
        let payload = b"hello archive".to_vec();
        let header = sample_header(42, payload.len());
        let bytes = encode_frame(&header, &payload).unwrap();
        let (block, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(block.payload, payload);
    }

    #[test]
    fn rejects_zero_block_id() {
        let header = sample_header(0, 0);
        assert!(encode_frame(&header, &[]).is_err());
    }

    #[test]
    fn detects_header_corruption() {
        let header = sample_header(7, 3);
        let mut bytes = encode_frame(&header, b"abc").unwrap();
        bytes[10] ^= 0xFF;
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn detects_payload_corruption() {
        let header = sample_header(7, 3);
        let mut bytes = encode_frame(&header, b"abc").unwrap();
        let payload_offset = 41;
        bytes[payload_offset] ^= 0xFF;
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn flags_roundtrip() {
        let flags = Flags { compression_id: 3, encryption_id: 2, tombstone: true };
        let byte = flags.to_byte();
        assert_eq!(Flags::from_byte(byte), flags);
    }

    #[test]
    fn total_length_enables_backward_seek() {
        let payload = vec![7u8; 100];
        let header = sample_header(9, payload.len());
        let bytes = encode_frame(&header, &payload).unwrap();
        let total_length = u64::from_le_bytes(bytes[bytes.len() - 8..].try_into().unwrap());
        assert_eq!(total_length as usize, bytes.len());
    }
}
