//! Block container: frame, checksum, write, locate, and read individual
//! blocks in one append-only file.
//!
//! Writers take the file lock exclusive, readers take it shared. This
//! container commits one block per `write()` call; batching multiple
//! emails into a single block is the email batch writer's job, not this
//! module's.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::block::{self, Block, BlockHeader, FIXED_OVERHEAD, HEADER_MAGIC};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub offset: u64,
    pub length: u64,
}

/// C1. One instance owns the file handle exclusively for the lifetime of
/// the archive.
pub struct BlockContainer {
    path: PathBuf,
    file: RwLock<File>,
    locations: RwLock<HashMap<i64, BlockLocation>>,
}

impl BlockContainer {
    /// Open (creating if absent) and scan the file to rebuild the
    /// location map.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path).map_err(Error::Io)?;
        let container = Self { path, file: RwLock::new(file), locations: RwLock::new(HashMap::new()) };
        container.scan()?;
        Ok(container)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a fully framed block to the end of the file in one
    /// buffered, flushed write — the flush is the durability commit point.
    #[tracing::instrument(skip(self, payload), fields(block_id = header.block_id))]
    pub fn write(&self, header: &BlockHeader, payload: &[u8]) -> Result<BlockLocation> {
        let bytes = block::encode_frame(header, payload)?;
        let mut file = self.file.write();
        let offset = file.seek(SeekFrom::End(0)).map_err(Error::Io)?;
        file.write_all(&bytes).map_err(Error::Io)?;
        file.flush().map_err(Error::Io)?;
        let location = BlockLocation { offset, length: bytes.len() as u64 };
        self.locations.write().insert(header.block_id, location);
        tracing::debug!(offset, length = location.length, "wrote block");
        Ok(location)
    }

    /// Looks up the block's offset and reads + validates it in place.
    #[tracing::instrument(skip(self))]
    pub fn read(&self, block_id: i64) -> Result<Block> {
        let location = *self
            .locations
            .read()
            .get(&block_id)
            .ok_or_else(|| Error::not_found(format!("block {block_id}")))?;
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(location.offset)).map_err(Error::Io)?;
        let mut buf = vec![0u8; location.length as usize];
        file.read_exact(&mut buf).map_err(Error::Io)?;
        let (block, consumed) = block::decode_frame(&buf)?;
        if consumed as u64 != location.length {
            tracing::warn!(block_id, "frame length does not match recorded location");
            return Err(Error::corrupt(block_id, "frame length does not match recorded location"));
        }
        Ok(block)
    }

    pub fn location(&self, block_id: i64) -> Option<BlockLocation> {
        self.locations.read().get(&block_id).copied()
    }

    pub fn known_block_ids(&self) -> Vec<i64> {
        self.locations.read().keys().copied().collect()
    }

    /// Forward walk from offset 0, validating each frame, to rebuild the
    /// location map. Stops at the first invalid frame (a torn tail) and
    /// keeps everything before it.
    #[tracing::instrument(skip(self))]
    pub fn scan(&self) -> Result<Vec<(i64, BlockLocation)>> {
        let mut file = self.file.write();
        let file_len = file.seek(SeekFrom::End(0)).map_err(Error::Io)?;
        file.seek(SeekFrom::Start(0)).map_err(Error::Io)?;

        let mut results = Vec::new();
        let mut offset = 0u64;
        loop {
            if file_len - offset < FIXED_OVERHEAD {
                break;
            }
            let mut fixed = [0u8; 41];
            if file.read_exact(&mut fixed).is_err() {
                break;
            }
            let payload_length = i64::from_le_bytes(fixed[29..37].try_into().unwrap());
            if payload_length < 0 {
                break;
            }
            let tail_len = payload_length as u64 + 4 + 8 + 8;
            if offset + 41 + tail_len > file_len {
                break;
            }
            let mut rest = vec![0u8; tail_len as usize];
            if file.read_exact(&mut rest).is_err() {
                break;
            }

            let mut whole = Vec::with_capacity(41 + rest.len());
            whole.extend_from_slice(&fixed);
            whole.extend_from_slice(&rest);

            match block::decode_frame(&whole) {
                Ok((decoded, consumed)) => {
                    let location = BlockLocation { offset, length: consumed as u64 };
                    results.push((decoded.header.block_id, location));
                    offset += consumed as u64;
                }
                Err(_) => break,
            }
        }

        if offset < file_len {
            tracing::warn!(torn_bytes = file_len - offset, "scan stopped at torn tail");
        }

        let mut locations = self.locations.write();
        locations.clear();
        for (id, loc) in &results {
            locations.insert(*id, *loc);
        }
        Ok(results)
    }

    /// Memory-mapped chunked scan for every byte offset where
    /// `header_magic` occurs — a torn-file recovery fallback used when
    /// `scan()` stops earlier than expected.
    pub fn locate_magic(&self) -> Result<Vec<u64>> {
        let file = self.file.read();
        let len = file.metadata().map_err(Error::Io)?.len();
        if len == 0 {
            return Ok(Vec::new());
        }
        let mmap = unsafe { memmap2::Mmap::map(&*file).map_err(Error::Io)? };
        let needle = HEADER_MAGIC.to_le_bytes();
        let mut offsets = Vec::new();
        let mut i = 0usize;
        while i + needle.len() <= mmap.len() {
            if mmap[i..i + needle.len()] == needle {
                offsets.push(i as u64);
            }
            i += 1;
        }
        Ok(offsets)
    }

    /// Reverse recovery path: starting from EOF, read the trailing
    /// `total_length` field and step backward one frame at a time. Used by
    /// the maintenance engine to cheaply sanity-check a `scan()` result
    /// before paying for a full forward walk.
    pub fn scan_from_tail(&self) -> Result<Vec<(i64, BlockLocation)>> {
        let mut file = self.file.write();
        let file_len = file.seek(SeekFrom::End(0)).map_err(Error::Io)?;
        let mut cursor = file_len;
        let mut results = Vec::new();

        while cursor >= FIXED_OVERHEAD {
            file.seek(SeekFrom::Start(cursor - 8)).map_err(Error::Io)?;
            let mut total_length_bytes = [0u8; 8];
            file.read_exact(&mut total_length_bytes).map_err(Error::Io)?;
            let total_length = u64::from_le_bytes(total_length_bytes);
            if total_length < FIXED_OVERHEAD || total_length > cursor {
                break;
            }
            let frame_start = cursor - total_length;
            file.seek(SeekFrom::Start(frame_start)).map_err(Error::Io)?;
            let mut frame = vec![0u8; total_length as usize];
            file.read_exact(&mut frame).map_err(Error::Io)?;
            match block::decode_frame(&frame) {
                Ok((decoded, consumed)) if consumed as u64 == total_length => {
                    results.push((decoded.header.block_id, BlockLocation { offset: frame_start, length: total_length }));
                    cursor = frame_start;
                }
                _ => break,
            }
        }

        results.reverse();
        Ok(results)
    }
}
