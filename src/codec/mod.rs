//! Compression codec registry.
//!
//! Unlike the block frame's encryption nibble, compression identity is a
//! plain small integer (0-15, the low nibble of the flags byte) rather than
//! a UUID — there is no plugin ABI in this crate, so there is nothing to
//! negotiate at runtime. The five-codec set below is closed and frozen; a
//! reader that sees an id outside this set fails immediately rather than
//! guessing.

use std::io::{Read, Write};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    None,
    Gzip,
    Lz4,
    Zstd,
    Brotli,
}

impl CodecId {
    pub fn to_nibble(self) -> u8 {
        match self {
            CodecId::None => 0,
            CodecId::Gzip => 1,
            CodecId::Lz4 => 2,
            CodecId::Zstd => 3,
            CodecId::Brotli => 4,
        }
    }

    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0 => Some(CodecId::None),
            1 => Some(CodecId::Gzip),
            2 => Some(CodecId::Lz4),
            3 => Some(CodecId::Zstd),
            4 => Some(CodecId::Brotli),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecId::None => "none",
            CodecId::Gzip => "gzip",
            CodecId::Lz4 => "lz4",
            CodecId::Zstd => "zstd",
            CodecId::Brotli => "brotli",
        }
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    #[error("unknown compression id {0}")]
    UnknownId(u8),
}

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId {
        CodecId::None
    }
    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}

pub struct GzipCodec;
impl Codec for GzipCodec {
    fn codec_id(&self) -> CodecId {
        CodecId::Gzip
    }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        let level = level.clamp(0, 9) as u32;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
        encoder
            .write_all(data)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        use flate2::read::GzDecoder;
        let mut out = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn codec_id(&self) -> CodecId {
        CodecId::Lz4
    }
    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId {
        CodecId::Zstd
    }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn codec_id(&self) -> CodecId {
        CodecId::Brotli
    }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

/// Resolve a flags-nibble id to a built-in codec. No fallback: an
/// unrecognised id is always a hard error.
pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None => Box::new(NoneCodec),
        CodecId::Gzip => Box::new(GzipCodec),
        CodecId::Lz4 => Box::new(Lz4Codec),
        CodecId::Zstd => Box::new(ZstdCodec),
        CodecId::Brotli => Box::new(BrotliCodec),
    }
}

pub fn get_codec_by_nibble(nibble: u8) -> Result<Box<dyn Codec>, CodecError> {
    CodecId::from_nibble(nibble).map(get_codec).ok_or(CodecError::UnknownId(nibble))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: &dyn Codec, data: &[u8]) {
        let compressed = codec.compress(data, 3).unwrap();
        let decompressed = codec.decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn all_codecs_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        for id in [CodecId::None, CodecId::Gzip, CodecId::Lz4, CodecId::Zstd, CodecId::Brotli] {
            roundtrip(get_codec(id).as_ref(), &data);
        }
    }

    #[test]
    fn nibble_roundtrip() {
        for id in [CodecId::None, CodecId::Gzip, CodecId::Lz4, CodecId::Zstd, CodecId::Brotli] {
            assert_eq!(CodecId::from_nibble(id.to_nibble()), Some(id));
        }
    }

    #[test]
    fn unknown_nibble_errors() {
        assert!(get_codec_by_nibble(200).is_err());
    }

    #[test]
    fn empty_input_roundtrip() {
        for id in [CodecId::None, CodecId::Gzip, CodecId::Lz4, CodecId::Zstd, CodecId::Brotli] {
            roundtrip(get_codec(id).as_ref(), b"");
        }
    }
}
