//! # mailarc — embedded, single-file email archive engine
//!
//! Format guarantees:
//! - All blocks live in one append-only file: magic, version, type, flags,
//!   CRC32 header checksum and payload checksum; corrupt headers abort reads
//! - Block ids partition into ordinary (`< 1_000_000_000_000`), checkpoint
//!   (`[1e12, 2e12)`), and hash-chain (`>= 2e12`) ranges
//! - Every written block is appended to a SHA-256 hash chain with a
//!   Merkle root exportable as a tamper-evidence proof
//! - Compression and encryption are independent per-block choices encoded
//!   in the flags byte; unknown codec/cipher ids are a hard read error
//! - MIME parsing is out of scope: callers supply a [`MimeParser`]

pub mod archive;
pub mod archive_view;
pub mod block;
pub mod cache;
pub mod codec;
pub mod config;
pub mod container;
pub mod crypto;
pub mod email_batch;
pub mod error;
pub mod folder_store;
pub mod hash_chain;
pub mod id_alloc;
pub mod index_coordinator;
pub mod index_store;
pub mod key_manager;
pub mod maintenance;
pub mod sync;
pub mod txlog;

// Flat re-exports for the most common types.
pub use archive::{ExistenceProof, MailArchive, MimeParser, ParsedEmail, ReadOnlyArchiveView, SearchCriteria, VerifyReport};
pub use block::{BlockHeader, BlockType, Flags, PayloadEncoding};
pub use codec::{get_codec, get_codec_by_nibble, CodecError, CodecId};
pub use config::EngineConfig;
pub use crypto::{CryptoError, EncryptionId};
pub use email_batch::CompositeId;
pub use error::{Error, Result};
pub use folder_store::{EmailEnvelope, Folder};
pub use key_manager::KeyDerivationMode;
pub use maintenance::SupersededReason;
