//! The engine facade: the one type an embedder actually constructs. Wires
//! every component together into the write/read/maintenance dataflows —
//! nothing below this module knows about any other component, but nothing
//! above it (an embedding application) should need to touch a component
//! directly.
//!
//! MIME parsing is an explicit external collaborator: callers hand in a
//! [`MimeParser`] implementation rather than this crate shipping one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::block::{self, Block, BlockHeader, BlockType, Flags, PayloadEncoding};
use crate::cache::{BlockCache, HotLookupCache};
use crate::codec::{self, CodecId};
use crate::config::EngineConfig;
use crate::container::BlockContainer;
use crate::crypto::{self, EncryptionId};
use crate::email_batch::{self, CompositeId, EmailBatchWriter};
use crate::error::{Error, Result};
use crate::folder_store::{EmailEnvelope, Folder, FolderEnvelopeBlock, FolderStore};
use crate::hash_chain::HashChain;
use crate::id_alloc::IdAllocator;
use crate::index_coordinator::{EnvelopeMetadata, IndexCoordinator};
use crate::index_store::IndexStore;
use crate::key_manager::{KeyDerivationMode, KeyManager};
use crate::maintenance::{self, ScannedBlockInfo, SupersededReason};
use crate::sync::Semaphore;
use crate::txlog::TxLog;

pub use crate::archive_view::{ExistenceProof, ReadOnlyArchiveView, SearchCriteria, VerifyReport};

/// The default `EmailBatch` codec: LZ4, for its low CPU cost on the
/// append-heavy write path.
const DEFAULT_CODEC: CodecId = CodecId::Lz4;

/// Parsed email fields the engine needs and nothing more. Produced by the
/// caller-supplied [`MimeParser`] — this crate never reads a raw MIME
/// message itself.
#[derive(Debug, Clone)]
pub struct ParsedEmail {
    pub message_id: String,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: i64,
    pub text_body: String,
    pub html_body: String,
    pub attachments_count: u32,
}

/// External collaborator contract: turns a raw RFC 5322 message into the
/// fields the engine indexes. Implementations live outside this crate.
pub trait MimeParser: Send + Sync {
    fn parse(&self, raw: &[u8]) -> Result<ParsedEmail>;
}

fn hash_envelope(parsed: &ParsedEmail) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(parsed.message_id.as_bytes());
    hasher.update(parsed.from.as_bytes());
    hasher.update(parsed.to.as_bytes());
    hasher.update(&parsed.date.to_le_bytes());
    hasher.update(parsed.subject.as_bytes());
    *hasher.finalize().as_bytes()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchiveMetadata {
    archive_uuid: Uuid,
    format_version: u16,
    created_at: i64,
}

struct BatchState {
    writer: EmailBatchWriter,
    /// Kept in lockstep with `writer`'s pending list so flush can zip
    /// assigned local_ids back to the fields it needs to index.
    pending_meta: Vec<(ParsedEmail, String)>,
}

fn write_json_block(container: &BlockContainer, ids: &IdAllocator, block_type: BlockType, value: &impl Serialize) -> Result<i64> {
    let block_id = ids.next();
    let payload = serde_json::to_vec(value)?;
    let header = BlockHeader {
        version: block::FORMAT_VERSION,
        block_type,
        flags: Flags { compression_id: CodecId::None.to_nibble(), encryption_id: EncryptionId::None.to_nibble(), tombstone: false },
        payload_encoding: PayloadEncoding::Json,
        timestamp: now(),
        block_id,
        payload_length: payload.len() as i64,
    };
    container.write(&header, &payload)?;
    Ok(block_id)
}

fn seal(codec: CodecId, encryption: EncryptionId, key: Option<&[u8; 32]>, block_id: i64, plaintext: &[u8]) -> Result<Vec<u8>> {
    let compressed = codec::get_codec(codec).compress(plaintext, 3).map_err(|e| Error::invalid(e.to_string()))?;
    match encryption {
        EncryptionId::None => Ok(compressed),
        other => {
            let key = key.ok_or_else(|| Error::AuthFailure("encryption requested but key manager is locked".into()))?;
            crypto::encrypt(other, key, block_id, &compressed).map_err(|e| Error::AuthFailure(e.to_string()))
        }
    }
}

fn unseal(codec: CodecId, encryption: EncryptionId, key: Option<&[u8; 32]>, block_id: i64, raw: &[u8]) -> Result<Vec<u8>> {
    let decrypted = match encryption {
        EncryptionId::None => raw.to_vec(),
        other => {
            let key = key.ok_or_else(|| Error::AuthFailure("block is encrypted but no key was provided".into()))?;
            crypto::decrypt(other, key, block_id, raw).map_err(|_| Error::AuthFailure("decryption failed".into()))?
        }
    };
    codec::get_codec(codec).decompress(&decrypted).map_err(|e| Error::corrupt(block_id, e.to_string()))
}

/// Rebuild the location/dedup indexes for one already-decoded `EmailBatch`
/// payload. The TOC carries only envelope_hash/content_hash/length (spec.md
/// §4.6's fixed on-disk layout), so message-id and full-text — which need
/// the raw bytes re-parsed — are deliberately not rebuilt here; see
/// [`MailArchive::reindex_full_text`].
fn reindex_email_batch(index: &IndexStore, block_id: i64, payload: &[u8]) -> Result<()> {
    let entries = email_batch::parse_batch(payload)?;
    for (local_id, (toc, _range)) in entries.into_iter().enumerate() {
        let composite = CompositeId { block_id, local_id: local_id as u32 };
        let key = composite.to_key();
        index.put(email_batch::ENVELOPE_HASH_NS, toc.envelope_hash.to_vec(), key.clone().into_bytes());
        index.put(email_batch::CONTENT_HASH_NS, toc.content_hash.to_vec(), key.clone().into_bytes());
        index.put(email_batch::COMPOUND_KEY_NS, key.clone().into_bytes(), email_batch::serialize_location(composite));
    }
    Ok(())
}

/// The embedded email archive engine: the top-level facade over every
/// component below it. Construct with [`MailArchive::open`].
///
/// Fields are declared in acquisition order so that the compiler's
/// declaration-order field drop tears things down container-last: every
/// other component can still safely read through `container` while it is
/// being dropped, but nothing reads through a half-dropped component.
pub struct MailArchive {
    config: EngineConfig,
    archive_uuid: Uuid,
    key_manager: Mutex<KeyManager>,
    hash_chain: RwLock<HashChain>,
    block_ids: IdAllocator,
    hash_chain_ids: IdAllocator,
    index: Arc<IndexStore>,
    folders: FolderStore,
    batch: Mutex<BatchState>,
    block_cache: BlockCache,
    hot_cache: HotLookupCache<String, CompositeId>,
    writer_semaphore: Semaphore,
    txlog: TxLog,
    database_size: AtomicU64,
    container: Arc<BlockContainer>,
}

impl MailArchive {
    /// Opens (creating if absent) the archive at `path`, replaying its
    /// block container to reconstruct every in-memory component. The key
    /// manager starts locked; call [`unlock`](Self::unlock) before any
    /// encrypted block is written or read.
    #[tracing::instrument(skip(config))]
    pub fn open<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let container = Arc::new(BlockContainer::open(&path)?);
        let known = container.known_block_ids();

        let block_ids = IdAllocator::starting_at(1);
        let hash_chain_ids = IdAllocator::hash_chain();
        for id in &known {
            block_ids.observe(*id);
            hash_chain_ids.observe(*id);
        }

        let folders = FolderStore::rebuild(container.clone(), block_ids.clone(), &known)?;

        let index = Arc::new(IndexStore::new());
        let mut sorted_known = known.clone();
        sorted_known.sort_unstable();
        let mut chain_entries = Vec::new();
        let mut metadata_block_ids: Vec<i64> = Vec::new();
        for &id in &sorted_known {
            let block = container.read(id)?;
            match block.header.block_type {
                BlockType::EmailBatch => {
                    if block.header.flags.encryption_id == EncryptionId::None.to_nibble() {
                        let codec = CodecId::from_nibble(block.header.flags.compression_id)
                            .ok_or_else(|| Error::corrupt(id, "unknown compression id"))?;
                        let plaintext = unseal(codec, EncryptionId::None, None, id, &block.payload)?;
                        reindex_email_batch(&index, id, &plaintext)?;
                    } else {
                        tracing::warn!(block_id = id, "skipping reindex of encrypted batch at open; unlock then call reindex_full_text");
                    }
                }
                BlockType::HashChain => {
                    let entry: crate::hash_chain::HashChainEntry = serde_json::from_slice(&block.payload)?;
                    chain_entries.push(entry);
                }
                BlockType::Metadata => metadata_block_ids.push(id),
                _ => {}
            }
        }
        chain_entries.sort_by_key(|e| e.sequence);
        let hash_chain = HashChain::from_entries(chain_entries);

        for path_name in folders.all_paths() {
            for envelope in folders.list_envelopes(&path_name)? {
                let coordinator = IndexCoordinator::new(&index);
                let mut txn = coordinator.begin();
                let metadata = EnvelopeMetadata {
                    subject: envelope.subject.clone(),
                    from: envelope.from.clone(),
                    to: envelope.to.clone(),
                    date: envelope.date,
                    size: envelope.size,
                };
                coordinator.index_envelope_metadata(&mut txn, &envelope.compound_id, &metadata)?;
                txn.commit();
            }
        }

        let archive_uuid = if let Some(&latest) = metadata_block_ids.iter().max() {
            let block = container.read(latest)?;
            let metadata: ArchiveMetadata = serde_json::from_slice(&block.payload)?;
            metadata.archive_uuid
        } else {
            let archive_uuid = Uuid::new_v4();
            let metadata = ArchiveMetadata { archive_uuid, format_version: block::FORMAT_VERSION, created_at: now() };
            write_json_block(&container, &block_ids, BlockType::Metadata, &metadata)?;
            archive_uuid
        };

        let database_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            config,
            archive_uuid,
            key_manager: Mutex::new(KeyManager::new()),
            hash_chain: RwLock::new(hash_chain),
            block_ids,
            hash_chain_ids,
            index,
            folders,
            batch: Mutex::new(BatchState {
                writer: EmailBatchWriter::new(database_size, None),
                pending_meta: Vec::new(),
            }),
            block_cache: BlockCache::new(10_000),
            hot_cache: HotLookupCache::new(1024),
            writer_semaphore: Semaphore::new(5),
            txlog: TxLog::for_archive(&path),
            database_size: AtomicU64::new(database_size),
            container,
        })
    }

    pub fn archive_uuid(&self) -> Uuid {
        self.archive_uuid
    }

    pub fn database_size_bytes(&self) -> u64 {
        self.database_size.load(Ordering::SeqCst)
    }

    pub fn unlock(&self, password: &str, mode: KeyDerivationMode) -> Result<()> {
        self.key_manager.lock().unlock(password, self.archive_uuid.as_bytes(), mode)
    }

    pub fn lock(&self) {
        self.key_manager.lock().lock();
    }

    fn write_and_chain(&self, header: &BlockHeader, payload: &[u8]) -> Result<()> {
        self.container.write(header, payload)?;
        let header_bytes = block::encode_header(header)?;
        let entry = self
            .hash_chain
            .write()
            .append(header.block_id, header.timestamp, header.block_type, header.payload_length, &header_bytes, payload);
        let entry_bytes = serde_json::to_vec(&entry)?;
        let chain_block_id = self.hash_chain_ids.next();
        let chain_header = BlockHeader {
            version: block::FORMAT_VERSION,
            block_type: BlockType::HashChain,
            flags: Flags::default(),
            payload_encoding: PayloadEncoding::Json,
            timestamp: now(),
            block_id: chain_block_id,
            payload_length: entry_bytes.len() as i64,
        };
        self.container.write(&chain_header, &entry_bytes)?;
        Ok(())
    }

    /// Buffers one parsed email and immediately flushes it — compress,
    /// encrypt, frame, append, chain, then index only after the block is
    /// durable — so the returned id is durable on return. Batching
    /// several emails into one adaptively sized block is
    /// [`import_batch`](Self::import_batch)'s job.
    #[tracing::instrument(skip(self, raw, parser))]
    pub fn append_email(&self, raw: &[u8], folder_path: &str, parser: &dyn MimeParser) -> Result<CompositeId> {
        let _permit = self.writer_semaphore.acquire();
        let parsed = parser.parse(raw)?;
        let envelope_hash = hash_envelope(&parsed);

        if let Some(existing) = self.batch.lock().writer.dedup_lookup(&self.index, &envelope_hash) {
            return Ok(existing);
        }

        let content_hash: [u8; 32] = *blake3::hash(raw).as_bytes();
        {
            let mut batch = self.batch.lock();
            batch.writer.add_email(envelope_hash, content_hash, raw.to_vec());
            batch.pending_meta.push((parsed, folder_path.to_string()));
        }
        let ids = self.flush(DEFAULT_CODEC)?;
        ids.last().copied().ok_or_else(|| Error::invalid("flush produced no composite id"))
    }

    /// Bulk import: every email is buffered before a flush (or however
    /// many the adaptive sizer triggers along the way), giving the
    /// adaptive batch sizer a real multi-email block to work with.
    pub fn import_batch(&self, emails: &[(Vec<u8>, String)], parser: &dyn MimeParser) -> Result<Vec<CompositeId>> {
        let _permit = self.writer_semaphore.acquire();
        let mut out = Vec::with_capacity(emails.len());
        for (raw, folder_path) in emails {
            let parsed = parser.parse(raw)?;
            let envelope_hash = hash_envelope(&parsed);
            if let Some(existing) = self.batch.lock().writer.dedup_lookup(&self.index, &envelope_hash) {
                out.push(existing);
                continue;
            }
            let content_hash: [u8; 32] = *blake3::hash(raw).as_bytes();
            let should_flush = {
                let mut batch = self.batch.lock();
                let trigger = batch.writer.add_email(envelope_hash, content_hash, raw.clone());
                batch.pending_meta.push((parsed, folder_path.clone()));
                trigger
            };
            if should_flush {
                out.extend(self.flush(DEFAULT_CODEC)?);
            }
        }
        out.extend(self.flush(DEFAULT_CODEC)?);
        Ok(out)
    }

    fn flush(&self, codec: CodecId) -> Result<Vec<CompositeId>> {
        let (payload_opt, metas) = {
            let mut batch = self.batch.lock();
            let payload = batch.writer.serialize_batch();
            let metas = std::mem::take(&mut batch.pending_meta);
            (payload, metas)
        };
        let Some(plaintext) = payload_opt else {
            return Ok(Vec::new());
        };

        let block_id = self.block_ids.next();
        let (encryption, key) = {
            let mut km = self.key_manager.lock();
            if km.is_unlocked() {
                let key = km.generate_block_key(block_id)?;
                (EncryptionId::AesGcm, Some(key))
            } else {
                (EncryptionId::None, None)
            }
        };
        let sealed = seal(codec, encryption, key.as_ref(), block_id, &plaintext)?;
        let header = BlockHeader {
            version: block::FORMAT_VERSION,
            block_type: BlockType::EmailBatch,
            flags: Flags { compression_id: codec.to_nibble(), encryption_id: encryption.to_nibble(), tombstone: false },
            payload_encoding: PayloadEncoding::RawBytes,
            timestamp: now(),
            block_id,
            payload_length: sealed.len() as i64,
        };
        self.write_and_chain(&header, &sealed)?;
        self.database_size.fetch_add(sealed.len() as u64 + block::FIXED_OVERHEAD, Ordering::SeqCst);

        let assigned = {
            let mut batch = self.batch.lock();
            batch.writer.record_indexes(&self.index, block_id)
        };

        let coordinator = IndexCoordinator::new(&self.index);
        let mut composite_ids = Vec::with_capacity(assigned.len());
        for ((composite, envelope_hash), (parsed, folder_path)) in assigned.iter().zip(metas.iter()) {
            let key = composite.to_key();
            let mut txn = coordinator.begin();
            coordinator.index_message_id(&mut txn, &parsed.message_id, &key);
            let metadata = EnvelopeMetadata {
                subject: parsed.subject.clone(),
                from: parsed.from.clone(),
                to: parsed.to.clone(),
                date: parsed.date,
                size: plaintext.len() as u64,
            };
            coordinator.index_envelope_metadata(&mut txn, &key, &metadata)?;
            let body = format!("{} {}", parsed.text_body, parsed.html_body);
            coordinator.index_full_text(&mut txn, &key, &parsed.subject, &body);
            txn.commit();

            let envelope = EmailEnvelope {
                subject: parsed.subject.clone(),
                from: parsed.from.clone(),
                to: parsed.to.clone(),
                date: parsed.date,
                size: metadata.size,
                has_attachments: parsed.attachments_count > 0,
                envelope_hash: *envelope_hash,
                compound_id: key.clone(),
            };
            self.folders.add_email(folder_path, envelope)?;
            self.hot_cache.put(key.clone(), *composite);
            composite_ids.push(*composite);
        }

        self.txlog.append("flush_batch", json!({"block_id": block_id, "count": composite_ids.len()}), json!({}))?;
        Ok(composite_ids)
    }

    /// Re-derives the full-text and message-id indexes for every archived
    /// email by re-fetching and re-parsing its raw bytes. Neither lives in
    /// the `EmailBatch` TOC (spec.md §4.6 fixes that layout to
    /// length/envelope_hash/content_hash only), so both are rebuilt here
    /// rather than at `open()`. Needed after `open()` reconstructs an
    /// archive with encrypted batches it couldn't decode without a key, or
    /// simply to pick up a parser upgrade.
    pub fn reindex_full_text(&self, parser: &dyn MimeParser) -> Result<()> {
        let coordinator = IndexCoordinator::new(&self.index);
        for path in self.folders.all_paths() {
            for envelope in self.folders.list_envelopes(&path)? {
                let raw = self.get_email(&envelope.compound_id)?;
                let parsed = parser.parse(&raw)?;
                let mut txn = coordinator.begin();
                coordinator.index_message_id(&mut txn, &parsed.message_id, &envelope.compound_id);
                let body = format!("{} {}", parsed.text_body, parsed.html_body);
                coordinator.index_full_text(&mut txn, &envelope.compound_id, &parsed.subject, &body);
                txn.commit();
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn get_email(&self, compound_key: &str) -> Result<Vec<u8>> {
        let composite = match self.hot_cache.get(&compound_key.to_string()) {
            Some(c) => c,
            None => {
                let c = IndexCoordinator::new(&self.index).resolve_location(compound_key)?;
                self.hot_cache.put(compound_key.to_string(), c);
                c
            }
        };
        self.get_by_composite(composite)
    }

    fn get_by_composite(&self, composite: CompositeId) -> Result<Vec<u8>> {
        let payload = match self.block_cache.get(composite.block_id) {
            Some(cached) => cached,
            None => {
                let block = self.container.read(composite.block_id)?;
                let plaintext = self.decode_batch_payload(&block)?;
                let arc = Arc::new(plaintext);
                self.block_cache.insert(composite.block_id, &arc);
                arc
            }
        };
        email_batch::get_email(&payload, composite.local_id)
    }

    fn decode_batch_payload(&self, block: &Block) -> Result<Vec<u8>> {
        let codec = CodecId::from_nibble(block.header.flags.compression_id)
            .ok_or_else(|| Error::corrupt(block.header.block_id, "unknown compression id"))?;
        let encryption = EncryptionId::from_nibble(block.header.flags.encryption_id)
            .ok_or_else(|| Error::corrupt(block.header.block_id, "unknown encryption id"))?;
        let key = if encryption != EncryptionId::None {
            Some(self.key_manager.lock().get_block_key(block.header.block_id)?)
        } else {
            None
        };
        unseal(codec, encryption, key.as_ref(), block.header.block_id, &block.payload)
    }

    pub fn find_by_message_id(&self, message_id: &str) -> Option<String> {
        IndexCoordinator::new(&self.index).find_by_message_id(message_id)
    }

    pub fn search(&self, query: &str) -> Vec<(String, f64)> {
        IndexCoordinator::new(&self.index).search(query)
    }

    pub fn create_folder(&self, path: &str) -> Result<u64> {
        self.folders.create(path)
    }

    pub fn delete_folder(&self, path: &str, recursive: bool) -> Result<()> {
        self.folders.delete(path, recursive)
    }

    pub fn rename_folder(&self, old_path: &str, new_name: &str) -> Result<()> {
        self.folders.rename(old_path, new_name)
    }

    pub fn move_folder(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.folders.move_folder(old_path, new_path)
    }

    pub fn move_email(&self, compound_id: &str, from_path: &str, to_path: &str) -> Result<()> {
        self.hot_cache.invalidate(&compound_id.to_string());
        self.folders.move_email(compound_id, from_path, to_path)
    }

    /// Removes an email from a folder's envelope listing. The underlying
    /// `EmailBatch` block is untouched — only [`run_maintenance`](Self::run_maintenance)
    /// reclaims space, once the superseded envelope block passes the
    /// configured safety margin.
    pub fn remove_email(&self, compound_id: &str, path: &str) -> Result<()> {
        self.hot_cache.invalidate(&compound_id.to_string());
        self.folders.remove_email(path, compound_id)
    }

    pub fn list_subfolders(&self, path: &str) -> Vec<String> {
        self.folders.list_subfolders(path)
    }

    pub fn list_envelopes(&self, path: &str) -> Result<Vec<EmailEnvelope>> {
        self.folders.list_envelopes(path)
    }

    pub fn verify(&self) -> Result<VerifyReport> {
        ReadOnlyArchiveView::open(&self.container).verify(&self.hash_chain.read())
    }

    pub fn existence_proof(&self, sequence: u64) -> Result<ExistenceProof> {
        ReadOnlyArchiveView::open(&self.container).existence_proof(&self.hash_chain.read(), sequence)
    }

    fn build_scanned_info(&self) -> Result<Vec<ScannedBlockInfo>> {
        let mut out = Vec::new();
        for id in self.container.known_block_ids() {
            let block = self.container.read(id)?;
            let mut info = ScannedBlockInfo {
                block_id: id,
                block_type: block.header.block_type,
                envelope_block_id: None,
                previous_block_id: None,
                referenced_batch_ids: Vec::new(),
            };
            match block.header.block_type {
                BlockType::Folder => {
                    if let Ok(folder) = serde_json::from_slice::<Folder>(&block.payload) {
                        info.envelope_block_id = Some(folder.envelope_block_id);
                    }
                }
                BlockType::FolderEnvelope => {
                    if let Ok(envelope_block) = serde_json::from_slice::<FolderEnvelopeBlock>(&block.payload) {
                        info.previous_block_id = envelope_block.previous_block_id;
                    }
                }
                _ => {}
            }
            out.push(info);
        }
        Ok(out)
    }

    /// Offline compaction: takes every writer permit for the duration,
    /// identifies superseded blocks past the safety margin, and rewrites
    /// the container without them. Returns `None` if nothing was eligible
    /// for deletion.
    #[tracing::instrument(skip(self))]
    pub fn run_maintenance(&self) -> Result<Option<PathBuf>> {
        let _permits: Vec<_> = (0..self.config.max_concurrent_operations).map(|_| self.writer_semaphore.acquire()).collect();

        let scanned = self.build_scanned_info()?;
        let explicit = self.folders.superseded.write().drain(..).map(|id| (id, SupersededReason::FolderMutation)).collect::<Vec<_>>();
        let superseded = maintenance::build_superseded_set(explicit, &scanned, self.config.key_manager_versions_to_keep);

        let now_ts = now();
        let eligible: HashSet<i64> = superseded
            .iter()
            .filter(|s| maintenance::past_safety_margin(s, now_ts, self.config.min_age_hours_for_deletion))
            .map(|s| s.block_id)
            .collect();
        if eligible.is_empty() {
            return Ok(None);
        }

        let container = &self.container;
        let mut keep: Vec<i64> = container.known_block_ids().into_iter().filter(|id| !eligible.contains(id)).collect();
        keep.sort_by_key(|id| container.location(*id).map(|loc| loc.offset).unwrap_or(u64::MAX));

        let backup = maintenance::compact(container.path(), self.config.backups_to_keep, |tmp_path| {
            let fresh = BlockContainer::open(tmp_path)?;
            for id in &keep {
                let block = container.read(*id)?;
                fresh.write(&block.header, &block.payload)?;
            }
            Ok(())
        })?;

        self.container.scan()?;
        self.txlog.append("compact", json!({"removed": eligible.len(), "kept": keep.len()}), json!({}))?;
        Ok(Some(backup))
    }
}

fn now() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
