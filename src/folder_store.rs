//! Folder & Envelope Store (C7): versioned folder snapshots and per-folder
//! envelope lists.
//!
//! Every mutation is create-only: a `move`, `rename`, `add_email`, etc.
//! writes a brand new `Folder` block and a brand new `FolderEnvelope`
//! block, linking back to the one it replaces. `FolderEnvelope` blocks are
//! written uncompressed (§4.2: "none for envelope lists for fast scan").

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::block::{BlockHeader, BlockType, Flags, PayloadEncoding};
use crate::codec::CodecId;
use crate::container::BlockContainer;
use crate::crypto::EncryptionId;
use crate::error::{Error, Result};
use crate::id_alloc::IdAllocator;

const SEPARATOR: char = '\\';
const FORBIDDEN_CHARS: [char; 7] = ['<', '>', ':', '"', '|', '?', '*'];

pub fn validate_path(path: &str) -> Result<()> {
    if path.ends_with(SEPARATOR) {
        return Err(Error::invalid("folder path must not end with a separator"));
    }
    if path.contains("\\\\") {
        return Err(Error::invalid("folder path must not contain a doubled separator"));
    }
    if let Some(bad) = path.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(Error::invalid(format!("folder path contains forbidden character '{bad}'")));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub folder_id: u64,
    pub parent_folder_id: u64,
    pub path: String,
    pub email_ids: Vec<String>,
    pub envelope_block_id: i64,
    pub version: u64,
    pub last_modified: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FolderTreeSnapshot {
    pub root_folder_id: u64,
    pub path_to_folder_id: HashMap<String, u64>,
    pub folder_id_to_block_id: HashMap<u64, i64>,
    pub folder_id_to_parent: HashMap<u64, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailEnvelope {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: i64,
    pub size: u64,
    pub has_attachments: bool,
    pub envelope_hash: [u8; 32],
    pub compound_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderEnvelopeBlock {
    pub folder_path: String,
    pub version: u64,
    pub previous_block_id: Option<i64>,
    pub envelopes: Vec<EmailEnvelope>,
}

const ROOT_FOLDER_ID: u64 = 0;

/// C7. Holds the live folder tree and per-folder folder structs in
/// memory; every mutating call durably persists the new snapshot blocks
/// before returning. Owns a shared handle on the container rather than
/// borrowing it, so the engine facade can hold a `FolderStore` and the
/// `BlockContainer` it reads/writes through side by side.
pub struct FolderStore {
    container: Arc<BlockContainer>,
    ids: IdAllocator,
    next_folder_id: AtomicI64,
    tree: RwLock<FolderTreeSnapshot>,
    folders: RwLock<HashMap<u64, Folder>>,
    /// Block ids superseded by a mutation, for C9 to fold into its
    /// superseded set.
    pub superseded: RwLock<Vec<i64>>,
    pub latest_tree_block_id: RwLock<Option<i64>>,
}

impl FolderStore {
    pub fn new(container: Arc<BlockContainer>, ids: IdAllocator) -> Self {
        let mut tree = FolderTreeSnapshot::default();
        tree.path_to_folder_id.insert(String::new(), ROOT_FOLDER_ID);
        let mut folders = HashMap::new();
        folders.insert(
            ROOT_FOLDER_ID,
            Folder {
                folder_id: ROOT_FOLDER_ID,
                parent_folder_id: ROOT_FOLDER_ID,
                path: String::new(),
                email_ids: Vec::new(),
                envelope_block_id: 0,
                version: 0,
                last_modified: 0,
            },
        );
        Self {
            container,
            ids,
            next_folder_id: AtomicI64::new(1),
            tree: RwLock::new(tree),
            folders: RwLock::new(folders),
            superseded: RwLock::new(Vec::new()),
            latest_tree_block_id: RwLock::new(None),
        }
    }

    fn write_json_block(&self, block_type: BlockType, block_id: i64, value: &impl Serialize) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        let header = BlockHeader {
            version: 1,
            block_type,
            flags: Flags { compression_id: CodecId::None.to_nibble(), encryption_id: EncryptionId::None.to_nibble(), tombstone: false },
            payload_encoding: PayloadEncoding::Json,
            timestamp: now(),
            block_id,
            payload_length: payload.len() as i64,
        };
        self.container.write(&header, &payload)?;
        Ok(())
    }

    /// Reconstruct a store from a reopened container: the newest
    /// `FolderTree` block (by block_id) wins, then every folder it names
    /// is loaded from its newest `Folder` block. A container with no
    /// persisted tree yet (a brand new file) falls back to the same
    /// single-root state [`FolderStore::new`] starts from.
    pub fn rebuild(container: Arc<BlockContainer>, ids: IdAllocator, known_block_ids: &[i64]) -> Result<Self> {
        let mut tree_block_ids: Vec<i64> = Vec::new();
        let mut folder_block_ids: Vec<i64> = Vec::new();
        for block_id in known_block_ids {
            let block = container.read(*block_id)?;
            match block.header.block_type {
                BlockType::FolderTree => tree_block_ids.push(*block_id),
                BlockType::Folder => folder_block_ids.push(*block_id),
                _ => {}
            }
        }

        let store = Self::new(container.clone(), ids);
        if let Some(&latest_tree_id) = tree_block_ids.iter().max() {
            let block = container.read(latest_tree_id)?;
            let snapshot: FolderTreeSnapshot = serde_json::from_slice(&block.payload)?;

            let mut newest_by_folder: HashMap<u64, Folder> = HashMap::new();
            for block_id in &folder_block_ids {
                let block = container.read(*block_id)?;
                let folder: Folder = serde_json::from_slice(&block.payload)?;
                newest_by_folder
                    .entry(folder.folder_id)
                    .and_modify(|existing| {
                        if folder.version > existing.version {
                            *existing = folder.clone();
                        }
                    })
                    .or_insert(folder);
            }

            let max_folder_id = newest_by_folder.keys().copied().max().unwrap_or(0);
            *store.tree.write() = snapshot;
            *store.folders.write() = newest_by_folder;
            *store.latest_tree_block_id.write() = Some(latest_tree_id);
            store.next_folder_id.store(max_folder_id as i64 + 1, Ordering::SeqCst);
        }
        Ok(store)
    }

    /// Every known folder path (excluding the unnamed root).
    pub fn all_paths(&self) -> Vec<String> {
        self.tree.read().path_to_folder_id.keys().filter(|p| !p.is_empty()).cloned().collect()
    }

    fn write_folder_tree(&self) -> Result<i64> {
        let block_id = self.ids.next();
        let snapshot = self.tree.read().clone();
        self.write_json_block(BlockType::FolderTree, block_id, &snapshot)?;
        if let Some(old) = self.latest_tree_block_id.write().replace(block_id) {
            self.superseded.write().push(old);
        }
        Ok(block_id)
    }

    fn write_folder(&self, folder: &Folder) -> Result<i64> {
        let block_id = self.ids.next();
        self.write_json_block(BlockType::Folder, block_id, folder)?;
        Ok(block_id)
    }

    fn write_envelope_block(&self, block: &FolderEnvelopeBlock) -> Result<i64> {
        let block_id = self.ids.next();
        self.write_json_block(BlockType::FolderEnvelope, block_id, block)?;
        Ok(block_id)
    }

    pub fn create(&self, path: &str) -> Result<u64> {
        validate_path(path)?;
        if self.tree.read().path_to_folder_id.contains_key(path) {
            return Err(Error::invalid(format!("folder already exists: {path}")));
        }
        let (parent_path, _) = path.rsplit_once(SEPARATOR).unwrap_or(("", path));
        let parent_id = *self
            .tree
            .read()
            .path_to_folder_id
            .get(parent_path)
            .ok_or_else(|| Error::not_found(format!("parent folder not found: {parent_path}")))?;

        let folder_id = self.next_folder_id.fetch_add(1, Ordering::SeqCst) as u64;
        let envelope_block = FolderEnvelopeBlock { folder_path: path.to_string(), version: 1, previous_block_id: None, envelopes: Vec::new() };
        let envelope_block_id = self.write_envelope_block(&envelope_block)?;

        let folder = Folder {
            folder_id,
            parent_folder_id: parent_id,
            path: path.to_string(),
            email_ids: Vec::new(),
            envelope_block_id,
            version: 1,
            last_modified: now(),
        };
        self.write_folder(&folder)?;

        {
            let mut tree = self.tree.write();
            tree.path_to_folder_id.insert(path.to_string(), folder_id);
            tree.folder_id_to_parent.insert(folder_id, parent_id);
        }
        self.folders.write().insert(folder_id, folder);
        self.write_folder_tree()?;
        Ok(folder_id)
    }

    pub fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let folder_id = self.resolve(path)?;
        let children: Vec<String> = {
            let tree = self.tree.read();
            tree.path_to_folder_id
                .keys()
                .filter(|p| p.starts_with(&format!("{path}{SEPARATOR}")))
                .cloned()
                .collect()
        };
        if !children.is_empty() && !recursive {
            return Err(Error::invalid("folder has subfolders, pass recursive=true"));
        }
        for child in children {
            self.remove_folder_entry(&child)?;
        }
        self.remove_folder_entry(path)?;
        let _ = folder_id;
        self.write_folder_tree()?;
        Ok(())
    }

    fn remove_folder_entry(&self, path: &str) -> Result<()> {
        let folder_id = self.resolve(path)?;
        let folder = self.folders.write().remove(&folder_id);
        if let Some(folder) = folder {
            self.superseded.write().push(folder.envelope_block_id);
        }
        self.tree.write().path_to_folder_id.remove(path);
        self.tree.write().folder_id_to_parent.remove(&folder_id);
        Ok(())
    }

    pub fn rename(&self, old_path: &str, new_name: &str) -> Result<()> {
        let (parent, _) = old_path.rsplit_once(SEPARATOR).unwrap_or(("", old_path));
        let new_path = if parent.is_empty() { new_name.to_string() } else { format!("{parent}{SEPARATOR}{new_name}") };
        self.move_folder(old_path, &new_path)
    }

    pub fn move_folder(&self, old_path: &str, new_path: &str) -> Result<()> {
        validate_path(new_path)?;
        let folder_id = self.resolve(old_path)?;
        let (new_parent_path, _) = new_path.rsplit_once(SEPARATOR).unwrap_or(("", new_path));
        let new_parent_id = self.resolve_or_root(new_parent_path)?;

        self.reject_cycle(folder_id, new_parent_id)?;

        let descendant_prefix = format!("{old_path}{SEPARATOR}");
        let descendants: Vec<(String, u64)> = {
            let tree = self.tree.read();
            tree.path_to_folder_id
                .iter()
                .filter(|(p, _)| p.starts_with(&descendant_prefix))
                .map(|(p, &id)| (p.clone(), id))
                .collect()
        };

        let mut folder = self.folders.read().get(&folder_id).cloned().ok_or_else(|| Error::not_found(old_path))?;
        folder.path = new_path.to_string();
        folder.parent_folder_id = new_parent_id;
        folder.version += 1;
        folder.last_modified = now();
        self.write_folder(&folder)?;

        {
            let mut tree = self.tree.write();
            tree.path_to_folder_id.remove(old_path);
            tree.path_to_folder_id.insert(new_path.to_string(), folder_id);
            tree.folder_id_to_parent.insert(folder_id, new_parent_id);
        }
        self.folders.write().insert(folder_id, folder);

        for (old_descendant_path, descendant_id) in descendants {
            let new_descendant_path = format!("{new_path}{SEPARATOR}{}", &old_descendant_path[descendant_prefix.len()..]);

            let mut descendant = self
                .folders
                .read()
                .get(&descendant_id)
                .cloned()
                .ok_or_else(|| Error::not_found(old_descendant_path.clone()))?;
            descendant.path = new_descendant_path.clone();
            descendant.version += 1;
            descendant.last_modified = now();
            self.write_folder(&descendant)?;

            {
                let mut tree = self.tree.write();
                tree.path_to_folder_id.remove(&old_descendant_path);
                tree.path_to_folder_id.insert(new_descendant_path, descendant_id);
            }
            self.folders.write().insert(descendant_id, descendant);
        }

        self.write_folder_tree()?;
        Ok(())
    }

    fn reject_cycle(&self, source_id: u64, target_parent_id: u64) -> Result<()> {
        let tree = self.tree.read();
        let mut cursor = target_parent_id;
        loop {
            if cursor == source_id {
                return Err(Error::invalid("move would create a folder cycle"));
            }
            if cursor == ROOT_FOLDER_ID {
                return Ok(());
            }
            cursor = *tree.folder_id_to_parent.get(&cursor).unwrap_or(&ROOT_FOLDER_ID);
        }
    }

    fn resolve(&self, path: &str) -> Result<u64> {
        self.tree.read().path_to_folder_id.get(path).copied().ok_or_else(|| Error::not_found(format!("folder not found: {path}")))
    }

    fn resolve_or_root(&self, path: &str) -> Result<u64> {
        if path.is_empty() {
            return Ok(ROOT_FOLDER_ID);
        }
        self.resolve(path)
    }

    pub fn add_email(&self, path: &str, envelope: EmailEnvelope) -> Result<()> {
        let folder_id = self.resolve(path)?;
        let mut folder = self.folders.read().get(&folder_id).cloned().ok_or_else(|| Error::not_found(path))?;

        let previous = self.container.read(folder.envelope_block_id).ok();
        let mut envelopes = previous
            .map(|b| serde_json::from_slice::<FolderEnvelopeBlock>(&b.payload).map(|e| e.envelopes).unwrap_or_default())
            .unwrap_or_default();
        envelopes.push(envelope.clone());

        let envelope_block = FolderEnvelopeBlock {
            folder_path: path.to_string(),
            version: folder.version + 1,
            previous_block_id: Some(folder.envelope_block_id),
            envelopes,
        };
        let new_envelope_block_id = self.write_envelope_block(&envelope_block)?;
        self.superseded.write().push(folder.envelope_block_id);

        folder.email_ids.push(envelope.compound_id);
        folder.envelope_block_id = new_envelope_block_id;
        folder.version += 1;
        folder.last_modified = now();
        self.write_folder(&folder)?;
        self.folders.write().insert(folder_id, folder);
        Ok(())
    }

    pub fn remove_email(&self, path: &str, compound_id: &str) -> Result<()> {
        let folder_id = self.resolve(path)?;
        let mut folder = self.folders.read().get(&folder_id).cloned().ok_or_else(|| Error::not_found(path))?;

        let previous = self.container.read(folder.envelope_block_id)?;
        let mut envelope_block: FolderEnvelopeBlock = serde_json::from_slice(&previous.payload)?;
        envelope_block.envelopes.retain(|e| e.compound_id != compound_id);
        envelope_block.version = folder.version + 1;
        envelope_block.previous_block_id = Some(folder.envelope_block_id);

        let new_envelope_block_id = self.write_envelope_block(&envelope_block)?;
        self.superseded.write().push(folder.envelope_block_id);

        folder.email_ids.retain(|id| id != compound_id);
        folder.envelope_block_id = new_envelope_block_id;
        folder.version += 1;
        folder.last_modified = now();
        self.write_folder(&folder)?;
        self.folders.write().insert(folder_id, folder);
        Ok(())
    }

    pub fn move_email(&self, compound_id: &str, from_path: &str, to_path: &str) -> Result<()> {
        let from_folder_id = self.resolve(from_path)?;
        let envelope = {
            let folder = self.folders.read().get(&from_folder_id).cloned().ok_or_else(|| Error::not_found(from_path))?;
            let block = self.container.read(folder.envelope_block_id)?;
            let envelope_block: FolderEnvelopeBlock = serde_json::from_slice(&block.payload)?;
            envelope_block
                .envelopes
                .into_iter()
                .find(|e| e.compound_id == compound_id)
                .ok_or_else(|| Error::not_found(compound_id))?
        };
        self.remove_email(from_path, compound_id)?;
        self.add_email(to_path, envelope)?;
        Ok(())
    }

    pub fn list_subfolders(&self, path: &str) -> Vec<String> {
        let prefix = if path.is_empty() { String::new() } else { format!("{path}{SEPARATOR}") };
        let tree = self.tree.read();
        tree.path_to_folder_id
            .keys()
            .filter(|p| p.starts_with(&prefix) && !p.is_empty() && p.as_str() != path && !p[prefix.len()..].contains(SEPARATOR))
            .cloned()
            .collect()
    }

    pub fn list_envelopes(&self, path: &str) -> Result<Vec<EmailEnvelope>> {
        let folder_id = self.resolve(path)?;
        let folder = self.folders.read().get(&folder_id).cloned().ok_or_else(|| Error::not_found(path))?;
        if folder.envelope_block_id == 0 {
            return Ok(Vec::new());
        }
        let block = self.container.read(folder.envelope_block_id)?;
        let envelope_block: FolderEnvelopeBlock = serde_json::from_slice(&block.payload)?;
        Ok(envelope_block.envelopes)
    }

    pub fn folder_version(&self, path: &str) -> Result<u64> {
        let folder_id = self.resolve(path)?;
        Ok(self.folders.read().get(&folder_id).map(|f| f.version).unwrap_or(0))
    }
}

fn now() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(compound_id: &str) -> EmailEnvelope {
        EmailEnvelope {
            subject: "hi".into(),
            from: "a@x".into(),
            to: "b@x".into(),
            date: 0,
            size: 10,
            has_attachments: false,
            envelope_hash: [1u8; 32],
            compound_id: compound_id.to_string(),
        }
    }

    #[test]
    fn path_validation_rejects_trailing_separator() {
        assert!(validate_path("A\\").is_err());
    }

    #[test]
    fn path_validation_rejects_doubled_separator() {
        assert!(validate_path("A\\\\B").is_err());
    }

    #[test]
    fn path_validation_rejects_forbidden_char() {
        assert!(validate_path("A:B").is_err());
    }

    #[test]
    fn create_and_list_subfolders() {
        let dir = tempfile::tempdir().unwrap();
        let container = Arc::new(BlockContainer::open(dir.path().join("a.mailarc")).unwrap());
        let store = FolderStore::new(container.clone(), IdAllocator::starting_at(1));
        store.create("A").unwrap();
        store.create("A\\B").unwrap();
        assert_eq!(store.list_subfolders(""), vec!["A".to_string()]);
        assert_eq!(store.list_subfolders("A"), vec!["A\\B".to_string()]);
    }

    #[test]
    fn folder_move_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let container = Arc::new(BlockContainer::open(dir.path().join("a.mailarc")).unwrap());
        let store = FolderStore::new(container.clone(), IdAllocator::starting_at(1));
        store.create("A").unwrap();
        store.create("A\\B").unwrap();
        store.create("A\\C").unwrap();
        store.add_email("A\\B", envelope("1:0")).unwrap();

        let version_before = store.folder_version("A\\B").unwrap();
        store.move_email("1:0", "A\\B", "A\\C").unwrap();

        assert!(store.list_envelopes("A\\B").unwrap().is_empty());
        let c_envelopes = store.list_envelopes("A\\C").unwrap();
        assert_eq!(c_envelopes.len(), 1);
        assert_eq!(c_envelopes[0].compound_id, "1:0");
        assert!(store.folder_version("A\\B").unwrap() > version_before);
    }

    #[test]
    fn moving_non_leaf_folder_repaths_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let container = Arc::new(BlockContainer::open(dir.path().join("a.mailarc")).unwrap());
        let store = FolderStore::new(container.clone(), IdAllocator::starting_at(1));
        store.create("A").unwrap();
        store.create("A\\B").unwrap();
        store.create("A\\B\\D").unwrap();
        store.add_email("A\\B", envelope("1:0")).unwrap();

        store.move_folder("A", "X").unwrap();

        assert!(store.list_subfolders("A").is_empty());
        assert_eq!(store.list_subfolders("X"), vec!["X\\B".to_string()]);
        assert_eq!(store.list_subfolders("X\\B"), vec!["X\\B\\D".to_string()]);
        let envelopes = store.list_envelopes("X\\B").unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].compound_id, "1:0");
    }

    #[test]
    fn move_rejects_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let container = Arc::new(BlockContainer::open(dir.path().join("a.mailarc")).unwrap());
        let store = FolderStore::new(container.clone(), IdAllocator::starting_at(1));
        store.create("A").unwrap();
        store.create("A\\B").unwrap();
        assert!(store.move_folder("A", "A\\B\\A").is_err());
    }

    #[test]
    fn delete_requires_recursive_for_nonempty() {
        let dir = tempfile::tempdir().unwrap();
        let container = Arc::new(BlockContainer::open(dir.path().join("a.mailarc")).unwrap());
        let store = FolderStore::new(container.clone(), IdAllocator::starting_at(1));
        store.create("A").unwrap();
        store.create("A\\B").unwrap();
        assert!(store.delete("A", false).is_err());
        store.delete("A", true).unwrap();
    }
}
