//! Maintenance Engine (C9): superseded-block identification, reference
//! validation, and safe compaction with backup/restore.
//!
//! Compaction takes the container's exclusive lock for its whole
//! duration — there is no incremental/background-safe variant, matching
//! spec.md §4.9's offline model.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::block::BlockType;
use crate::container::BlockContainer;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupersededReason {
    FolderMutation,
    KeyManagerRotation,
    Orphan,
}

#[derive(Debug, Clone)]
pub struct SupersededBlock {
    pub block_id: i64,
    pub superseded_at: i64,
    pub reason: SupersededReason,
}

/// Everything the maintenance engine needs to know about one scanned
/// block to run the orphan pass and reference validator.
#[derive(Debug, Clone)]
pub struct ScannedBlockInfo {
    pub block_id: i64,
    pub block_type: BlockType,
    pub envelope_block_id: Option<i64>,
    pub previous_block_id: Option<i64>,
    pub referenced_batch_ids: Vec<i64>,
}

/// Builds the superseded set: the union of explicit per-mutation
/// supersession lists (from C7/C3) and an orphan pass over a full scan.
pub fn build_superseded_set(
    explicit: impl IntoIterator<Item = (i64, SupersededReason)>,
    scanned: &[ScannedBlockInfo],
    key_manager_versions_to_keep: usize,
) -> Vec<SupersededBlock> {
    let now = Utc::now().timestamp();
    let mut out: Vec<SupersededBlock> =
        explicit.into_iter().map(|(block_id, reason)| SupersededBlock { block_id, superseded_at: now, reason }).collect();

    let mut live: HashSet<i64> = HashSet::new();
    for block in scanned {
        if let Some(id) = block.envelope_block_id {
            live.insert(id);
        }
        if let Some(id) = block.previous_block_id {
            live.insert(id);
        }
        live.extend(block.referenced_batch_ids.iter().copied());
    }

    let mut key_manager_blocks: Vec<i64> =
        scanned.iter().filter(|b| b.block_type == BlockType::KeyManager).map(|b| b.block_id).collect();
    key_manager_blocks.sort_unstable();
    let stale_key_manager: HashSet<i64> =
        key_manager_blocks.iter().rev().skip(key_manager_versions_to_keep).copied().collect();

    for block in scanned {
        let always_live = matches!(block.block_type, BlockType::Metadata | BlockType::EmailBatch);
        if always_live {
            continue;
        }
        let orphaned = match block.block_type {
            BlockType::Folder | BlockType::FolderEnvelope => !live.contains(&block.block_id),
            BlockType::KeyManager => stale_key_manager.contains(&block.block_id),
            _ => false,
        };
        if orphaned {
            out.push(SupersededBlock { block_id: block.block_id, superseded_at: now, reason: SupersededReason::Orphan });
        }
    }

    out
}

/// The three reference checks a block must pass before it can be deleted.
pub struct ReferenceValidator<'a> {
    pub index_referenced: &'a dyn Fn(i64) -> bool,
    pub live_folder_envelope_ids: &'a HashSet<i64>,
    pub live_envelope_previous_ids: &'a HashSet<i64>,
}

impl ReferenceValidator<'_> {
    pub fn is_eligible(&self, block_id: i64) -> bool {
        !(self.index_referenced)(block_id)
            && !self.live_folder_envelope_ids.contains(&block_id)
            && !self.live_envelope_previous_ids.contains(&block_id)
    }
}

/// A block is only actually deletable once this margin has elapsed since
/// it was superseded.
pub fn past_safety_margin(superseded: &SupersededBlock, now: i64, min_age_hours: u32) -> bool {
    now - superseded.superseded_at >= min_age_hours as i64 * 3600
}

/// C9's offline compaction procedure. `keep` is every block_id that
/// survives; `rewrite` is invoked with a writer over the new file and
/// must stream every kept block (preserving block_ids, reassigning
/// offsets) in ascending original-offset order.
pub fn compact<F>(path: &Path, backups_to_keep: usize, rewrite: F) -> Result<PathBuf>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let backup_path = timestamped_backup_path(path);
    fs::copy(path, &backup_path).map_err(Error::Io)?;

    let tmp_path = path.with_extension("mailarc.compacting");
    let result = rewrite(&tmp_path);

    match result {
        Ok(()) => {
            fs::rename(&tmp_path, path).map_err(Error::Io)?;
            prune_old_backups(path, backups_to_keep)?;
            Ok(backup_path)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            fs::copy(&backup_path, path).map_err(Error::Io)?;
            Err(e)
        }
    }
}

fn timestamped_backup_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".backup_{stamp}"));
    PathBuf::from(name)
}

fn prune_old_backups(path: &Path, backups_to_keep: usize) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let stem = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
    let mut backups: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(Error::Io)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&format!("{stem}.backup_")))
                .unwrap_or(false)
        })
        .collect();
    backups.sort();
    if backups.len() > backups_to_keep {
        for old in &backups[..backups.len() - backups_to_keep] {
            let _ = fs::remove_file(old);
        }
    }
    Ok(())
}

/// Sanity-checks that every kept id is still readable post-compaction and
/// that the delete set is absent, per invariant 6.
pub fn verify_compaction(container: &BlockContainer, keep_ids: &[i64], deleted_ids: &[i64]) -> Result<()> {
    for id in keep_ids {
        container.read(*id)?;
    }
    for id in deleted_ids {
        if container.read(*id).is_ok() {
            return Err(Error::corrupt(*id, "block survived compaction despite being in the delete set"));
        }
    }
    Ok(())
}
