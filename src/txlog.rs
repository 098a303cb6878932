//! Transaction log (`<path>.txlog`): an append-only JSON-lines audit trail
//! of every mutating operation, independent of the block container itself.
//! Never read back by the engine — it exists for external auditing and
//! post-incident reconstruction, not for recovery (the container's own
//! scan/hash-chain covers that).

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct TxLogEntry {
    pub timestamp: i64,
    pub operation: String,
    pub details: Value,
    pub metadata: Value,
}

pub struct TxLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl TxLog {
    /// Derives `<path>.txlog` from the container's own path.
    pub fn for_archive(archive_path: &Path) -> Self {
        let mut path = archive_path.as_os_str().to_os_string();
        path.push(".txlog");
        Self { path: PathBuf::from(path), writer: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, operation: &str, details: Value, metadata: Value) -> Result<()> {
        let entry = TxLogEntry { timestamp: now(), operation: operation.to_string(), details, metadata };
        let line = serde_json::to_string(&entry)?;
        let _guard = self.writer.lock();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).map_err(Error::Io)?;
        writeln!(file, "{line}").map_err(Error::Io)?;
        Ok(())
    }
}

fn now() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn appends_one_json_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("archive.mailarc");
        let log = TxLog::for_archive(&archive_path);
        log.append("write_email", json!({"compound_id": "1:0"}), json!({})).unwrap();
        log.append("move_email", json!({"compound_id": "1:0", "to": "A\\B"}), json!({})).unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["operation"], "write_email");
    }

    #[test]
    fn log_path_is_derived_from_archive_path() {
        let log = TxLog::for_archive(Path::new("/tmp/foo.mailarc"));
        assert_eq!(log.path(), Path::new("/tmp/foo.mailarc.txlog"));
    }
}
