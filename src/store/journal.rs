use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::WriteBatch;
use crate::error::{StoreError, StoreResult};

/// Write-ahead log for committed batches
///
/// # WAL (Write-Ahead Log) Pattern
///
/// 1. **Write First**: the store appends the batch here before applying it
/// 2. **Apply**: only then does the batch become visible to readers
/// 3. **Recovery**: on restart, [`Journal::replay`] returns every batch in
///    commit order and the store re-applies them
///
/// A batch that fails to append is never applied, so a journal error leaves
/// the store exactly as it was.
pub trait Journal: Send + Sync {
    fn append(&self, batch: &WriteBatch) -> StoreResult<()>;

    fn replay(&self) -> StoreResult<Vec<WriteBatch>>;
}

/// Journal kept in process memory
///
/// Survives nothing, but lets tests rebuild a store from its history and
/// count commits.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    batches: Mutex<Vec<WriteBatch>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches appended so far
    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Journal for MemoryJournal {
    fn append(&self, batch: &WriteBatch) -> StoreResult<()> {
        self.batches.lock().push(batch.clone());
        Ok(())
    }

    fn replay(&self) -> StoreResult<Vec<WriteBatch>> {
        Ok(self.batches.lock().clone())
    }
}

/// Append-only JSON-lines file, one batch per line, synced on every append
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    /// Open (or create) the journal at `path` for appending
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for FileJournal {
    fn append(&self, batch: &WriteBatch) -> StoreResult<()> {
        let line = serde_json::to_string(batch)?;
        let mut file = self.file.lock();
        writeln!(file, "{line}")?;
        file.sync_data()?;
        Ok(())
    }

    fn replay(&self) -> StoreResult<Vec<WriteBatch>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut batches = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let batch = serde_json::from_str(&line).map_err(|e| StoreError::Corrupt {
                line: index + 1,
                reason: e.to_string(),
            })?;
            batches.push(batch);
        }
        Ok(batches)
    }
}
