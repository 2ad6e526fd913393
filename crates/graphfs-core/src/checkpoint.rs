//! Durable recovery checkpoint.
//!
//! The checkpoint is one 64-bit value: the rid of the last journal record
//! known to be applied. It is stored as 8 big-endian bytes. A missing file
//! means the graph was never checkpointed.
//!
//! Updates use the atomic rename pattern:
//! 1. Write the value to `<file>.tmp`
//! 2. durable_sync the temp file
//! 3. Rename it over the checkpoint file
//! 4. Sync the directory
//!
//! A crash before the rename leaves the old value intact.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{GraphError, GraphResult};
use crate::platform_durability::{durable_sync, sync_dir};

pub trait Checkpoint: Send + Sync {
    /// Stored value, or None if never set.
    fn get(&self) -> GraphResult<Option<u64>>;

    /// Store `value`. With `only_if_greater`, a value not strictly greater
    /// than the stored one is silently ignored.
    fn update(&self, value: u64, only_if_greater: bool) -> GraphResult<()>;

    fn close(&self) -> GraphResult<()>;
}

fn should_store(current: Option<u64>, value: u64, only_if_greater: bool) -> bool {
    !only_if_greater || current.map_or(true, |c| value > c)
}

/// Checkpoint persisted in a single file.
pub struct FileCheckpoint {
    path: PathBuf,
    /// Cached copy of the file; the lock also serializes writers.
    value: Mutex<Option<u64>>,
    closed: AtomicBool,
}

impl FileCheckpoint {
    pub fn open<P: AsRef<Path>>(path: P) -> GraphResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| GraphError::io_at(parent, e, "failed to create checkpoint directory"))?;
        }
        let value = read_value(&path)?;
        Ok(Self {
            path,
            value: Mutex::new(value),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> GraphResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphError::Closed("checkpoint"));
        }
        Ok(())
    }
}

fn read_value(path: &Path) -> GraphResult<Option<u64>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(GraphError::io_at(path, e, "failed to open checkpoint")),
    };
    let mut bytes = Vec::with_capacity(8);
    file.read_to_end(&mut bytes)
        .map_err(|e| GraphError::io_at(path, e, "failed to read checkpoint"))?;

    match bytes.len() {
        0 => Ok(None),
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes);
            Ok(Some(u64::from_be_bytes(buf)))
        }
        n => Err(GraphError::WalCorrupted {
            path: path.to_path_buf(),
            offset: 0,
            reason: format!("checkpoint is {} bytes, expected 8", n),
        }),
    }
}

fn write_value(path: &Path, value: u64) -> GraphResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| GraphError::io_at(&tmp, e, "failed to create checkpoint temp file"))?;
        file.write_all(&value.to_be_bytes())
            .map_err(|e| GraphError::io_at(&tmp, e, "failed to write checkpoint"))?;
        durable_sync(&file).map_err(|e| GraphError::io_at(&tmp, e, "failed to sync checkpoint"))?;
    }
    fs::rename(&tmp, path).map_err(|e| GraphError::io_at(path, e, "failed to install checkpoint"))?;
    if let Some(parent) = path.parent() {
        sync_dir(parent).map_err(|e| GraphError::io_at(parent, e, "failed to sync checkpoint directory"))?;
    }
    Ok(())
}

impl Checkpoint for FileCheckpoint {
    fn get(&self) -> GraphResult<Option<u64>> {
        self.check_open()?;
        Ok(*self.value.lock())
    }

    fn update(&self, value: u64, only_if_greater: bool) -> GraphResult<()> {
        self.check_open()?;
        let mut current = self.value.lock();
        if !should_store(*current, value, only_if_greater) {
            return Ok(());
        }
        write_value(&self.path, value)?;
        *current = Some(value);
        trace!(checkpoint = value, "checkpoint advanced");
        Ok(())
    }

    fn close(&self) -> GraphResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Checkpoint for transient graphs.
#[derive(Default)]
pub struct MemoryCheckpoint {
    value: Mutex<Option<u64>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Checkpoint for MemoryCheckpoint {
    fn get(&self) -> GraphResult<Option<u64>> {
        Ok(*self.value.lock())
    }

    fn update(&self, value: u64, only_if_greater: bool) -> GraphResult<()> {
        let mut current = self.value.lock();
        if should_store(*current, value, only_if_greater) {
            *current = Some(value);
        }
        Ok(())
    }

    fn close(&self) -> GraphResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_absent_until_first_update() {
        let dir = TempDir::new().unwrap();
        let cp = FileCheckpoint::open(dir.path().join("checkpoint")).unwrap();
        assert_eq!(cp.get().unwrap(), None);
        cp.update(0, true).unwrap();
        assert_eq!(cp.get().unwrap(), Some(0));
    }

    #[test]
    fn test_only_if_greater() {
        let dir = TempDir::new().unwrap();
        let cp = FileCheckpoint::open(dir.path().join("checkpoint")).unwrap();
        cp.update(10, true).unwrap();
        cp.update(5, true).unwrap();
        cp.update(10, true).unwrap();
        assert_eq!(cp.get().unwrap(), Some(10));

        cp.update(3, false).unwrap();
        assert_eq!(cp.get().unwrap(), Some(3));
    }

    #[test]
    fn test_value_is_big_endian_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint");
        {
            let cp = FileCheckpoint::open(&path).unwrap();
            cp.update(0x0102, false).unwrap();
        }
        assert_eq!(fs::read(&path).unwrap(), vec![0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(FileCheckpoint::open(&path).unwrap().get().unwrap(), Some(0x0102));
    }

    #[test]
    fn test_garbage_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint");
        fs::write(&path, b"abc").unwrap();
        assert!(matches!(FileCheckpoint::open(&path), Err(GraphError::WalCorrupted { .. })));
    }

    #[test]
    fn test_memory_checkpoint() {
        let cp = MemoryCheckpoint::new();
        assert_eq!(cp.get().unwrap(), None);
        cp.update(4, true).unwrap();
        cp.update(2, true).unwrap();
        assert_eq!(cp.get().unwrap(), Some(4));
    }

    #[test]
    fn test_closed_checkpoint() {
        let dir = TempDir::new().unwrap();
        let cp = FileCheckpoint::open(dir.path().join("checkpoint")).unwrap();
        cp.close().unwrap();
        assert!(matches!(cp.get(), Err(GraphError::Closed(_))));
    }
}
