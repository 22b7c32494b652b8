//! Exclusive ownership of a wallet data directory.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{StorageError, StorageResult};

const LOCK_FILE_NAME: &str = ".lock";

/// Advisory lock held for the lifetime of a disk store.
///
/// The file records the owning process id and the time the lock was taken.
#[derive(Debug)]
pub(super) struct DataDirLock {
    path: PathBuf,
    _file: File,
}

impl DataDirLock {
    pub(super) fn acquire(data_dir: &Path) -> StorageResult<Self> {
        let path = data_dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::WriteFailed(format!("cannot open {}: {e}", path.display())))?;

        file.try_lock().map_err(|e| match e {
            TryLockError::WouldBlock => StorageError::DirectoryLocked(format!(
                "wallet data directory '{}' is already in use by another process",
                data_dir.display()
            )),
            TryLockError::Error(io_err) => {
                StorageError::WriteFailed(format!("cannot lock {}: {io_err}", path.display()))
            }
        })?;

        let stamp = chrono::Utc::now().to_rfc3339();
        let written = file.set_len(0).and_then(|_| writeln!(file, "{} {stamp}", std::process::id()));
        if let Err(e) = written {
            tracing::warn!("Could not record owner in {}: {}", path.display(), e);
        }

        Ok(Self {
            path,
            _file: file,
        })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}
