//! File-backed persistence: the whole ledger in one bincode file, replaced
//! atomically on every commit.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::lockfile::DataDirLock;
use super::{LedgerState, Persistence};
use crate::error::{StorageError, StorageResult};

const LEDGER_FILE: &str = "ledger.bin";
const LEDGER_TMP_FILE: &str = "ledger.bin.tmp";

#[derive(Debug)]
pub struct DiskPersistence {
    dir: PathBuf,
    _lock: DataDirLock,
}

impl DiskPersistence {
    /// Locks `data_dir` and loads the ledger stored there, if any.
    pub async fn open(data_dir: &Path) -> StorageResult<(Self, LedgerState)> {
        fs::create_dir_all(data_dir).map_err(|e| {
            StorageError::WriteFailed(format!("Failed to create {}: {}", data_dir.display(), e))
        })?;
        let lock = DataDirLock::acquire(data_dir)?;

        let path = data_dir.join(LEDGER_FILE);
        let state = if path.exists() {
            load_ledger(path).await?
        } else {
            tracing::info!("Creating new wallet ledger in {}", data_dir.display());
            LedgerState::default()
        };

        Ok((
            Self {
                dir: data_dir.to_path_buf(),
                _lock: lock,
            },
            state,
        ))
    }
}

async fn load_ledger(path: PathBuf) -> StorageResult<LedgerState> {
    tokio::task::spawn_blocking(move || {
        let content = fs::read(&path)?;
        let (state, _) = bincode::serde::decode_from_slice::<LedgerState, _>(
            &content,
            bincode::config::standard(),
        )
        .map_err(|e| StorageError::ReadFailed(format!("Failed to decode ledger: {}", e)))?;
        Ok(state)
    })
    .await
    .map_err(|e| StorageError::ReadFailed(format!("Task join error: {}", e)))?
}

#[async_trait]
impl Persistence for DiskPersistence {
    async fn persist(&self, state: &LedgerState) -> StorageResult<()> {
        let data = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(format!("Failed to encode ledger: {}", e)))?;

        let tmp = self.dir.join(LEDGER_TMP_FILE);
        let target = self.dir.join(LEDGER_FILE);
        tokio::task::spawn_blocking(move || {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&tmp, &target)?;
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|e| StorageError::WriteFailed(format!("Task join error: {}", e)))?
        .map_err(|e| StorageError::WriteFailed(format!("Failed to write ledger: {}", e)))
    }
}
