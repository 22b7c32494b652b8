//! Transactional wallet ledger.
//!
//! The ledger holds three namespaces (transactions, addresses, stake) that
//! are read and written together. A read sees one committed snapshot; an
//! update runs against a private copy and becomes visible only when the
//! closure succeeds and the copy has been persisted. A failed update leaves
//! the committed state untouched.

pub mod address_index;
mod disk;
mod lockfile;
pub mod stake_index;
pub mod tx_index;

use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{StorageError, StorageResult};

pub use address_index::{AccountUsage, AddressIndex, IMPORTED_ACCOUNT, ManagedAddress};
pub use disk::DiskPersistence;
pub use stake_index::{RevocationRecord, StakeIndex, StakePoolUser, TicketRecord, VoteRecord};
pub use tx_index::{Balances, Credit, MultisigOut, TxIndex, UnspentOutput, output_tree};

/// Everything the wallet stores, across all namespaces.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LedgerState {
    pub tx: TxIndex,
    pub addr: AddressIndex,
    pub stake: StakeIndex,
}

/// Durable backing for committed ledger states.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Makes `state` durable. The store publishes it only after this returns Ok.
    async fn persist(&self, state: &LedgerState) -> StorageResult<()>;
}

/// Persistence for a ledger that lives only in memory.
#[derive(Debug, Default)]
pub struct InMemory;

#[async_trait]
impl Persistence for InMemory {
    async fn persist(&self, _state: &LedgerState) -> StorageResult<()> {
        Ok(())
    }
}

/// The wallet ledger with view/update transactions.
pub struct LedgerStore {
    committed: RwLock<Arc<LedgerState>>,
    writer: Mutex<()>,
    persistence: Box<dyn Persistence>,
}

impl LedgerStore {
    pub fn new(state: LedgerState, persistence: Box<dyn Persistence>) -> Self {
        Self {
            committed: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
            persistence,
        }
    }

    /// An empty ledger kept in memory.
    pub fn in_memory() -> Self {
        Self::new(LedgerState::default(), Box::new(InMemory))
    }

    /// Opens (or creates) the ledger stored under `data_dir`.
    ///
    /// The directory stays locked against other processes until the store
    /// is dropped.
    pub async fn open(data_dir: &Path) -> StorageResult<Self> {
        let (persistence, state) = DiskPersistence::open(data_dir).await?;
        Ok(Self::new(state, Box::new(persistence)))
    }

    /// Current committed snapshot.
    pub fn snapshot(&self) -> StorageResult<Arc<LedgerState>> {
        self.committed
            .read()
            .map(|state| Arc::clone(&state))
            .map_err(|e| StorageError::LockPoisoned(e.to_string()))
    }

    /// Runs a read-only transaction against the committed snapshot.
    pub fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&LedgerState) -> Result<T, E>,
        E: From<StorageError>,
    {
        let snapshot = self.snapshot()?;
        f(&snapshot)
    }

    /// Runs a read-write transaction.
    ///
    /// Updates are serialized. The closure's changes are committed only when
    /// it returns Ok and persistence succeeds.
    pub async fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut LedgerState) -> Result<T, E> + Send,
        T: Send,
        E: From<StorageError> + Send,
    {
        let _writer = self.writer.lock().await;

        let mut working = LedgerState::clone(&*self.snapshot()?);
        let value = f(&mut working)?;

        self.persistence.persist(&working).await?;

        let mut committed =
            self.committed.write().map_err(|e| StorageError::LockPoisoned(e.to_string()))?;
        *committed = Arc::new(working);
        Ok(value)
    }
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ChainBuilder, FlakyPersistence};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_update_commits_on_success() {
        let store = LedgerStore::in_memory();
        let block = ChainBuilder::new().next_block();

        let meta = store
            .update(|state| state.tx.extend_main_chain(&block))
            .await
            .unwrap();
        assert_eq!(meta.hash, block.block_hash);

        let tip = store
            .view(|state| Ok::<_, StorageError>(state.tx.main_chain_tip()))
            .unwrap();
        assert_eq!(tip.map(|t| t.hash), Some(block.block_hash));
    }

    #[tokio::test]
    async fn test_closure_error_discards_changes() {
        let store = LedgerStore::in_memory();
        let mut chain = ChainBuilder::new();
        let b1 = chain.next_block();

        let result: StorageResult<()> = store
            .update(|state| {
                state.tx.extend_main_chain(&b1)?;
                Err(StorageError::InvalidTransition("abort".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(store.snapshot().unwrap().tx.main_chain_tip().is_none());
    }

    #[tokio::test]
    async fn test_persistence_failure_discards_changes() {
        let persistence = FlakyPersistence::default();
        let fail = persistence.fail_next.clone();
        let store = LedgerStore::new(LedgerState::default(), Box::new(persistence));
        let block = ChainBuilder::new().next_block();

        fail.store(true, Ordering::SeqCst);
        assert!(store.update(|state| state.tx.extend_main_chain(&block)).await.is_err());
        assert!(store.snapshot().unwrap().tx.main_chain_tip().is_none());

        store.update(|state| state.tx.extend_main_chain(&block)).await.unwrap();
        assert_eq!(store.snapshot().unwrap().tx.tip_height(), block.height());
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_across_updates() {
        let store = LedgerStore::in_memory();
        let mut chain = ChainBuilder::new();
        let b1 = chain.next_block();
        let b2 = chain.next_block();
        store.update(|state| state.tx.extend_main_chain(&b1)).await.unwrap();

        let before = store.snapshot().unwrap();
        store.update(|state| state.tx.extend_main_chain(&b2)).await.unwrap();

        assert_eq!(before.tx.main_chain_tip().unwrap().hash, b1.block_hash);
        assert_eq!(store.snapshot().unwrap().tx.main_chain_tip().unwrap().hash, b2.block_hash);
    }
}
