//! The wallet: ledger store, chain synchronization engines and the
//! collaborators they call out to.
//!
//! Every mutation runs inside [`Wallet::update`]. Effects that must not be
//! observed before the ledger commits (subscriber notifications, token
//! bridge hooks, filter loads on the node) are queued in the transaction's
//! [`Outbox`] and published only once the update has committed.

mod chain;
pub mod classifier;
mod recorder;
mod rescan;
pub mod stakepool;
pub mod txsizes;
mod voting;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock};

use hc_wire::{Address, BlockHash, ChainParams, OutPoint, Transaction, TxHash};

use crate::bridge::TokenBridge;
use crate::config::WalletConfig;
use crate::error::{Result, StorageResult, VotingError, WalletSyncError};
use crate::notifications::{EventReceiver, NotificationServer};
use crate::rpc::ChainClient;
use crate::storage::{Balances, LedgerState, LedgerStore, StakePoolUser, UnspentOutput};
use crate::types::{ChainTip, MainTipChanged, TxNotification};

pub use classifier::{Classification, WatchedSet, classify};
pub use stakepool::stake_pool_ticket_fee;
pub use voting::TransactionSigner;

use chain::ReorgState;
use rescan::ScanState;

/// Token bridge call deferred until the ledger commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BridgeHook {
    BlockConnected {
        height: u32,
        hash: BlockHash,
        time: i64,
    },
    Rollback {
        height: u32,
    },
}

/// Effects queued by one update, published in order after it commits.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub(crate) transactions: Vec<TxNotification>,
    /// Addresses to add to the node's transaction filter.
    pub(crate) filter_addresses: Vec<Address>,
    pub(crate) bridge_hooks: Vec<BridgeHook>,
}

/// A read-write wallet transaction: the working copy of the ledger and the
/// effects to publish if it commits.
pub struct WalletTxn<'a> {
    pub(crate) state: &'a mut LedgerState,
    pub(crate) outbox: Outbox,
}

impl WalletTxn<'_> {
    pub fn state(&self) -> &LedgerState {
        self.state
    }
}

pub struct Wallet {
    store: LedgerStore,
    config: WalletConfig,
    params: &'static ChainParams,
    /// Cold-wallet fee addresses accepted in stake-pool ticket commitments.
    cold_addresses: HashSet<Address>,

    reorg: Mutex<ReorgState>,
    scan: Mutex<ScanState>,
    notifications: NotificationServer,

    bridge: Option<Arc<dyn TokenBridge>>,
    chain_client: RwLock<Option<Arc<dyn ChainClient>>>,
    signer: Option<Arc<dyn TransactionSigner>>,

    /// Instant transactions re-broadcast on request, kept until mined.
    instant_txs: Mutex<HashMap<TxHash, Transaction>>,
    classification_warnings: AtomicU64,
}

impl Wallet {
    pub fn new(config: WalletConfig, store: LedgerStore) -> Result<Self> {
        config.validate().map_err(WalletSyncError::Config)?;

        Ok(Self {
            store,
            params: config.network.params(),
            cold_addresses: config.pool_addresses.iter().copied().collect(),
            reorg: Mutex::new(ReorgState::default()),
            scan: Mutex::new(ScanState::default()),
            notifications: NotificationServer::new(&config),
            bridge: None,
            chain_client: RwLock::new(None),
            signer: None,
            instant_txs: Mutex::new(HashMap::new()),
            classification_warnings: AtomicU64::new(0),
            config,
        })
    }

    pub fn with_bridge(mut self, bridge: Arc<dyn TokenBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn TransactionSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn params(&self) -> &'static ChainParams {
        self.params
    }

    /// The ledger store, for read access in tests and tooling.
    pub fn ledger(&self) -> &LedgerStore {
        &self.store
    }

    /// Runs a read-write wallet transaction.
    ///
    /// The closure's ledger changes commit only when it returns Ok and the
    /// store persists them; its queued effects are published afterwards.
    pub(crate) async fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WalletTxn<'_>) -> Result<T> + Send,
        T: Send,
    {
        let (value, outbox) = self
            .store
            .update(|state| {
                let mut txn = WalletTxn {
                    state,
                    outbox: Outbox::default(),
                };
                let value = f(&mut txn)?;
                Ok::<_, WalletSyncError>((value, txn.outbox))
            })
            .await?;
        self.publish(outbox).await;
        Ok(value)
    }

    async fn publish(&self, outbox: Outbox) {
        if let Some(bridge) = &self.bridge {
            for hook in &outbox.bridge_hooks {
                let result = match hook {
                    BridgeHook::BlockConnected {
                        height,
                        hash,
                        time,
                    } => bridge.on_block_connected(*height, hash, *time).await,
                    BridgeHook::Rollback {
                        height,
                    } => bridge.rollback(*height).await,
                };
                if let Err(e) = result {
                    tracing::warn!("Token bridge hook {:?} failed: {}", hook, e);
                }
            }
        }

        if !outbox.filter_addresses.is_empty() {
            if let Some(client) = self.chain_client().await {
                if let Err(e) = client.load_tx_filter(false, &outbox.filter_addresses, &[]).await {
                    tracing::warn!(
                        "Failed to add {} addresses to the node's transaction filter: {}",
                        outbox.filter_addresses.len(),
                        e
                    );
                }
            }
        }

        if !outbox.transactions.is_empty() {
            self.notifications.notify_transactions(&outbox.transactions);
        }
    }

    // Chain client association

    /// Associates the node client and loads the full watched set into its
    /// transaction filter.
    pub async fn associate_chain_client(&self, client: Arc<dyn ChainClient>) -> Result<()> {
        let snapshot = self.store.snapshot()?;
        let addresses = snapshot.addr.watched_addresses();
        let outpoints: Vec<OutPoint> =
            snapshot.tx.unspent_outputs().iter().map(|utxo| utxo.credit.outpoint).collect();
        client.load_tx_filter(true, &addresses, &outpoints).await?;
        tracing::info!(
            "Loaded transaction filter with {} addresses and {} outpoints",
            addresses.len(),
            outpoints.len()
        );

        *self.chain_client.write().await = Some(client);
        Ok(())
    }

    pub async fn disassociate_chain_client(&self) {
        *self.chain_client.write().await = None;
    }

    pub async fn chain_client(&self) -> Option<Arc<dyn ChainClient>> {
        self.chain_client.read().await.clone()
    }

    pub(crate) async fn require_chain_client(&self) -> std::result::Result<Arc<dyn ChainClient>, VotingError> {
        self.chain_client().await.ok_or(VotingError::NoChainClient)
    }

    // Watched set

    /// Registers a derived address and adds it to the node's filter.
    pub async fn import_address(&self, address: Address, account: u32, internal: bool, index: u32) -> Result<()> {
        self.update(|txn| {
            txn.state.addr.insert_address(address, account, internal, index)?;
            txn.outbox.filter_addresses.push(address);
            Ok(())
        })
        .await
    }

    /// Imports a redeem script and watches its script-hash address.
    pub async fn import_script(&self, redeem_script: &[u8]) -> Result<Address> {
        let network = self.config.network;
        self.update(|txn| {
            let address = txn.state.addr.import_script(redeem_script, network)?;
            txn.outbox.filter_addresses.push(address);
            Ok(address)
        })
        .await
    }

    // Queries

    pub fn main_chain_tip(&self) -> Result<Option<ChainTip>> {
        Ok(self.store.snapshot()?.tx.main_chain_tip())
    }

    pub fn balances(&self, min_conf: u32) -> Result<Balances> {
        let snapshot = self.store.snapshot()?;
        Ok(snapshot.tx.balances(min_conf, u32::from(self.params.coinbase_maturity)))
    }

    pub fn unspent_outputs(&self) -> Result<Vec<UnspentOutput>> {
        Ok(self.store.snapshot()?.tx.unspent_outputs())
    }

    /// First main chain block whose transactions are not yet processed.
    pub fn rescan_point(&self) -> Result<Option<BlockHash>> {
        Ok(self.store.snapshot()?.tx.rescan_point())
    }

    pub fn stake_pool_user_info(&self, user: &Address) -> Result<StakePoolUser> {
        let user: StorageResult<StakePoolUser> =
            self.store.view(|state| state.stake.pool_user_info(user).cloned());
        Ok(user?)
    }

    /// Malformed scripts skipped while classifying transactions.
    pub fn classification_warnings(&self) -> u64 {
        self.classification_warnings.load(Ordering::Relaxed)
    }

    pub(crate) fn note_classification_warnings(&self, tx: &TxHash, warnings: u32) {
        if warnings == 0 {
            return;
        }
        self.classification_warnings.fetch_add(u64::from(warnings), Ordering::Relaxed);
        tracing::warn!("Skipped {} undecodable scripts while classifying transaction {}", warnings, tx);
    }

    // Subscriptions

    pub fn subscribe_tip_changes(&self) -> EventReceiver<MainTipChanged> {
        self.notifications.subscribe_tip_changes()
    }

    pub fn subscribe_transactions(&self) -> EventReceiver<TxNotification> {
        self.notifications.subscribe_transactions()
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("network", &self.config.network)
            .field("stake_pool", &self.config.stake_pool_enabled)
            .field("bridge", &self.bridge.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::test_utils::{MockChainClient, RecordingBridge, pay_to};
    use hc_wire::Network;

    fn addr(fill: u8) -> Address {
        Address::p2pkh([fill; 20], Network::Simnet)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = WalletConfig::simnet().with_rescan_batch_size(0);
        assert!(matches!(
            Wallet::new(config, LedgerStore::in_memory()),
            Err(WalletSyncError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_aborted_update_publishes_nothing() {
        let wallet = Wallet::new(WalletConfig::simnet(), LedgerStore::in_memory())
            .unwrap()
            .with_bridge(Arc::new(RecordingBridge::new()));
        let mut rx = wallet.subscribe_transactions();

        let result: Result<()> = wallet
            .update(|txn| {
                txn.outbox.transactions.push(TxNotification::Unmined {
                    hash: TxHash::hash(b"t"),
                    tx_type: hc_wire::StakeTxType::Regular,
                });
                Err(StorageError::InvalidTransition("abort".into()).into())
            })
            .await;
        assert!(result.is_err());
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_imported_address_reaches_filter() {
        let wallet = Wallet::new(WalletConfig::simnet(), LedgerStore::in_memory()).unwrap();
        let client = Arc::new(MockChainClient::new());
        wallet.associate_chain_client(client.clone()).await.unwrap();

        wallet.import_address(addr(1), 0, false, 0).await.unwrap();
        assert!(wallet.import_address(addr(1), 0, false, 0).await.unwrap_err().is_duplicate());

        let loads = client.filter_loads();
        assert_eq!(loads.len(), 2);
        assert!(loads[0].0);
        assert_eq!(loads[1], (false, vec![addr(1)], Vec::new()));
    }

    #[tokio::test]
    async fn test_unmined_credit_counts_as_unconfirmed() {
        let wallet = Wallet::new(WalletConfig::simnet(), LedgerStore::in_memory()).unwrap();
        wallet.import_address(addr(2), 0, false, 0).await.unwrap();

        let tx = pay_to(&addr(2), 5_000);
        wallet
            .update(|txn| wallet.process_serialized_transaction(txn, &tx.to_bytes(), None))
            .await
            .unwrap();

        let balances = wallet.balances(1).unwrap();
        assert_eq!(balances.total, 5_000);
        assert_eq!(balances.unconfirmed, 5_000);
        assert_eq!(wallet.unspent_outputs().unwrap().len(), 1);
    }
}
