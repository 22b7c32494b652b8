//! Historical rescan of the stored main chain.
//!
//! Blocks are sent to the node in batches; every transaction it matches
//! against the loaded filter is recorded in one ledger update per batch.
//! Starting a rescan supersedes any rescan already running: the older one
//! notices the generation change at its next batch boundary and stops.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hc_wire::BlockHash;

use super::{BridgeHook, Wallet};
use crate::error::Result;
use crate::rpc::ChainClient;
use crate::types::RescanProgress;

/// Generation counter and activity flag shared by all rescans of a wallet.
#[derive(Debug, Default)]
pub(crate) struct ScanState {
    generation: u64,
    active: bool,
}

impl Wallet {
    pub async fn is_scanning(&self) -> bool {
        self.scan.lock().await.active
    }

    async fn is_superseded(&self, generation: u64) -> bool {
        self.scan.lock().await.generation != generation
    }

    /// Rescans the main chain from `start` to the tip.
    ///
    /// Progress is reported after each committed batch; the sender is
    /// dropped when the rescan ends. Cancellation and supersession are
    /// checked between batches and end the rescan without an error.
    pub async fn rescan(
        &self,
        client: &dyn ChainClient,
        start: BlockHash,
        progress: Option<mpsc::Sender<RescanProgress>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let generation = {
            let mut scan = self.scan.lock().await;
            scan.generation += 1;
            scan.active = true;
            scan.generation
        };

        let result = self.rescan_batches(client, start, progress.as_ref(), &cancel, generation).await;

        let mut scan = self.scan.lock().await;
        if scan.generation == generation {
            scan.active = false;
        }
        result
    }

    async fn rescan_batches(
        &self,
        client: &dyn ChainClient,
        start: BlockHash,
        progress: Option<&mpsc::Sender<RescanProgress>>,
        cancel: &CancellationToken,
        generation: u64,
    ) -> Result<()> {
        let batch_size = self.config.rescan_batch_size;
        let mut from = start;
        let mut inclusive = true;
        let mut height = self.store.snapshot()?.tx.block_meta(&start)?.height;

        loop {
            if cancel.is_cancelled() {
                tracing::info!("Rescan cancelled at height {}", height);
                return Ok(());
            }
            if self.is_superseded(generation).await {
                tracing::info!("Rescan superseded at height {}", height);
                return Ok(());
            }

            let snapshot = self.store.snapshot()?;
            let hashes = snapshot.tx.main_chain_hashes(&from, inclusive, batch_size)?;
            let Some(last) = hashes.last().copied() else {
                tracing::info!("Rescan finished at height {}", height.saturating_sub(1));
                return Ok(());
            };
            // Blocks below the batch that are still unprocessed must not be skipped.
            let contiguous = match snapshot.tx.rescan_point() {
                Some(point) => snapshot.tx.block_meta(&point).map(|meta| meta.height >= height).unwrap_or(false),
                None => true,
            };
            drop(snapshot);

            let scanning_through = height + hashes.len() as u32 - 1;
            tracing::info!("Rescanning blocks {}-{}...", height, scanning_through);
            let discovered = client.rescan(&hashes).await?;

            if cancel.is_cancelled() || self.is_superseded(generation).await {
                tracing::info!("Rescan stopped before recording blocks {}-{}", height, scanning_through);
                return Ok(());
            }

            let feed_bridge = self.bridge.is_some();
            self.update(|txn| {
                for block in &discovered {
                    let meta = txn.state.tx.block_meta(&block.hash)?;
                    for serialized in &block.transactions {
                        self.process_serialized_transaction(txn, serialized, Some(&meta))?;
                    }
                }
                if feed_bridge {
                    for hash in &hashes {
                        let meta = txn.state.tx.block_meta(hash)?;
                        txn.outbox.bridge_hooks.push(BridgeHook::BlockConnected {
                            height: meta.height,
                            hash: meta.hash,
                            time: meta.time,
                        });
                    }
                }
                if contiguous {
                    txn.state.tx.advance_processed_marker(&last)?;
                }
                Ok(())
            })
            .await?;

            if let Some(progress) = progress {
                if self.is_superseded(generation).await {
                    return Ok(());
                }
                if progress.send(RescanProgress::ScannedThrough(scanning_through)).await.is_err() {
                    tracing::debug!("Rescan progress receiver dropped");
                }
            }

            from = last;
            height += hashes.len() as u32;
            inclusive = false;
        }
    }

    /// Rescans from `start` without progress reporting or cancellation.
    pub async fn rescan_from_hash(&self, client: &dyn ChainClient, start: BlockHash) -> Result<()> {
        self.rescan(client, start, None, CancellationToken::new()).await
    }

    /// Rescans from `height`, or from the token bridge's watermark when the
    /// bridge has already processed further.
    pub async fn rescan_from_height(
        &self,
        client: &dyn ChainClient,
        height: u32,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.rescan_from_height_with_progress(client, height, None, cancel).await
    }

    async fn rescan_from_height_with_progress(
        &self,
        client: &dyn ChainClient,
        height: u32,
        progress: Option<mpsc::Sender<RescanProgress>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut start = height;
        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.rollback(start).await {
                tracing::warn!("Token bridge rollback to height {} failed: {}", start, e);
            }
            match bridge.watermark().await {
                Ok(watermark) if watermark > start => {
                    tracing::info!("Token bridge has processed through height {}, resuming there", watermark);
                    start = watermark;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Cannot read the token bridge watermark: {}", e),
            }
        }

        let snapshot = self.store.snapshot()?;
        if start > snapshot.tx.tip_height() {
            tracing::debug!("Nothing to rescan above height {}", start);
            return Ok(());
        }
        let start_hash = snapshot.tx.block_hash_at(start)?;
        drop(snapshot);

        self.rescan(client, start_hash, progress, cancel).await
    }

    /// Starts a rescan from `height` in the background and returns its
    /// progress stream. A failure is reported as the final item.
    pub fn rescan_progress_from_height(
        self: &Arc<Self>,
        client: Arc<dyn ChainClient>,
        height: u32,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<RescanProgress> {
        let (tx, rx) = self.notifications.rescan_progress_channel();
        let wallet = Arc::clone(self);
        tokio::spawn(async move {
            let failure = tx.clone();
            let result = wallet.rescan_from_height_with_progress(&*client, height, Some(tx), cancel).await;
            if let Err(e) = result {
                tracing::error!("Rescan from height {} failed: {}", height, e);
                let _ = failure.send(RescanProgress::Failed(e.to_string())).await;
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::config::WalletConfig;
    use crate::storage::{InMemory, LedgerState, LedgerStore};
    use crate::test_utils::{ChainBuilder, MockChainClient, RecordingBridge, pay_to};
    use hc_wire::{Address, BlockHeaderData, Network};

    fn addr() -> Address {
        Address::p2pkh([1; 20], Network::Simnet)
    }

    /// A wallet whose main chain already holds `count` blocks with the
    /// processed marker at the tip.
    fn wallet_with_chain(config: WalletConfig, count: usize) -> (Wallet, Vec<BlockHeaderData>) {
        let mut chain = ChainBuilder::new();
        let mut state = LedgerState::default();
        let blocks: Vec<_> = (0..count).map(|_| chain.next_block()).collect();
        for block in &blocks {
            state.tx.extend_main_chain(block).unwrap();
        }
        state.addr.insert_address(addr(), 0, false, 0).unwrap();
        let store = LedgerStore::new(state, Box::new(InMemory));
        (Wallet::new(config, store).unwrap(), blocks)
    }

    async fn drain(mut rx: mpsc::Receiver<RescanProgress>) -> Vec<RescanProgress> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_batches_cover_chain() {
        let (wallet, blocks) = wallet_with_chain(WalletConfig::simnet(), 5000);
        let client = MockChainClient::new();
        let (tx, rx) = mpsc::channel(8);

        let progress = tokio::spawn(drain(rx));
        wallet.rescan(&client, blocks[0].block_hash, Some(tx), CancellationToken::new()).await.unwrap();

        let sizes: Vec<usize> = client.rescan_batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2000, 2000, 1000]);
        assert_eq!(
            progress.await.unwrap(),
            vec![
                RescanProgress::ScannedThrough(2000),
                RescanProgress::ScannedThrough(4000),
                RescanProgress::ScannedThrough(5000)
            ]
        );
        assert!(!wallet.is_scanning().await);
    }

    #[tokio::test]
    async fn test_discovered_transactions_are_recorded() {
        let config = WalletConfig::simnet().with_rescan_batch_size(4);
        let (wallet, blocks) = wallet_with_chain(config, 10);
        let payment = pay_to(&addr(), 1_234);
        let client = MockChainClient::new();
        client.discover(blocks[6].block_hash, vec![payment.clone()]);

        wallet.rescan_from_hash(&client, blocks[2].block_hash).await.unwrap();

        let snapshot = wallet.ledger().snapshot().unwrap();
        assert_eq!(snapshot.tx.mined_block(&payment.tx_hash()).unwrap().hash, blocks[6].block_hash);
        assert_eq!(client.rescan_batches()[0][0], blocks[2].block_hash);
        assert_eq!(client.rescan_batches().len(), 2);
    }

    #[tokio::test]
    async fn test_marker_advances_only_without_gap() {
        let config = WalletConfig::simnet().with_rescan_batch_size(100);
        let (wallet, blocks) = wallet_with_chain(config, 10);
        wallet
            .update(|txn| Ok(txn.state.tx.set_processed_marker(&blocks[1].block_hash)?))
            .await
            .unwrap();
        let client = MockChainClient::new();

        wallet.rescan_from_hash(&client, blocks[5].block_hash).await.unwrap();
        assert_eq!(wallet.rescan_point().unwrap(), Some(blocks[2].block_hash));

        wallet.rescan_from_hash(&client, blocks[2].block_hash).await.unwrap();
        assert_eq!(wallet.rescan_point().unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancelled_rescan_does_nothing() {
        let (wallet, blocks) = wallet_with_chain(WalletConfig::simnet(), 10);
        let client = MockChainClient::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        wallet.rescan(&client, blocks[0].block_hash, None, cancel).await.unwrap();
        assert!(client.rescan_batches().is_empty());
    }

    #[tokio::test]
    async fn test_new_rescan_supersedes_running_one() {
        let config = WalletConfig::simnet().with_rescan_batch_size(10);
        let (wallet, blocks) = wallet_with_chain(config, 30);
        let wallet = Arc::new(wallet);
        let gate = Arc::new(Semaphore::new(0));
        let client: Arc<dyn ChainClient> = Arc::new(MockChainClient::new().with_gate(gate.clone()));
        let start = blocks[0].block_hash;

        let (tx_a, rx_a) = mpsc::channel(8);
        let first = {
            let (wallet, client) = (wallet.clone(), client.clone());
            tokio::spawn(async move { wallet.rescan(&*client, start, Some(tx_a), CancellationToken::new()).await })
        };
        while !wallet.is_scanning().await {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let (tx_b, rx_b) = mpsc::channel(8);
        let second = {
            let (wallet, client) = (wallet.clone(), client.clone());
            tokio::spawn(async move { wallet.rescan(&*client, start, Some(tx_b), CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.add_permits(100);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert!(drain(rx_a).await.is_empty());
        assert_eq!(
            drain(rx_b).await,
            vec![
                RescanProgress::ScannedThrough(10),
                RescanProgress::ScannedThrough(20),
                RescanProgress::ScannedThrough(30)
            ]
        );
        assert!(!wallet.is_scanning().await);
    }

    #[tokio::test]
    async fn test_rescan_resumes_at_bridge_watermark() {
        let (wallet, blocks) = wallet_with_chain(WalletConfig::simnet(), 10);
        let bridge = Arc::new(RecordingBridge::with_watermark(6));
        let wallet = wallet.with_bridge(bridge.clone());
        let client = MockChainClient::new();

        wallet.rescan_from_height(&client, 2, CancellationToken::new()).await.unwrap();

        assert_eq!(client.rescan_batches()[0][0], blocks[5].block_hash);
        let calls = bridge.calls();
        assert_eq!(calls[0], ("omni_rollback".to_string(), vec![json!(2), json!([])]));
        assert_eq!(calls[1].0, "omni_getwaterline");
        // One connect hook per rescanned block, heights 6 through 10.
        assert_eq!(calls.len(), 2 + 5);
    }

    #[tokio::test]
    async fn test_bridge_failure_does_not_stop_rescan() {
        let (wallet, blocks) = wallet_with_chain(WalletConfig::simnet(), 4);
        let bridge = Arc::new(RecordingBridge::failing());
        let wallet = wallet.with_bridge(bridge.clone());
        let client = MockChainClient::new();

        wallet.rescan_from_height(&client, 2, CancellationToken::new()).await.unwrap();

        let batches = client.rescan_batches();
        assert_eq!(batches[0], blocks[1..].iter().map(|b| b.block_hash).collect::<Vec<_>>());
        let calls = bridge.calls();
        assert_eq!(calls[0].0, "omni_rollback");
        assert_eq!(calls[1].0, "omni_getwaterline");
        assert_eq!(wallet.rescan_point().unwrap(), None);
    }

    #[tokio::test]
    async fn test_progress_reports_failure() {
        let (wallet, _) = wallet_with_chain(WalletConfig::simnet(), 3);
        let wallet = Arc::new(wallet);
        let client: Arc<dyn ChainClient> = Arc::new(MockChainClient::new().failing_rescans());

        let rx = wallet.rescan_progress_from_height(client, 1, CancellationToken::new());
        match drain(rx).await.as_slice() {
            [RescanProgress::Failed(message)] => assert!(message.contains("RPC")),
            other => panic!("unexpected progress {other:?}"),
        }
    }
}
