//! Main chain extension and reorganization handling.
//!
//! While no reorganization is in flight, every connected block extends the
//! main chain directly. A reorganization notification switches the wallet
//! into accumulating mode: connected blocks are buffered as a side chain
//! until the notified target block arrives, and the whole switch (rollback
//! of the old suffix and replay of the side chain) then commits in a single
//! ledger update.

use hc_wire::{BlockHash, BlockHeaderData, Transaction};

use super::{BridgeHook, Wallet, WalletTxn};
use crate::error::{Result, StorageError, SyncError, SyncResult};
use crate::types::{MainTipChanged, SideChainBlock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ReorgTarget {
    hash: BlockHash,
    height: u32,
}

/// Side-chain blocks received during a reorganization, ordered by height
/// and indexed by their offset from the fork height.
#[derive(Debug, Default)]
pub(crate) struct SideChain {
    blocks: Vec<SideChainBlock>,
}

impl SideChain {
    pub(crate) fn fork_height(&self) -> Option<u32> {
        self.blocks.first().map(|block| block.header.height())
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn blocks(&self) -> &[SideChainBlock] {
        &self.blocks
    }

    /// Places `block` at its offset from the fork height.
    ///
    /// A redelivered block is ignored; a different block at an occupied
    /// offset replaces it and everything after it. Blocks must not leave a
    /// gap and the buffer never grows beyond `max_depth`.
    pub(crate) fn push(&mut self, block: SideChainBlock, max_depth: usize) -> SyncResult<()> {
        let height = block.header.height();
        let Some(fork_height) = self.fork_height() else {
            self.blocks.push(block);
            return Ok(());
        };

        let next = fork_height + self.blocks.len() as u32;
        if height < fork_height || height > next {
            return Err(SyncError::SideChainGap {
                expected: next,
                got: height,
            });
        }

        let offset = (height - fork_height) as usize;
        if offset < self.blocks.len() {
            if self.blocks[offset].header.block_hash == block.header.block_hash {
                return Ok(());
            }
            self.blocks.truncate(offset);
        } else if self.blocks.len() >= max_depth {
            return Err(SyncError::ReorgTooDeep {
                depth: self.blocks.len() + 1,
                max: max_depth,
            });
        }
        self.blocks.push(block);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.blocks.clear();
    }
}

/// Reorganization flag and side-chain buffer, guarded by their own lock.
#[derive(Debug, Default)]
pub(crate) struct ReorgState {
    target: Option<ReorgTarget>,
    side_chain: SideChain,
}

impl ReorgState {
    fn clear(&mut self) {
        self.target = None;
        self.side_chain.clear();
    }
}

impl Wallet {
    pub async fn is_reorganizing(&self) -> bool {
        self.reorg.lock().await.target.is_some()
    }

    /// Enters accumulating mode for a reorganization to `new_hash`.
    ///
    /// A second notification while one is in flight is rejected and the
    /// in-flight target is kept.
    pub async fn handle_reorganizing(
        &self,
        old_hash: BlockHash,
        old_height: u32,
        new_hash: BlockHash,
        new_height: u32,
    ) -> Result<()> {
        let mut reorg = self.reorg.lock().await;
        if let Some(in_flight) = reorg.target {
            return Err(SyncError::ReorgInProgress {
                requested: new_hash,
                in_flight: in_flight.hash,
            }
            .into());
        }

        reorg.side_chain.clear();
        reorg.target = Some(ReorgTarget {
            hash: new_hash,
            height: new_height,
        });
        tracing::info!(
            "Reorganization detected: old tip {} (height {}), new tip {} (height {})",
            old_hash,
            old_height,
            new_hash,
            new_height
        );
        Ok(())
    }

    /// Handles a block connected to the node's main chain.
    pub async fn on_block_connected(&self, header: &BlockHeaderData, transactions: &[Vec<u8>]) -> Result<()> {
        let decoded = header.raw_header.decode()?;

        let change = {
            let mut reorg = self.reorg.lock().await;
            let target = reorg.target;
            match target {
                Some(target) => {
                    let block = SideChainBlock {
                        header: *header,
                        transactions: transactions.to_vec(),
                    };
                    if let Err(e) = reorg.side_chain.push(block, self.config.max_reorg_depth) {
                        tracing::warn!("Abandoning reorganization to block {}: {}", target.hash, e);
                        reorg.clear();
                        return Err(e.into());
                    }
                    tracing::info!(
                        "Adding block {} (height {}) to sidechain",
                        header.block_hash,
                        decoded.height
                    );
                    if header.block_hash != target.hash {
                        return Ok(());
                    }

                    // On failure the buffer is kept; a redelivered target retries the switch.
                    let side_chain = reorg.side_chain.blocks();
                    let change = self.update(|txn| self.switch_to_side_chain(txn, side_chain)).await?;
                    reorg.clear();
                    tracing::info!(
                        "Wallet reorganization to block {} (height {}) complete",
                        target.hash,
                        target.height
                    );
                    change
                }
                None => {
                    self.update(|txn| self.extend_main_chain(txn, header, transactions)).await?;
                    MainTipChanged {
                        attached_blocks: vec![header.block_hash],
                        detached_blocks: Vec::new(),
                        new_height: decoded.height,
                    }
                }
            }
        };

        let height = decoded.height;
        let sbits = decoded.sbits;
        match self.update(|txn| Ok(txn.state.tx.prune_unmined(height, sbits))).await {
            Ok(pruned) if !pruned.is_empty() => {
                tracing::debug!("Pruned {} stale unmined transactions at height {}", pruned.len(), height)
            }
            Ok(_) => {}
            Err(e) => tracing::error!(
                "Failed to prune unconfirmed transactions when connecting block height {}: {}",
                height,
                e
            ),
        }

        self.forget_instant_txs(transactions).await;
        self.notifications.notify_tip_changed(change);
        Ok(())
    }

    /// Appends a block to the main chain and records its transactions.
    ///
    /// A block already on the main chain is not an error; its transactions
    /// are replayed, which leaves the ledger unchanged.
    pub(crate) fn extend_main_chain(
        &self,
        txn: &mut WalletTxn<'_>,
        header: &BlockHeaderData,
        transactions: &[Vec<u8>],
    ) -> Result<()> {
        let height = header.height();
        tracing::info!("Connecting block {}, height {}", header.block_hash, height);

        let connected = match txn.state.tx.extend_main_chain(header) {
            Ok(_) => true,
            Err(StorageError::Duplicate(_)) => {
                tracing::debug!("Block {} already exists in the ledger", header.block_hash);
                false
            }
            Err(e) => return Err(e.into()),
        };

        let meta = txn.state.tx.block_meta(&header.block_hash)?;
        for serialized in transactions {
            self.process_serialized_transaction(txn, serialized, Some(&meta))?;
        }

        if connected {
            txn.outbox.bridge_hooks.push(BridgeHook::BlockConnected {
                height,
                hash: meta.hash,
                time: meta.time,
            });
        }
        Ok(())
    }

    /// Replaces the main chain from the side chain's fork height upwards.
    pub(crate) fn switch_to_side_chain(
        &self,
        txn: &mut WalletTxn<'_>,
        side_chain: &[SideChainBlock],
    ) -> Result<MainTipChanged> {
        let first = side_chain.first().ok_or(SyncError::EmptySideChain)?;
        let fork_height = first.header.height();
        if let Some(tip) = txn.state.tx.main_chain_tip() {
            if tip.height + 1 < fork_height {
                return Err(SyncError::ForkAboveTip {
                    fork_height,
                    tip_height: tip.height,
                }
                .into());
            }
        }

        let detached = txn.state.tx.rollback(fork_height);
        if !detached.is_empty() {
            let votes = txn.state.stake.detach_votes(&detached);
            let revocations = txn.state.stake.detach_revocations(&detached);
            tracing::info!(
                "Detached {} blocks from height {} ({} votes and {} revocations unconfirmed)",
                detached.len(),
                fork_height,
                votes,
                revocations
            );
            txn.outbox.bridge_hooks.push(BridgeHook::Rollback {
                height: fork_height,
            });
        }

        // Moving the marker past unscanned blocks below the fork would lose them.
        let marker_height = txn
            .state
            .tx
            .processed_marker()
            .and_then(|marker| txn.state.tx.block_meta(&marker).ok())
            .map(|meta| meta.height);
        let no_gap = match marker_height {
            Some(height) => height + 1 >= fork_height,
            None => txn.state.tx.main_chain_tip().is_none(),
        };

        let mut attached = Vec::with_capacity(side_chain.len());
        for block in side_chain {
            self.extend_main_chain(txn, &block.header, &block.transactions)?;
            attached.push(block.header.block_hash);
        }
        if no_gap {
            if let Some(last) = attached.last() {
                txn.state.tx.set_processed_marker(last)?;
            }
        }

        Ok(MainTipChanged {
            attached_blocks: attached,
            detached_blocks: detached,
            new_height: txn.state.tx.tip_height(),
        })
    }

    async fn forget_instant_txs(&self, transactions: &[Vec<u8>]) {
        let mut instant_txs = self.instant_txs.lock().await;
        if instant_txs.is_empty() {
            return;
        }
        for serialized in transactions {
            if let Ok(tx) = Transaction::from_bytes(serialized) {
                if instant_txs.remove(&tx.tx_hash()).is_some() {
                    tracing::debug!("Instant transaction {} confirmed", tx.tx_hash());
                }
            }
        }
    }
}
