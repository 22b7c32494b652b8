//! Sequential consumer of one client's notification streams.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{ChainNotification, VotingNotification};
use crate::error::Result;
use crate::rpc::NotificationStreams;
use crate::wallet::Wallet;

/// Drains the chain and voting streams of one associated client in a
/// single task.
///
/// A failed chain handler never stops the loop: the failure is logged and,
/// unless a rescan is already running, the wallet rescans from its tip in
/// the background to recover anything the failed handler missed.
pub struct Dispatcher {
    wallet: Arc<Wallet>,
    streams: NotificationStreams,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(wallet: Arc<Wallet>, streams: NotificationStreams, shutdown: CancellationToken) -> Self {
        Self {
            wallet,
            streams,
            shutdown,
        }
    }

    /// Runs until shutdown or until both streams close.
    pub async fn run(mut self) {
        tracing::info!("Notification dispatcher started");
        let mut chain_open = true;
        let mut voting_open = true;

        while chain_open || voting_open {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Notification dispatcher shutting down");
                    break;
                }
                notification = self.streams.chain.recv(), if chain_open => match notification {
                    Some(notification) => self.dispatch_chain(notification).await,
                    None => {
                        tracing::info!("Chain notification stream closed");
                        chain_open = false;
                    }
                },
                notification = self.streams.voting.recv(), if voting_open => match notification {
                    Some(notification) => self.dispatch_voting(notification).await,
                    None => {
                        tracing::debug!("Voting notification stream closed");
                        voting_open = false;
                    }
                },
            }
        }
        tracing::info!("Notification dispatcher stopped");
    }

    async fn dispatch_chain(&self, notification: ChainNotification) {
        let name = notification.name();
        if let Err(e) = self.handle_chain(notification).await {
            tracing::error!(
                notification = name,
                category = e.category(),
                "Failed to process consensus server notification (name: `{}`, detail: `{}`)",
                name,
                e
            );
            self.start_recovery_rescan().await;
        }
    }

    async fn handle_chain(&self, notification: ChainNotification) -> Result<()> {
        let wallet = &self.wallet;
        match notification {
            ChainNotification::ClientConnected => {
                tracing::info!("The client has successfully connected to the node and is now handling notifications");
                self.start_catch_up_rescan().await;
                Ok(())
            }
            ChainNotification::BlockConnected {
                header,
                transactions,
            } => wallet.on_block_connected(&header, &transactions).await,
            ChainNotification::Reorganization {
                old_hash,
                old_height,
                new_hash,
                new_height,
            } => wallet.handle_reorganizing(old_hash, old_height, new_hash, new_height).await,
            ChainNotification::RelevantTxAccepted {
                transaction,
            } => {
                if let Some(point) = wallet.rescan_point()? {
                    tracing::debug!("Skipping relevant transaction until the rescan from {} completes", point);
                    return Ok(());
                }
                wallet.accept_relevant_transaction(&transaction).await
            }
            ChainNotification::MissedTickets {
                block_hash,
                height,
                tickets,
            } => wallet.handle_missed_tickets(block_hash, height, &tickets).await,
            ChainNotification::NewInstantTx {
                transaction,
                tickets,
                resend,
            } => wallet.handle_new_instant_tx(&transaction, &tickets, resend).await,
            ChainNotification::InstantTxVote {
                vote_hash,
                instant_tx_hash,
                ticket_hash,
                ..
            } => {
                wallet.handle_instant_tx_vote(&vote_hash, &instant_tx_hash, &ticket_hash);
                Ok(())
            }
        }
    }

    async fn dispatch_voting(&self, notification: VotingNotification) {
        let name = notification.name();
        let result = match notification {
            VotingNotification::WinningTickets {
                block_hash,
                height,
                tickets,
            } => self.wallet.handle_winning_tickets(block_hash, height, &tickets).await,
        };
        if let Err(e) = result {
            tracing::error!(
                notification = name,
                category = e.category(),
                "Cannot handle chain server voting notification {}: {}",
                name,
                e
            );
        }
    }

    /// Rescans from the main chain tip unless a rescan is already running.
    async fn start_recovery_rescan(&self) {
        if self.wallet.is_scanning().await {
            tracing::debug!("Rescan already in progress, not starting a recovery rescan");
            return;
        }
        let Some(client) = self.wallet.chain_client().await else {
            return;
        };
        let height = match self.wallet.main_chain_tip() {
            Ok(Some(tip)) => tip.height,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Cannot read the main chain tip for a recovery rescan: {}", e);
                return;
            }
        };

        tracing::info!("Starting recovery rescan from height {}", height);
        let wallet = Arc::clone(&self.wallet);
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = wallet.rescan_from_height(&*client, height, cancel).await {
                tracing::error!("Recovery rescan from height {} failed: {}", height, e);
            }
        });
    }

    /// Rescans blocks connected before their transactions were processed.
    async fn start_catch_up_rescan(&self) {
        let point = match self.wallet.rescan_point() {
            Ok(Some(point)) => point,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Cannot read the rescan point: {}", e);
                return;
            }
        };
        let Some(client) = self.wallet.chain_client().await else {
            return;
        };

        tracing::info!("Rescanning from {} to catch up with the main chain", point);
        let wallet = Arc::clone(&self.wallet);
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = wallet.rescan(&*client, point, None, cancel).await {
                tracing::error!("Catch-up rescan from {} failed: {}", point, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::WalletConfig;
    use crate::storage::LedgerStore;
    use crate::test_utils::{ChainBuilder, MockChainClient, pay_to};
    use hc_wire::{Address, Network, TxHash};

    struct Harness {
        chain: mpsc::Sender<ChainNotification>,
        voting: mpsc::Sender<VotingNotification>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(wallet: Arc<Wallet>) -> Harness {
        let (chain, chain_rx) = mpsc::channel(16);
        let (voting, voting_rx) = mpsc::channel(16);
        let streams = NotificationStreams {
            chain: chain_rx,
            voting: voting_rx,
        };
        let task = tokio::spawn(Dispatcher::new(wallet, streams, CancellationToken::new()).run());
        Harness {
            chain,
            voting,
            task,
        }
    }

    impl Harness {
        async fn finish(self) {
            drop(self.chain);
            drop(self.voting);
            self.task.await.unwrap();
        }
    }

    fn watched() -> Address {
        Address::p2pkh([5; 20], Network::Simnet)
    }

    async fn wallet() -> Arc<Wallet> {
        let wallet = Wallet::new(WalletConfig::simnet(), LedgerStore::in_memory()).unwrap();
        wallet.import_address(watched(), 0, false, 0).await.unwrap();
        Arc::new(wallet)
    }

    #[tokio::test]
    async fn test_blocks_are_applied_in_order() {
        let wallet = wallet().await;
        let harness = start(wallet.clone());
        let mut chain = ChainBuilder::new();
        let payment = pay_to(&watched(), 700);
        let blocks: Vec<_> = (0..3).map(|_| chain.next_block()).collect();

        for (i, block) in blocks.iter().enumerate() {
            let transactions = if i == 1 { vec![payment.to_bytes()] } else { Vec::new() };
            harness
                .chain
                .send(ChainNotification::BlockConnected {
                    header: *block,
                    transactions,
                })
                .await
                .unwrap();
        }
        harness.finish().await;

        let tip = wallet.main_chain_tip().unwrap().unwrap();
        assert_eq!(tip.hash, blocks[2].block_hash);
        let snapshot = wallet.ledger().snapshot().unwrap();
        assert_eq!(snapshot.tx.mined_block(&payment.tx_hash()).unwrap().hash, blocks[1].block_hash);
    }

    #[tokio::test]
    async fn test_handler_failure_starts_recovery_rescan() {
        let wallet = wallet().await;
        let client = Arc::new(MockChainClient::new());
        wallet.associate_chain_client(client.clone()).await.unwrap();
        let harness = start(wallet.clone());

        let mut chain = ChainBuilder::new();
        let blocks: Vec<_> = (0..3).map(|_| chain.next_block()).collect();
        for block in &blocks {
            harness
                .chain
                .send(ChainNotification::BlockConnected {
                    header: *block,
                    transactions: Vec::new(),
                })
                .await
                .unwrap();
        }
        // Does not link to the tip.
        let stray = chain.fork(2, 9).next_block();
        harness
            .chain
            .send(ChainNotification::BlockConnected {
                header: stray,
                transactions: Vec::new(),
            })
            .await
            .unwrap();
        harness.finish().await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.rescan_batches().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(client.rescan_batches()[0], vec![blocks[2].block_hash]);
        assert_eq!(wallet.main_chain_tip().unwrap().unwrap().hash, blocks[2].block_hash);
    }

    #[tokio::test]
    async fn test_unowned_ticket_notifications_need_no_signer() {
        let config = WalletConfig::simnet().with_voting(1);
        let wallet = Wallet::new(config, LedgerStore::in_memory()).unwrap();
        let client = Arc::new(MockChainClient::new());
        wallet.associate_chain_client(client.clone()).await.unwrap();
        let wallet = Arc::new(wallet);
        let harness = start(wallet.clone());

        let block = ChainBuilder::new().next_block();
        harness
            .chain
            .send(ChainNotification::BlockConnected {
                header: block,
                transactions: Vec::new(),
            })
            .await
            .unwrap();
        let foreign = vec![TxHash::hash(b"not a wallet ticket")];
        harness
            .chain
            .send(ChainNotification::MissedTickets {
                block_hash: block.block_hash,
                height: 200,
                tickets: foreign.clone(),
            })
            .await
            .unwrap();
        harness
            .voting
            .send(VotingNotification::WinningTickets {
                block_hash: block.block_hash,
                height: 200,
                tickets: foreign,
            })
            .await
            .unwrap();
        harness.finish().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(client.rescan_batches().is_empty());
        assert!(client.sent_transactions().is_empty());
        assert_eq!(wallet.main_chain_tip().unwrap().unwrap().hash, block.block_hash);
    }

    #[tokio::test]
    async fn test_relevant_tx_skipped_while_behind() {
        let wallet = wallet().await;
        let mut chain = ChainBuilder::new();
        let b1 = chain.next_block();
        let b2 = chain.next_block();
        wallet.on_block_connected(&b1, &[]).await.unwrap();
        wallet.on_block_connected(&b2, &[]).await.unwrap();
        wallet.update(|txn| Ok(txn.state.tx.set_processed_marker(&b1.block_hash)?)).await.unwrap();

        let harness = start(wallet.clone());
        let payment = pay_to(&watched(), 900);
        harness
            .chain
            .send(ChainNotification::RelevantTxAccepted {
                transaction: payment.to_bytes(),
            })
            .await
            .unwrap();
        harness.finish().await;

        assert!(wallet.ledger().snapshot().unwrap().tx.record(&payment.tx_hash()).is_none());
    }

    #[tokio::test]
    async fn test_relevant_tx_recorded_when_current() {
        let wallet = wallet().await;
        let harness = start(wallet.clone());
        let payment = pay_to(&watched(), 900);
        harness
            .chain
            .send(ChainNotification::RelevantTxAccepted {
                transaction: payment.to_bytes(),
            })
            .await
            .unwrap();
        harness.finish().await;

        assert!(wallet.ledger().snapshot().unwrap().tx.is_unmined(&payment.tx_hash()));
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatcher() {
        let wallet = wallet().await;
        let (_chain, chain_rx) = mpsc::channel::<ChainNotification>(1);
        let (_voting, voting_rx) = mpsc::channel::<VotingNotification>(1);
        let shutdown = CancellationToken::new();
        let streams = NotificationStreams {
            chain: chain_rx,
            voting: voting_rx,
        };
        let task = tokio::spawn(Dispatcher::new(wallet, streams, shutdown.clone()).run());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
