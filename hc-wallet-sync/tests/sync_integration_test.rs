//! End-to-end chain following: notifications through the dispatcher into a
//! wallet backed by the disk store.

use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hc_wallet_sync::notifications::{ChainNotification, Dispatcher, VotingNotification};
use hc_wallet_sync::rpc::NotificationStreams;
use hc_wallet_sync::storage::LedgerStore;
use hc_wallet_sync::test_utils::{ChainBuilder, pay_to};
use hc_wallet_sync::{Address, Network, Wallet, WalletConfig};
use hc_wire::BlockHeaderData;

fn watched() -> Address {
    Address::p2pkh([0x11; 20], Network::Simnet)
}

async fn open_wallet(dir: &TempDir) -> Arc<Wallet> {
    let config = WalletConfig::simnet().with_data_dir(dir.path());
    let store = LedgerStore::open(dir.path()).await.unwrap();
    let wallet = Wallet::new(config, store).unwrap();
    // A reopened ledger already watches the address.
    if let Err(e) = wallet.import_address(watched(), 0, false, 0).await {
        assert!(e.is_duplicate(), "unexpected import failure: {e}");
    }
    Arc::new(wallet)
}

/// Feeds `notifications` through a dispatcher and waits for it to drain.
async fn dispatch(wallet: Arc<Wallet>, notifications: Vec<ChainNotification>) {
    let (chain_tx, chain_rx) = mpsc::channel(notifications.len().max(1));
    let (voting_tx, voting_rx) = mpsc::channel::<VotingNotification>(1);
    let streams = NotificationStreams {
        chain: chain_rx,
        voting: voting_rx,
    };
    let task = tokio::spawn(Dispatcher::new(wallet, streams, CancellationToken::new()).run());

    for notification in notifications {
        chain_tx.send(notification).await.unwrap();
    }
    drop(chain_tx);
    drop(voting_tx);
    task.await.unwrap();
}

fn connected(header: &BlockHeaderData, transactions: Vec<Vec<u8>>) -> ChainNotification {
    ChainNotification::BlockConnected {
        header: *header,
        transactions,
    }
}

#[tokio::test]
async fn test_dispatcher_follows_reorganization() {
    let dir = TempDir::new().unwrap();
    let wallet = open_wallet(&dir).await;
    let mut tips = wallet.subscribe_tip_changes();

    let mut main = ChainBuilder::new();
    let old: Vec<_> = (0..5).map(|_| main.next_block()).collect();
    let payment = pay_to(&watched(), 1_500);

    let mut fork = main.fork(old[3].height(), 77);
    let new: Vec<_> = (0..3).map(|_| fork.next_block()).collect();
    let target = new[2];

    let mut notifications: Vec<_> = old
        .iter()
        .enumerate()
        .map(|(i, block)| connected(block, if i == 4 { vec![payment.to_bytes()] } else { Vec::new() }))
        .collect();
    notifications.push(ChainNotification::Reorganization {
        old_hash: old[4].block_hash,
        old_height: old[4].height(),
        new_hash: target.block_hash,
        new_height: target.height(),
    });
    notifications.extend(new.iter().map(|block| connected(block, Vec::new())));

    dispatch(wallet.clone(), notifications).await;

    let tip = wallet.main_chain_tip().unwrap().unwrap();
    assert_eq!(tip.hash, target.block_hash);
    assert_eq!(tip.height, 6);

    let snapshot = wallet.ledger().snapshot().unwrap();
    assert!(snapshot.tx.is_unmined(&payment.tx_hash()));
    for block in &old[3..] {
        assert!(!snapshot.tx.contains_block(&block.block_hash));
    }

    // One change per extension, then a single change for the switch.
    let mut changes = Vec::new();
    while let Some(change) = tips.try_recv() {
        changes.push(change);
    }
    assert_eq!(changes.len(), old.len() + 1);
    let switch = changes.last().unwrap();
    assert_eq!(switch.detached_blocks, vec![old[3].block_hash, old[4].block_hash]);
    assert_eq!(switch.attached_blocks, new.iter().map(|b| b.block_hash).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_ledger_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut chain = ChainBuilder::new();
    let blocks: Vec<_> = (0..3).map(|_| chain.next_block()).collect();
    let payment = pay_to(&watched(), 4_000);

    {
        let wallet = open_wallet(&dir).await;
        let notifications = blocks
            .iter()
            .enumerate()
            .map(|(i, block)| connected(block, if i == 1 { vec![payment.to_bytes()] } else { Vec::new() }))
            .collect();
        dispatch(wallet, notifications).await;
    }

    let wallet = open_wallet(&dir).await;
    assert_eq!(wallet.main_chain_tip().unwrap().unwrap().hash, blocks[2].block_hash);
    assert_eq!(wallet.rescan_point().unwrap(), None);
    assert_eq!(wallet.balances(1).unwrap().spendable, 4_000);

    // The reopened chain keeps extending from the stored tip.
    let next = chain.next_block();
    dispatch(wallet.clone(), vec![connected(&next, Vec::new())]).await;
    assert_eq!(wallet.main_chain_tip().unwrap().unwrap().height, 4);
}

#[tokio::test]
async fn test_redelivered_blocks_change_nothing() {
    let dir = TempDir::new().unwrap();
    let wallet = open_wallet(&dir).await;
    let mut chain = ChainBuilder::new();
    let block = chain.next_block();
    let payment = pay_to(&watched(), 2_000).to_bytes();

    dispatch(wallet.clone(), vec![connected(&block, vec![payment.clone()])]).await;
    let before = wallet.unspent_outputs().unwrap();

    dispatch(wallet.clone(), vec![connected(&block, vec![payment.clone()]), connected(&block, vec![payment])]).await;

    assert_eq!(wallet.unspent_outputs().unwrap(), before);
    assert_eq!(wallet.main_chain_tip().unwrap().unwrap().hash, block.block_hash);
}
