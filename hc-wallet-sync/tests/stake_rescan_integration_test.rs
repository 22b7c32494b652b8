//! Rescans over long chains and stake-pool ticket intake.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use hc_wallet_sync::storage::{InMemory, LedgerState, LedgerStore};
use hc_wallet_sync::test_utils::{ChainBuilder, MockChainClient, pay_to, pool_ticket};
use hc_wallet_sync::wallet::stake_pool_ticket_fee;
use hc_wallet_sync::{Address, Network, RescanProgress, Wallet, WalletConfig};
use hc_wire::BlockHeaderData;

const NET: Network = Network::Simnet;

fn chain_of(count: usize) -> Vec<BlockHeaderData> {
    let mut chain = ChainBuilder::new();
    (0..count).map(|_| chain.next_block()).collect()
}

fn wallet_over(config: WalletConfig, blocks: &[BlockHeaderData], watched: &Address) -> Wallet {
    let mut state = LedgerState::default();
    for block in blocks {
        state.tx.extend_main_chain(block).unwrap();
    }
    state.addr.insert_address(*watched, 0, false, 0).unwrap();
    Wallet::new(config, LedgerStore::new(state, Box::new(InMemory))).unwrap()
}

#[tokio::test]
async fn test_full_rescan_reports_progress_and_finds_history() {
    let watched = Address::p2pkh([0x21; 20], NET);
    let blocks = chain_of(5000);
    let wallet = Arc::new(wallet_over(WalletConfig::simnet(), &blocks, &watched));

    let client = Arc::new(MockChainClient::new());
    let early = pay_to(&watched, 10_000);
    let late = pay_to(&watched, 20_000);
    client.discover(blocks[9].block_hash, vec![early.clone()]);
    client.discover(blocks[4320].block_hash, vec![late.clone()]);

    let mut progress = wallet.rescan_progress_from_height(client.clone(), 1, CancellationToken::new());
    let mut items = Vec::new();
    while let Some(item) = progress.recv().await {
        items.push(item);
    }

    assert_eq!(
        items,
        vec![
            RescanProgress::ScannedThrough(2000),
            RescanProgress::ScannedThrough(4000),
            RescanProgress::ScannedThrough(5000),
        ]
    );
    let batches = client.rescan_batches();
    assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2000, 2000, 1000]);

    let snapshot = wallet.ledger().snapshot().unwrap();
    assert_eq!(snapshot.tx.mined_block(&early.tx_hash()).unwrap().height, 10);
    assert_eq!(snapshot.tx.mined_block(&late.tx_hash()).unwrap().height, 4321);
    assert_eq!(wallet.rescan_point().unwrap(), None);
}

#[tokio::test]
async fn test_rescan_beyond_tip_is_a_no_op() {
    let watched = Address::p2pkh([0x22; 20], NET);
    let blocks = chain_of(10);
    let wallet = wallet_over(WalletConfig::simnet(), &blocks, &watched);
    let client = MockChainClient::new();

    wallet.rescan_from_height(&client, 11, CancellationToken::new()).await.unwrap();
    assert!(client.rescan_batches().is_empty());
}

#[tokio::test]
async fn test_stake_pool_accepts_only_paying_tickets() {
    let cold = Address::p2pkh([0xc0; 20], NET);
    let voting = Address::p2pkh([0x31; 20], NET);
    let config = WalletConfig::simnet().with_stake_pool(5.0, vec![cold]);
    let wallet = Wallet::new(config, LedgerStore::in_memory()).unwrap();
    wallet.import_address(voting, 0, false, 0).await.unwrap();

    let mut chain = ChainBuilder::new();
    let block = chain.next_block();
    let ticket_value = 1_000_000_000;
    let fee = stake_pool_ticket_fee(ticket_value, 50_000, block.height(), 5.0, NET.params());
    let paying = pool_ticket(&voting, &cold, fee, ticket_value, 50_000);
    let short = pool_ticket(&voting, &cold, fee - 1, ticket_value, 50_000);

    wallet.on_block_connected(&block, &[paying.to_bytes(), short.to_bytes()]).await.unwrap();

    let user = wallet.stake_pool_user_info(&voting).unwrap();
    assert_eq!(user.tickets.len(), 1);
    assert_eq!(user.tickets[0].ticket, paying.tx_hash());
    assert_eq!(user.tickets[0].height_ticket, block.height());
    assert_eq!(user.invalid_tickets, vec![short.tx_hash()]);
}
