//! Remote full node client.

pub mod types;
pub mod ws_client;

use async_trait::async_trait;

use hc_wire::{Address, BlockHash, OutPoint, Transaction, TxHash};

use crate::error::RpcResult;

pub use types::{NodeNotification, decode_notification};
pub use ws_client::{NotificationStreams, WsChainClient};

/// Transactions the node matched against the wallet's filter in one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RescannedBlock {
    pub hash: BlockHash,
    pub transactions: Vec<Vec<u8>>,
}

/// A transaction looked up on the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawTransaction {
    pub tx: Transaction,
    pub block_hash: Option<BlockHash>,
    pub block_height: Option<u32>,
    pub confirmations: u64,
}

/// A ticket holder's vote on an instant transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstantTxVote {
    pub vote: bool,
    pub ticket_hash: TxHash,
    pub instant_tx_hash: TxHash,
    pub pubkey: Vec<u8>,
    pub signature: Vec<u8>,
}

impl InstantTxVote {
    /// Message signed by the ticket's voting key.
    pub fn signing_message(instant_tx_hash: &TxHash, ticket_hash: &TxHash) -> String {
        format!("{instant_tx_hash}{ticket_hash}")
    }
}

/// Calls the wallet makes on the node.
///
/// No timeouts are applied; a call blocks until the node answers or the
/// connection closes.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Matches each block against the loaded filter.
    async fn rescan(&self, block_hashes: &[BlockHash]) -> RpcResult<Vec<RescannedBlock>>;

    async fn get_raw_transaction_verbose(&self, hash: &TxHash) -> RpcResult<RawTransaction>;

    async fn send_raw_transaction(&self, tx: &Transaction, allow_high_fees: bool) -> RpcResult<TxHash>;

    /// Adds addresses and outpoints to the node's relevance filter, replacing
    /// it when `reload` is set.
    async fn load_tx_filter(
        &self,
        reload: bool,
        addresses: &[Address],
        outpoints: &[OutPoint],
    ) -> RpcResult<()>;

    async fn send_instant_tx_vote(&self, vote: &InstantTxVote) -> RpcResult<()>;
}
