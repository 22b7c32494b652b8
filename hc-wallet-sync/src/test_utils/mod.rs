//! Synthetic chains, transactions and scripted collaborators for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use hc_wire::script::{self, opcodes::*};
use hc_wire::stake;
use hc_wire::{
    Address, BlockHash, BlockHeader, BlockHeaderData, OutPoint, Transaction, TxHash, TxIn, TxOut, TxTree,
};

use crate::bridge::TokenBridge;
use crate::error::{BridgeError, BridgeResult, RpcError, RpcResult, StorageError, StorageResult, VotingError, VotingResult};
use crate::rpc::{ChainClient, InstantTxVote, RawTransaction, RescannedBlock};
use crate::storage::{LedgerState, Persistence};
use crate::wallet::TransactionSigner;

const GENESIS_TIME: u32 = 1_700_000_000;
const BLOCK_INTERVAL: u32 = 300;

/// Builds a linked chain of headers starting at height 1.
///
/// Builders with different seeds produce different hashes at the same
/// height, so a fork is a builder that shares a prefix with another.
#[derive(Clone, Debug)]
pub struct ChainBuilder {
    seed: u32,
    sbits: i64,
    prev: BlockHash,
    height: u32,
    blocks: Vec<BlockHeaderData>,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    pub fn with_seed(seed: u32) -> Self {
        Self {
            seed,
            sbits: 2_000_000,
            prev: BlockHash::all_zeros(),
            height: 0,
            blocks: Vec::new(),
        }
    }

    /// Stake difficulty stamped on subsequent blocks.
    pub fn with_sbits(mut self, sbits: i64) -> Self {
        self.sbits = sbits;
        self
    }

    fn mine(&mut self) -> BlockHeaderData {
        let height = self.height + 1;
        let mut extra_data = [0u8; 32];
        extra_data[..4].copy_from_slice(&self.seed.to_le_bytes());
        let header = BlockHeader {
            version: 1,
            prev_block: self.prev,
            bits: 0x207f_ffff,
            sbits: self.sbits,
            height,
            timestamp: GENESIS_TIME + height * BLOCK_INTERVAL,
            nonce: self.seed,
            extra_data,
            ..Default::default()
        };
        let data = BlockHeaderData::from(&header);
        self.prev = data.block_hash;
        self.height = height;
        data
    }

    pub fn next_block(&mut self) -> BlockHeaderData {
        let block = self.mine();
        self.blocks.push(block);
        block
    }

    /// Advances `n` heights without keeping the blocks, so the next block
    /// does not link to anything a test has seen.
    pub fn skip(mut self, n: u32) -> Self {
        for _ in 0..n {
            self.mine();
        }
        self
    }

    /// A builder sharing this chain's blocks below `height` whose next
    /// block is at `height`.
    pub fn fork(&self, height: u32, seed: u32) -> ChainBuilder {
        let blocks: Vec<_> = self.blocks.iter().filter(|b| b.height() < height).copied().collect();
        let (prev, tip) = blocks.last().map_or((BlockHash::all_zeros(), 0), |b| (b.block_hash, b.height()));
        ChainBuilder {
            seed,
            sbits: self.sbits,
            prev,
            height: tip,
            blocks,
        }
    }

    pub fn blocks(&self) -> &[BlockHeaderData] {
        &self.blocks
    }
}

/// 33-byte compressed public key filled with `fill`.
pub fn pubkey(fill: u8) -> Vec<u8> {
    let mut key = vec![0x02];
    key.extend([fill; 32]);
    key
}

/// An input of `value` from an outpoint derived from the other arguments.
fn funding_input(tag: &[u8], address: &Address, value: i64, salt: i64) -> TxIn {
    let mut preimage = tag.to_vec();
    preimage.extend_from_slice(address.hash160());
    preimage.extend_from_slice(&value.to_le_bytes());
    preimage.extend_from_slice(&salt.to_le_bytes());
    let mut input = TxIn::new(OutPoint::new(TxHash::hash(&preimage), 0, TxTree::Regular));
    input.value_in = value;
    input
}

/// A regular transaction paying `value` to `address` from an unknown input.
pub fn pay_to(address: &Address, value: i64) -> Transaction {
    let mut tx = Transaction::new();
    tx.inputs.push(funding_input(b"pay_to", address, value, 0));
    tx.outputs.push(TxOut::new(value, address.script_pubkey()));
    tx
}

/// A ticket voting through `voting` whose single commitment returns
/// `ticket_value + fee` to `commitment`.
pub fn ticket_purchase(voting: &Address, commitment: &Address, ticket_value: i64, fee: i64) -> Transaction {
    let mut tx = Transaction::new();
    tx.inputs.push(funding_input(b"ticket", commitment, ticket_value + fee, ticket_value));
    tx.outputs.push(TxOut::new(ticket_value, script::stake_tagged(OP_SSTX, voting)));
    tx.outputs.push(TxOut::new(0, stake::commitment_script(commitment, ticket_value + fee, 0x5800)));
    tx.outputs.push(TxOut::new(0, script::stake_tagged(OP_SSTXCHANGE, commitment)));
    tx
}

/// A stake-pool ticket: the first commitment pays `pool_fee` to the pool's
/// `cold` address, the second returns the rest to the user.
pub fn pool_ticket(voting: &Address, cold: &Address, pool_fee: i64, ticket_value: i64, fee: i64) -> Transaction {
    let mut tx = Transaction::new();
    tx.inputs.push(funding_input(b"pool ticket", voting, ticket_value + fee, pool_fee));
    tx.outputs.push(TxOut::new(ticket_value, script::stake_tagged(OP_SSTX, voting)));
    tx.outputs.push(TxOut::new(0, stake::commitment_script(cold, pool_fee, 0x5800)));
    tx.outputs.push(TxOut::new(0, script::stake_tagged(OP_SSTXCHANGE, cold)));
    let user = Address::p2pkh([0x5e; 20], voting.network());
    tx.outputs.push(TxOut::new(0, stake::commitment_script(&user, ticket_value + fee - pool_fee, 0x5800)));
    tx.outputs.push(TxOut::new(0, script::stake_tagged(OP_SSTXCHANGE, &user)));
    tx
}

/// A vote spending `ticket` on `block_hash`, paying its reward to `reward`.
pub fn vote_for(ticket: &Transaction, reward: &Address, block_hash: BlockHash, height: u32, vote_bits: u16) -> Transaction {
    let ticket_value = ticket.outputs.first().map_or(0, |out| out.value);
    let mut tx = Transaction::new();
    let mut stakebase = TxIn::new(OutPoint::null());
    stakebase.value_in = 100;
    tx.inputs.push(stakebase);
    let mut ticket_in = TxIn::new(OutPoint::new(ticket.tx_hash(), 0, TxTree::Stake));
    ticket_in.value_in = ticket_value;
    tx.inputs.push(ticket_in);
    tx.outputs.push(TxOut::new(0, stake::vote_block_ref_script(&block_hash, height)));
    tx.outputs.push(TxOut::new(0, stake::vote_bits_script(vote_bits)));
    tx.outputs.push(TxOut::new(ticket_value + 100, script::stake_tagged(OP_SSGEN, reward)));
    tx
}

/// Persistence that fails the next write after `fail_next` is set.
#[derive(Debug, Default)]
pub struct FlakyPersistence {
    pub fail_next: Arc<AtomicBool>,
}

#[async_trait]
impl Persistence for FlakyPersistence {
    async fn persist(&self, _state: &LedgerState) -> StorageResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StorageError::WriteFailed("injected failure".into()));
        }
        Ok(())
    }
}

type FilterLoad = (bool, Vec<Address>, Vec<OutPoint>);

/// A node that answers rescans from a script of discovered transactions
/// and records everything the wallet sends it.
#[derive(Debug, Default)]
pub struct MockChainClient {
    discovered: Mutex<HashMap<BlockHash, Vec<Transaction>>>,
    rescans: Mutex<Vec<Vec<BlockHash>>>,
    sent: Mutex<Vec<Transaction>>,
    filters: Mutex<Vec<FilterLoad>>,
    instant_votes: Mutex<Vec<InstantTxVote>>,
    gate: Option<Arc<Semaphore>>,
    fail_rescans: bool,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every rescan call waits for a permit from `gate`.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing_rescans(mut self) -> Self {
        self.fail_rescans = true;
        self
    }

    /// Reports `transactions` when a rescan covers `block`.
    pub fn discover(&self, block: BlockHash, transactions: Vec<Transaction>) {
        self.discovered.lock().unwrap().entry(block).or_default().extend(transactions);
    }

    pub fn rescan_batches(&self) -> Vec<Vec<BlockHash>> {
        self.rescans.lock().unwrap().clone()
    }

    pub fn sent_transactions(&self) -> Vec<Transaction> {
        self.sent.lock().unwrap().clone()
    }

    pub fn filter_loads(&self) -> Vec<FilterLoad> {
        self.filters.lock().unwrap().clone()
    }

    pub fn instant_votes(&self) -> Vec<InstantTxVote> {
        self.instant_votes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn rescan(&self, block_hashes: &[BlockHash]) -> RpcResult<Vec<RescannedBlock>> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|_| RpcError::Closed)?.forget();
        }
        if self.fail_rescans {
            return Err(RpcError::Server {
                code: -1,
                message: "rescan failed".into(),
            });
        }
        self.rescans.lock().unwrap().push(block_hashes.to_vec());

        let discovered = self.discovered.lock().unwrap();
        Ok(block_hashes
            .iter()
            .filter_map(|hash| {
                discovered.get(hash).map(|txs| RescannedBlock {
                    hash: *hash,
                    transactions: txs.iter().map(Transaction::to_bytes).collect(),
                })
            })
            .collect())
    }

    async fn get_raw_transaction_verbose(&self, hash: &TxHash) -> RpcResult<RawTransaction> {
        let sent = self.sent.lock().unwrap();
        let tx = sent.iter().find(|tx| tx.tx_hash() == *hash).cloned().ok_or_else(|| RpcError::Server {
            code: -5,
            message: format!("No information available about transaction {hash}"),
        })?;
        Ok(RawTransaction {
            tx,
            block_hash: None,
            block_height: None,
            confirmations: 0,
        })
    }

    async fn send_raw_transaction(&self, tx: &Transaction, _allow_high_fees: bool) -> RpcResult<TxHash> {
        self.sent.lock().unwrap().push(tx.clone());
        Ok(tx.tx_hash())
    }

    async fn load_tx_filter(&self, reload: bool, addresses: &[Address], outpoints: &[OutPoint]) -> RpcResult<()> {
        self.filters.lock().unwrap().push((reload, addresses.to_vec(), outpoints.to_vec()));
        Ok(())
    }

    async fn send_instant_tx_vote(&self, vote: &InstantTxVote) -> RpcResult<()> {
        self.instant_votes.lock().unwrap().push(vote.clone());
        Ok(())
    }
}

/// A token bridge that records every call and reports a fixed watermark.
#[derive(Debug, Default)]
pub struct RecordingBridge {
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    watermark: u32,
    failing: bool,
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_watermark(watermark: u32) -> Self {
        Self {
            watermark,
            ..Self::default()
        }
    }

    /// Records calls but answers every one with an error.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenBridge for RecordingBridge {
    async fn call(&self, method: &str, params: Vec<Value>) -> BridgeResult<Value> {
        self.calls.lock().unwrap().push((method.to_string(), params));
        if self.failing {
            return Err(BridgeError::Remote {
                code: -1,
                message: "bridge unavailable".to_string(),
            });
        }
        Ok(match method {
            "omni_getwaterline" => json!(self.watermark),
            _ => Value::Null,
        })
    }
}

/// Signs with fixed placeholder signatures.
#[derive(Clone, Copy, Debug, Default)]
pub struct MockSigner;

impl MockSigner {
    /// Signature `sign_message` returns for `message`.
    pub fn signature_for(message: &str) -> Vec<u8> {
        TxHash::hash(message.as_bytes()).to_byte_array().to_vec()
    }
}

#[async_trait]
impl TransactionSigner for MockSigner {
    async fn sign_transaction(&self, tx: &mut Transaction, index: usize, _ticket: &Transaction) -> VotingResult<()> {
        let input =
            tx.inputs.get_mut(index).ok_or_else(|| VotingError::Signing(format!("no input {index} to sign")))?;
        input.signature_script = script::p2pkh_sig_script(&[0x30; 71], &pubkey(0x02));
        Ok(())
    }

    async fn sign_message(&self, _address: &Address, message: &str) -> VotingResult<Vec<u8>> {
        Ok(Self::signature_for(message))
    }

    async fn pubkey_for_address(&self, address: &Address) -> VotingResult<Vec<u8>> {
        Ok(pubkey(address.hash160()[0]))
    }
}
