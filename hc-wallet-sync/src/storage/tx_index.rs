//! Transaction namespace: the main chain index, mined and unmined
//! transactions, credits, multisig outputs and the processed-transactions
//! marker.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use hc_wire::script::{self, ScriptClass};
use hc_wire::{BlockHash, BlockHeaderData, Network, OutPoint, StakeTxType, Transaction, TxHash, TxTree};

use crate::error::{StorageError, StorageResult};
use crate::types::{BlockMeta, ChainTip, TxRecord};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BlockRecord {
    header: BlockHeaderData,
    meta: BlockMeta,
    /// Mined transactions recorded in this block, in insertion order.
    transactions: Vec<TxHash>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MinedTx {
    rec: TxRecord,
    block: BlockHash,
}

/// A wallet-controlled output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    pub outpoint: OutPoint,
    pub amount: i64,
    pub pk_script: Vec<u8>,
    pub account: u32,
    pub internal: bool,
    pub tx_type: StakeTxType,
    pub coinbase: bool,
}

/// A pay-to-script-hash multisig output with at least one wallet key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigOut {
    pub outpoint: OutPoint,
    pub script_hash: [u8; 20],
    pub required: u8,
    pub total: u8,
    pub amount: i64,
    pub spent_by: Option<(TxHash, u32)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnspentOutput {
    pub credit: Credit,
    /// Height of the mined transaction, `None` while unmined.
    pub height: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Balances {
    pub total: i64,
    pub spendable: i64,
    pub immature: i64,
    pub locked_by_tickets: i64,
    pub unconfirmed: i64,
}

/// Tree holding the outputs of a transaction of the given stake type.
pub fn output_tree(tx_type: StakeTxType) -> TxTree {
    match tx_type {
        StakeTxType::Regular => TxTree::Regular,
        _ => TxTree::Stake,
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TxIndex {
    blocks: BTreeMap<u32, BlockRecord>,
    heights: HashMap<BlockHash, u32>,
    mined: HashMap<TxHash, MinedTx>,
    unmined: HashMap<TxHash, TxRecord>,
    credits: BTreeMap<OutPoint, Credit>,
    /// Every outpoint spent by a recorded transaction.
    spends: HashMap<OutPoint, (TxHash, u32)>,
    multisig_outs: BTreeMap<OutPoint, MultisigOut>,
    tx_scripts: HashMap<[u8; 20], Vec<u8>>,
    processed_marker: Option<BlockHash>,
}

impl TxIndex {
    // Main chain

    pub fn main_chain_tip(&self) -> Option<ChainTip> {
        self.blocks.last_key_value().map(|(height, block)| ChainTip {
            hash: block.meta.hash,
            height: *height,
        })
    }

    /// Tip height, zero for an empty chain.
    pub fn tip_height(&self) -> u32 {
        self.main_chain_tip().map(|tip| tip.height).unwrap_or(0)
    }

    /// Appends a block to the main chain.
    ///
    /// The block must link to the current tip. A block already on the main
    /// chain is reported as [`StorageError::Duplicate`].
    pub fn extend_main_chain(&mut self, header: &BlockHeaderData) -> StorageResult<BlockMeta> {
        let hash = header.block_hash;
        if self.heights.contains_key(&hash) {
            return Err(StorageError::Duplicate(format!("block {hash} is already on the main chain")));
        }
        let decoded = header
            .raw_header
            .decode()
            .map_err(|e| StorageError::Corruption(format!("header of block {hash}: {e}")))?;

        let tip = self.main_chain_tip();
        if let Some(tip) = tip {
            if decoded.prev_block != tip.hash {
                return Err(StorageError::MissingParent {
                    block: hash,
                    tip: tip.hash,
                });
            }
            if decoded.height != tip.height + 1 {
                return Err(StorageError::Corruption(format!(
                    "block {hash} claims height {} on top of tip height {}",
                    decoded.height, tip.height
                )));
            }
        }

        let meta = BlockMeta {
            hash,
            height: decoded.height,
            time: decoded.timestamp as i64,
            vote_bits: decoded.vote_bits,
        };
        self.blocks.insert(
            decoded.height,
            BlockRecord {
                header: *header,
                meta,
                transactions: Vec::new(),
            },
        );
        self.heights.insert(hash, decoded.height);

        // The marker follows the tip while nothing is left unprocessed.
        let follows_tip = match (self.processed_marker, tip) {
            (None, None) => true,
            (Some(marker), Some(tip)) => marker == tip.hash,
            _ => false,
        };
        if follows_tip {
            self.processed_marker = Some(hash);
        }

        Ok(meta)
    }

    pub fn contains_block(&self, hash: &BlockHash) -> bool {
        self.heights.contains_key(hash)
    }

    pub fn block_hash_at(&self, height: u32) -> StorageResult<BlockHash> {
        self.blocks
            .get(&height)
            .map(|block| block.meta.hash)
            .ok_or_else(|| StorageError::NotFound(format!("no main chain block at height {height}")))
    }

    fn block(&self, hash: &BlockHash) -> StorageResult<&BlockRecord> {
        self.heights
            .get(hash)
            .and_then(|height| self.blocks.get(height))
            .ok_or_else(|| StorageError::NotFound(format!("block {hash} is not on the main chain")))
    }

    pub fn block_meta(&self, hash: &BlockHash) -> StorageResult<BlockMeta> {
        self.block(hash).map(|block| block.meta)
    }

    pub fn block_header(&self, hash: &BlockHash) -> StorageResult<BlockHeaderData> {
        self.block(hash).map(|block| block.header)
    }

    /// Up to `max` main chain hashes starting at `from`, which is included
    /// only when `inclusive` is set.
    pub fn main_chain_hashes(
        &self,
        from: &BlockHash,
        inclusive: bool,
        max: usize,
    ) -> StorageResult<Vec<BlockHash>> {
        let height = self.block(from)?.meta.height;
        let start = if inclusive {
            height
        } else {
            height + 1
        };
        Ok(self.blocks.range(start..).take(max).map(|(_, block)| block.meta.hash).collect())
    }

    /// Transactions recorded as mined in `block`.
    pub fn block_transactions(&self, block: &BlockHash) -> StorageResult<&[TxHash]> {
        self.block(block).map(|b| b.transactions.as_slice())
    }

    // Processed-transactions marker

    pub fn processed_marker(&self) -> Option<BlockHash> {
        self.processed_marker
    }

    /// Moves the marker to `hash` unless it already points at a later block.
    pub fn advance_processed_marker(&mut self, hash: &BlockHash) -> StorageResult<()> {
        let height = self.block(hash)?.meta.height;
        let current = self.processed_marker.and_then(|m| self.heights.get(&m).copied());
        if current.is_none_or(|current| current < height) {
            self.processed_marker = Some(*hash);
        }
        Ok(())
    }

    /// Sets the marker unconditionally.
    pub fn set_processed_marker(&mut self, hash: &BlockHash) -> StorageResult<()> {
        self.block(hash)?;
        self.processed_marker = Some(*hash);
        Ok(())
    }

    /// First main chain block whose transactions have not been processed,
    /// `None` when the marker is at the tip.
    pub fn rescan_point(&self) -> Option<BlockHash> {
        let next_height = match self.processed_marker.and_then(|m| self.heights.get(&m)) {
            Some(height) => height + 1,
            None => *self.blocks.first_key_value()?.0,
        };
        self.blocks.get(&next_height).map(|block| block.meta.hash)
    }

    // Transactions

    pub fn record(&self, hash: &TxHash) -> Option<&TxRecord> {
        self.mined.get(hash).map(|m| &m.rec).or_else(|| self.unmined.get(hash))
    }

    pub fn tx(&self, hash: &TxHash) -> Option<&Transaction> {
        self.record(hash).map(|rec| &rec.tx)
    }

    pub fn is_mined(&self, hash: &TxHash) -> bool {
        self.mined.contains_key(hash)
    }

    pub fn is_unmined(&self, hash: &TxHash) -> bool {
        self.unmined.contains_key(hash)
    }

    /// Block a mined transaction was recorded in.
    pub fn mined_block(&self, hash: &TxHash) -> Option<BlockMeta> {
        let mined = self.mined.get(hash)?;
        self.block(&mined.block).ok().map(|b| b.meta)
    }

    pub fn unmined_hashes(&self) -> Vec<TxHash> {
        let mut hashes: Vec<_> = self.unmined.keys().copied().collect();
        hashes.sort();
        hashes
    }

    pub fn mined_count(&self) -> usize {
        self.mined.len()
    }

    /// A recorded ticket purchase is a ticket the wallet owns.
    pub fn own_ticket(&self, hash: &TxHash) -> bool {
        self.record(hash).is_some_and(|rec| rec.tx_type == StakeTxType::Ticket)
    }

    /// Inserts a transaction into the unmined pool.
    ///
    /// Inserting a transaction that is already mined is a
    /// [`StorageError::Duplicate`]; inserting an identical unmined
    /// transaction again is a no-op.
    pub fn insert_unmined(&mut self, rec: &TxRecord) -> StorageResult<()> {
        if self.mined.contains_key(&rec.hash) {
            return Err(StorageError::Duplicate(format!("transaction {} is already mined", rec.hash)));
        }
        if self.unmined.contains_key(&rec.hash) {
            return Ok(());
        }
        for (index, input) in rec.tx.inputs.iter().enumerate() {
            if !input.previous_output.is_null() {
                self.spends.entry(input.previous_output).or_insert((rec.hash, index as u32));
            }
        }
        self.unmined.insert(rec.hash, rec.clone());
        Ok(())
    }

    /// Records a transaction as mined in `block`, moving it out of the
    /// unmined pool and evicting unmined double spends.
    pub fn insert_mined(&mut self, rec: &TxRecord, block: &BlockHash) -> StorageResult<()> {
        let height = *self
            .heights
            .get(block)
            .ok_or_else(|| StorageError::NotFound(format!("block {block} is not on the main chain")))?;

        if let Some(existing) = self.mined.get(&rec.hash) {
            if existing.block == *block {
                return Ok(());
            }
            return Err(StorageError::Duplicate(format!(
                "transaction {} is already mined in block {}",
                rec.hash, existing.block
            )));
        }

        let mut rec = rec.clone();
        if let Some(previous) = self.unmined.remove(&rec.hash) {
            rec.received = previous.received;
        }

        for input in &rec.tx.inputs {
            if input.previous_output.is_null() {
                continue;
            }
            if let Some((spender, _)) = self.spends.get(&input.previous_output).copied() {
                if spender != rec.hash && self.unmined.contains_key(&spender) {
                    tracing::debug!(
                        "Removing unmined double spend {} of {} (mined in {})",
                        spender,
                        input.previous_output,
                        rec.hash
                    );
                    self.remove_unmined_recursive(&spender);
                }
            }
        }

        for (index, input) in rec.tx.inputs.iter().enumerate() {
            if !input.previous_output.is_null() {
                self.spends.insert(input.previous_output, (rec.hash, index as u32));
            }
        }

        if let Some(block_record) = self.blocks.get_mut(&height) {
            block_record.transactions.push(rec.hash);
        }
        self.mined.insert(
            rec.hash,
            MinedTx {
                rec,
                block: *block,
            },
        );
        Ok(())
    }

    fn unindex_spends(&mut self, rec: &TxRecord) {
        for input in &rec.tx.inputs {
            if self.spends.get(&input.previous_output).is_some_and(|(h, _)| *h == rec.hash) {
                self.spends.remove(&input.previous_output);
            }
            if let Some(mso) = self.multisig_outs.get_mut(&input.previous_output) {
                if mso.spent_by.is_some_and(|(h, _)| h == rec.hash) {
                    mso.spent_by = None;
                }
            }
        }
    }

    /// Drops every output of `rec` and returns the unmined transactions that
    /// spent them.
    fn drop_outputs(&mut self, rec: &TxRecord) -> Vec<TxHash> {
        let tree = output_tree(rec.tx_type);
        let mut dependents = Vec::new();
        for index in 0..rec.tx.outputs.len() as u32 {
            let outpoint = OutPoint::new(rec.hash, index, tree);
            self.credits.remove(&outpoint);
            self.multisig_outs.remove(&outpoint);
            if let Some((spender, _)) = self.spends.get(&outpoint) {
                if self.unmined.contains_key(spender) {
                    dependents.push(*spender);
                }
            }
        }
        dependents
    }

    /// Removes an unmined transaction and everything spending its outputs.
    fn remove_unmined_recursive(&mut self, hash: &TxHash) -> Vec<TxHash> {
        let mut removed = Vec::new();
        let mut pending = vec![*hash];
        while let Some(next) = pending.pop() {
            let Some(rec) = self.unmined.remove(&next) else {
                continue;
            };
            self.unindex_spends(&rec);
            pending.extend(self.drop_outputs(&rec));
            removed.push(next);
        }
        removed
    }

    /// Adds a credit for output `index` of a recorded transaction.
    ///
    /// Returns false when the credit already exists.
    pub fn add_credit(
        &mut self,
        rec: &TxRecord,
        index: u32,
        internal: bool,
        account: u32,
    ) -> StorageResult<bool> {
        let output = rec.tx.outputs.get(index as usize).ok_or_else(|| {
            StorageError::NotFound(format!("transaction {} has no output {index}", rec.hash))
        })?;
        if self.record(&rec.hash).is_none() {
            return Err(StorageError::NotFound(format!(
                "credit for unrecorded transaction {}",
                rec.hash
            )));
        }
        let outpoint = OutPoint::new(rec.hash, index, output_tree(rec.tx_type));
        if self.credits.contains_key(&outpoint) {
            return Ok(false);
        }
        self.credits.insert(
            outpoint,
            Credit {
                outpoint,
                amount: output.value,
                pk_script: output.pk_script.clone(),
                account,
                internal,
                tx_type: rec.tx_type,
                coinbase: rec.tx.is_coinbase(),
            },
        );
        Ok(true)
    }

    pub fn credit(&self, outpoint: &OutPoint) -> Option<&Credit> {
        self.credits.get(outpoint)
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spends.contains_key(outpoint)
    }

    /// Transaction spending `outpoint`, if one is recorded.
    pub fn spender(&self, outpoint: &OutPoint) -> Option<(TxHash, u32)> {
        self.spends.get(outpoint).copied()
    }

    pub fn unspent_outputs(&self) -> Vec<UnspentOutput> {
        self.credits
            .values()
            .filter(|credit| !self.spends.contains_key(&credit.outpoint))
            .map(|credit| UnspentOutput {
                credit: credit.clone(),
                height: self.mined_block(&credit.outpoint.hash).map(|meta| meta.height),
            })
            .collect()
    }

    /// Balances at the current tip.
    pub fn balances(&self, min_conf: u32, coinbase_maturity: u32) -> Balances {
        let tip = self.tip_height();
        let mut balances = Balances::default();
        for utxo in self.unspent_outputs() {
            let amount = utxo.credit.amount;
            let confirmations = utxo.height.map(|h| tip.saturating_sub(h) + 1).unwrap_or(0);
            let generated = utxo.credit.coinbase
                || matches!(utxo.credit.tx_type, StakeTxType::Vote | StakeTxType::Revocation);

            balances.total += amount;
            if utxo.credit.tx_type == StakeTxType::Ticket && utxo.credit.outpoint.index == 0 {
                balances.locked_by_tickets += amount;
            } else if confirmations == 0 {
                balances.unconfirmed += amount;
            } else if generated && confirmations < coinbase_maturity {
                balances.immature += amount;
            } else if confirmations >= min_conf {
                balances.spendable += amount;
            } else {
                balances.unconfirmed += amount;
            }
        }
        balances
    }

    // Multisig outputs and redeem scripts

    /// Stores a redeem script seen in a transaction, keyed by its hash.
    pub fn insert_tx_script(&mut self, redeem_script: &[u8]) -> [u8; 20] {
        let hash = script::script_hash(redeem_script);
        self.tx_scripts.entry(hash).or_insert_with(|| redeem_script.to_vec());
        hash
    }

    pub fn tx_script(&self, script_hash: &[u8; 20]) -> Option<&[u8]> {
        self.tx_scripts.get(script_hash).map(Vec::as_slice)
    }

    /// Tracks output `index` of `rec`, which pays to the hash of the multisig
    /// `redeem_script`.
    pub fn add_multisig_out(
        &mut self,
        rec: &TxRecord,
        index: u32,
        redeem_script: &[u8],
        network: Network,
    ) -> StorageResult<()> {
        let output = rec.tx.outputs.get(index as usize).ok_or_else(|| {
            StorageError::NotFound(format!("transaction {} has no output {index}", rec.hash))
        })?;
        let extracted = script::extract_addresses(redeem_script, network)
            .map_err(|e| StorageError::Corruption(format!("redeem script: {e}")))?;
        if extracted.class != ScriptClass::MultiSig {
            return Err(StorageError::InvalidTransition(format!(
                "redeem script for {}:{index} is not multisig",
                rec.hash
            )));
        }
        let outpoint = OutPoint::new(rec.hash, index, output_tree(rec.tx_type));
        if self.multisig_outs.contains_key(&outpoint) {
            return Err(StorageError::Duplicate(format!("multisig output {outpoint}")));
        }
        let script_hash = self.insert_tx_script(redeem_script);
        self.multisig_outs.insert(
            outpoint,
            MultisigOut {
                outpoint,
                script_hash,
                required: extracted.required_sigs as u8,
                total: extracted.addresses.len() as u8,
                amount: output.value,
                spent_by: self.spends.get(&outpoint).copied(),
            },
        );
        Ok(())
    }

    pub fn multisig_output(&self, outpoint: &OutPoint) -> Option<&MultisigOut> {
        self.multisig_outs.get(outpoint)
    }

    pub fn spend_multisig_out(
        &mut self,
        outpoint: &OutPoint,
        spender: TxHash,
        input_index: u32,
    ) -> StorageResult<()> {
        let mso = self
            .multisig_outs
            .get_mut(outpoint)
            .ok_or_else(|| StorageError::NotFound(format!("multisig output {outpoint}")))?;
        mso.spent_by = Some((spender, input_index));
        Ok(())
    }

    // Rollback and pruning

    /// Removes every main chain block at or above `fork_height`.
    ///
    /// Coinbase and vote transactions of removed blocks are deleted along
    /// with their spenders; other transactions return to the unmined pool.
    /// Returns the removed block hashes in ascending height order.
    pub fn rollback(&mut self, fork_height: u32) -> Vec<BlockHash> {
        let heights: Vec<u32> = self.blocks.range(fork_height..).map(|(h, _)| *h).collect();
        let mut detached = Vec::with_capacity(heights.len());

        for height in heights.into_iter().rev() {
            let Some(block) = self.blocks.remove(&height) else {
                continue;
            };
            self.heights.remove(&block.meta.hash);

            for tx_hash in block.transactions.iter().rev() {
                let Some(mined) = self.mined.remove(tx_hash) else {
                    continue;
                };
                let rec = mined.rec;
                if rec.tx.is_coinbase() || rec.tx_type == StakeTxType::Vote {
                    self.unindex_spends(&rec);
                    for dependent in self.drop_outputs(&rec) {
                        self.remove_unmined_recursive(&dependent);
                    }
                } else {
                    self.unmined.insert(rec.hash, rec);
                }
            }
            detached.push(block.meta.hash);
        }
        detached.reverse();

        if self.processed_marker.is_some_and(|m| !self.heights.contains_key(&m)) {
            self.processed_marker = self.main_chain_tip().map(|tip| tip.hash);
        }

        detached
    }

    /// Removes expired unmined transactions and unmined tickets paying less
    /// than the stake difficulty `sbits`. Returns the removed hashes.
    pub fn prune_unmined(&mut self, tip_height: u32, sbits: i64) -> Vec<TxHash> {
        let stale: Vec<TxHash> = self
            .unmined
            .values()
            .filter(|rec| {
                let expired = rec.tx.expiry != 0 && rec.tx.expiry <= tip_height;
                let underpaid_ticket = rec.tx_type == StakeTxType::Ticket
                    && rec.tx.outputs.first().is_some_and(|out| out.value < sbits);
                expired || underpaid_ticket
            })
            .map(|rec| rec.hash)
            .collect();

        let mut pruned = Vec::new();
        for hash in stale {
            pruned.extend(self.remove_unmined_recursive(&hash));
        }
        pruned
    }
}
