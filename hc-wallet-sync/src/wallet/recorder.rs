//! Applies a relevant transaction to the ledger.

use hc_wire::script::{self, ScriptClass};
use hc_wire::stake::{self, spent_ticket};
use hc_wire::{Address, AddressKind, StakeTxType};

use super::{Wallet, WalletTxn, classify};
use crate::error::{Result, StorageError};
use crate::types::{BlockMeta, PoolTicket, PoolTicketStatus, TxNotification, TxRecord};

impl Wallet {
    /// Records a relevant transaction the node accepted into its mempool.
    pub async fn accept_relevant_transaction(&self, serialized: &[u8]) -> Result<()> {
        self.update(|txn| self.process_serialized_transaction(txn, serialized, None)).await
    }

    /// Parses and records a serialized transaction, mined in `block` when
    /// one is given.
    pub(crate) fn process_serialized_transaction(
        &self,
        txn: &mut WalletTxn<'_>,
        serialized: &[u8],
        block: Option<&BlockMeta>,
    ) -> Result<()> {
        let rec = TxRecord::now(serialized)?;
        self.process_transaction_record(txn, &rec, block)
    }

    /// Records `rec` if it is relevant to the wallet.
    ///
    /// Store failures abort the enclosing update. Failures confined to one
    /// record class (a stake-pool bookkeeping update, an unparseable stake
    /// output) are logged and the remaining classes are still recorded.
    pub(crate) fn process_transaction_record(
        &self,
        txn: &mut WalletTxn<'_>,
        rec: &TxRecord,
        block: Option<&BlockMeta>,
    ) -> Result<()> {
        let classification = classify(&rec.tx, &*txn.state, self.config.network);
        self.note_classification_warnings(&rec.hash, classification.warnings);
        if !classification.relevant {
            return Ok(());
        }

        match block {
            None => match txn.state.tx.insert_unmined(rec) {
                Ok(()) => {}
                Err(StorageError::Duplicate(_)) => {
                    tracing::warn!(
                        "Refusing to add unmined transaction {} since same transaction already exists mined",
                        rec.hash
                    );
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            },
            Some(block) => txn.state.tx.insert_mined(rec, &block.hash)?,
        }

        match (rec.tx_type, block) {
            (StakeTxType::Ticket, _) => self.record_ticket_purchase(txn, rec, block),
            (StakeTxType::Vote, Some(block)) => self.record_vote(txn, rec, block),
            (StakeTxType::Revocation, Some(block)) => self.record_revocation(txn, rec, block),
            _ => {}
        }

        self.record_multisig_redemptions(txn, rec)?;
        self.record_credits(txn, rec)?;

        txn.outbox.transactions.push(match block {
            None => TxNotification::Unmined {
                hash: rec.hash,
                tx_type: rec.tx_type,
            },
            Some(block) => TxNotification::Mined {
                hash: rec.hash,
                tx_type: rec.tx_type,
                block: *block,
            },
        });
        Ok(())
    }

    /// Stores a ticket purchase whose submission output pays a wallet
    /// address. In stake-pool mode a ticket is only accepted once mined and
    /// after its pool fee commitment has been checked.
    fn record_ticket_purchase(&self, txn: &mut WalletTxn<'_>, rec: &TxRecord, block: Option<&BlockMeta>) {
        let network = self.config.network;
        let Some(submission) = rec.tx.outputs.first() else {
            return;
        };
        let addresses = match script::extract_addresses(&submission.pk_script, network) {
            Ok(extracted) => extracted.addresses,
            Err(_) => return,
        };

        let mut insert = None;
        for address in addresses {
            if !txn.state.addr.contains(&address) {
                continue;
            }
            if !self.config.stake_pool_enabled {
                insert = Some(address);
                break;
            }
            let Some(block) = block else {
                break;
            };

            match self.evaluate_stake_pool_ticket(rec, block.height) {
                Ok(true) => {
                    let ticket = PoolTicket {
                        ticket: rec.hash,
                        height_ticket: block.height,
                        status: PoolTicketStatus::ImmatureOrLive,
                        spent_by: None,
                        height_spent: 0,
                    };
                    if let Err(e) = txn.state.stake.update_pool_user_tickets(address, ticket) {
                        tracing::warn!("Failed to insert stake pool user ticket: {}", e);
                    }
                    tracing::debug!(
                        "Inserted stake pool ticket {} for user {} into the stake store",
                        rec.hash,
                        address
                    );
                    insert = Some(address);
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Ticket {} failed ticket evaluation for the stake pool: {}", rec.hash, e)
                }
            }
            txn.state.stake.update_pool_user_invalid_tickets(address, rec.hash);
        }

        if let Some(address) = insert {
            txn.state.stake.insert_sstx(&rec.tx, Some(address));
            tracing::debug!("Recorded owned ticket {}", rec.hash);
        }
    }

    fn record_vote(&self, txn: &mut WalletTxn<'_>, rec: &TxRecord, block: &BlockMeta) {
        let Some(ticket_in) = rec.tx.inputs.get(1) else {
            return;
        };
        let ticket = ticket_in.previous_output.hash;

        if txn.state.tx.own_ticket(&ticket) || txn.state.stake.own_ticket(&ticket) {
            match stake::ssgen_vote_bits(&rec.tx) {
                Ok(vote_bits) => {
                    txn.state.stake.insert_ssgen(block.hash, block.height, rec.hash, vote_bits, ticket)
                }
                Err(e) => tracing::error!("Vote {} carries unreadable vote bits: {}", rec.hash, e),
            }
        }

        if self.config.stake_pool_enabled {
            self.update_pool_ticket(txn, rec, block, ticket_in.block_height, PoolTicketStatus::Voted);
        }
    }

    fn record_revocation(&self, txn: &mut WalletTxn<'_>, rec: &TxRecord, block: &BlockMeta) {
        let Some(ticket_in) = rec.tx.inputs.first() else {
            return;
        };
        let ticket = ticket_in.previous_output.hash;

        if txn.state.tx.own_ticket(&ticket) || txn.state.stake.own_ticket(&ticket) {
            txn.state.stake.store_revocation_info(ticket, rec.hash, Some((block.hash, block.height)), None);
        }

        if self.config.stake_pool_enabled {
            self.update_pool_ticket(txn, rec, block, ticket_in.block_height, PoolTicketStatus::Missed);
        }
    }

    /// Moves the pool ticket spent by a vote or revocation to `status`.
    fn update_pool_ticket(
        &self,
        txn: &mut WalletTxn<'_>,
        rec: &TxRecord,
        block: &BlockMeta,
        height_ticket: u32,
        status: PoolTicketStatus,
    ) {
        let Some(ticket) = spent_ticket(&rec.tx).map(|outpoint| outpoint.hash) else {
            return;
        };
        let user = match txn.state.stake.sstx_address(&ticket) {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!("Failed to fetch stake pool user for {} ticket {}: {}", status, ticket, e);
                return;
            }
        };

        let update = PoolTicket {
            ticket,
            height_ticket,
            status,
            spent_by: Some(rec.hash),
            height_spent: block.height,
        };
        match txn.state.stake.update_pool_user_tickets(user, update) {
            Ok(()) => tracing::debug!(
                "Updated {} stake pool ticket {} for user {} (spent by {})",
                status,
                ticket,
                user,
                rec.hash
            ),
            Err(e) => tracing::warn!("Failed to update stake pool ticket for user {}: {}", user, e),
        }
    }

    /// Handles inputs redeeming multisig scripts with a wallet key.
    fn record_multisig_redemptions(&self, txn: &mut WalletTxn<'_>, rec: &TxRecord) -> Result<()> {
        let network = self.config.network;
        for (index, input) in rec.tx.inputs.iter().enumerate() {
            if !script::is_multisig_sig_script(&input.signature_script) {
                continue;
            }
            let redeem_script = script::multisig_redeem_script_from_sig_script(&input.signature_script)?;
            let extracted = match script::extract_addresses(&redeem_script, network) {
                Ok(extracted) if extracted.class == ScriptClass::MultiSig => extracted,
                _ => continue,
            };

            let mut relevant = false;
            for address in &extracted.addresses {
                match txn.state.addr.mark_used(address) {
                    Ok(_) => {
                        relevant = true;
                        tracing::debug!("Marked address {} used", address);
                    }
                    Err(StorageError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            if relevant {
                txn.state.tx.insert_tx_script(&redeem_script);
                match txn.state.addr.import_script(&redeem_script, network) {
                    Ok(address) => txn.outbox.filter_addresses.push(address),
                    Err(StorageError::Duplicate(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            // Absent during a rescan that has not reached the output yet.
            if txn.state.tx.multisig_output(&input.previous_output).is_some() {
                txn.state.tx.spend_multisig_out(&input.previous_output, rec.hash, index as u32)?;
            }
        }
        Ok(())
    }

    /// Adds a credit for each output paying a wallet address, and tracks
    /// pay-to-script-hash multisig outputs with a wallet key.
    fn record_credits(&self, txn: &mut WalletTxn<'_>, rec: &TxRecord) -> Result<()> {
        let network = self.config.network;
        for (index, output) in rec.tx.outputs.iter().enumerate() {
            if output.value == 0 {
                continue;
            }
            let Ok(extracted) = script::extract_addresses(&output.pk_script, network) else {
                continue;
            };
            let mut class = extracted.class;
            if class.is_stake() {
                class = match script::stake_out_subclass(&output.pk_script) {
                    Ok(subclass) => subclass,
                    Err(e) => {
                        tracing::error!("Unknown stake output subclass parse error encountered: {}", e);
                        continue;
                    }
                };
            }

            for address in &extracted.addresses {
                let (internal, account) = match txn.state.addr.address(address) {
                    Ok(managed) => (managed.internal, managed.account),
                    Err(StorageError::NotFound(_)) => continue,
                    Err(e) => return Err(e.into()),
                };
                txn.state.tx.add_credit(rec, index as u32, internal, account)?;
                txn.state.addr.mark_used(address)?;
                tracing::debug!("Marked address {} used", address);
            }

            if class == ScriptClass::ScriptHash {
                self.record_multisig_output(txn, rec, index as u32, &extracted.addresses);
            }
        }
        Ok(())
    }

    fn record_multisig_output(&self, txn: &mut WalletTxn<'_>, rec: &TxRecord, index: u32, addresses: &[Address]) {
        let network = self.config.network;
        for address in addresses.iter().filter(|a| a.kind() == AddressKind::ScriptHash) {
            let hash = address.hash160();
            let Some(redeem_script) = txn
                .state
                .tx
                .tx_script(hash)
                .or_else(|| txn.state.addr.redeem_script(hash))
                .map(<[u8]>::to_vec)
            else {
                tracing::debug!("No redeem script known for address {}", address);
                continue;
            };

            let Ok(keys) = script::extract_addresses(&redeem_script, network) else {
                continue;
            };
            if keys.class != ScriptClass::MultiSig {
                continue;
            }
            if keys.addresses.iter().any(|key| txn.state.addr.contains(key)) {
                if let Err(e) = txn.state.tx.add_multisig_out(rec, index, &redeem_script, network) {
                    tracing::debug!("Unable to add multisignature output: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::WalletConfig;
    use crate::storage::LedgerStore;
    use crate::test_utils::{ChainBuilder, pay_to, pubkey, ticket_purchase, vote_for};
    use hc_wire::{BlockHash, Network, OutPoint, Transaction, TxHash, TxIn, TxOut, TxTree};

    const NET: Network = Network::Simnet;

    fn addr(fill: u8) -> Address {
        Address::p2pkh([fill; 20], NET)
    }

    async fn wallet_with(config: WalletConfig, owned: &[Address]) -> Arc<Wallet> {
        let wallet = Wallet::new(config, LedgerStore::in_memory()).unwrap();
        for (i, address) in owned.iter().enumerate() {
            wallet.import_address(*address, 0, false, i as u32).await.unwrap();
        }
        Arc::new(wallet)
    }

    async fn connect(wallet: &Wallet, chain: &mut ChainBuilder, txs: &[Transaction]) -> BlockMeta {
        let header = chain.next_block();
        let serialized: Vec<Vec<u8>> = txs.iter().map(Transaction::to_bytes).collect();
        wallet.on_block_connected(&header, &serialized).await.unwrap();
        wallet.ledger().snapshot().unwrap().tx.block_meta(&header.block_hash).unwrap()
    }

    #[tokio::test]
    async fn test_irrelevant_transaction_is_not_recorded() {
        let wallet = wallet_with(WalletConfig::simnet(), &[addr(1)]).await;
        let tx = pay_to(&addr(9), 100);
        wallet.accept_relevant_transaction(&tx.to_bytes()).await.unwrap();
        assert!(wallet.ledger().snapshot().unwrap().tx.record(&tx.tx_hash()).is_none());
    }

    #[tokio::test]
    async fn test_unmined_after_mined_is_ignored() {
        let wallet = wallet_with(WalletConfig::simnet(), &[addr(1)]).await;
        let mut chain = ChainBuilder::new();
        let tx = pay_to(&addr(1), 100);
        connect(&wallet, &mut chain, std::slice::from_ref(&tx)).await;

        let mut rx = wallet.subscribe_transactions();
        wallet.accept_relevant_transaction(&tx.to_bytes()).await.unwrap();
        let snapshot = wallet.ledger().snapshot().unwrap();
        assert!(snapshot.tx.is_mined(&tx.tx_hash()));
        assert!(!snapshot.tx.is_unmined(&tx.tx_hash()));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_credit_marks_address_used() {
        let wallet = wallet_with(WalletConfig::simnet(), &[addr(1)]).await;
        let mut rx = wallet.subscribe_transactions();
        let tx = pay_to(&addr(1), 700);
        wallet.accept_relevant_transaction(&tx.to_bytes()).await.unwrap();

        let snapshot = wallet.ledger().snapshot().unwrap();
        assert!(snapshot.addr.address(&addr(1)).unwrap().used);
        assert_eq!(snapshot.tx.unspent_outputs()[0].credit.amount, 700);
        assert_eq!(
            rx.try_recv(),
            Some(TxNotification::Unmined {
                hash: tx.tx_hash(),
                tx_type: StakeTxType::Regular
            })
        );
    }

    #[tokio::test]
    async fn test_owned_ticket_and_its_vote() {
        let voting = addr(3);
        let wallet = wallet_with(WalletConfig::simnet(), &[voting]).await;
        let mut chain = ChainBuilder::new();

        let ticket = ticket_purchase(&voting, &addr(4), 1_000, 50);
        connect(&wallet, &mut chain, std::slice::from_ref(&ticket)).await;
        assert!(wallet.ledger().snapshot().unwrap().stake.own_ticket(&ticket.tx_hash()));

        let vote = vote_for(&ticket, &voting, BlockHash::hash(b"voted"), 2, 0x0005);
        let meta = connect(&wallet, &mut chain, std::slice::from_ref(&vote)).await;

        let snapshot = wallet.ledger().snapshot().unwrap();
        let record = snapshot.stake.vote(&ticket.tx_hash()).unwrap();
        assert_eq!(record.vote, vote.tx_hash());
        assert_eq!(record.vote_bits, 0x0005);
        assert_eq!(record.block, Some((meta.hash, meta.height)));
    }

    #[tokio::test]
    async fn test_foreign_vote_is_not_recorded_as_stake() {
        let voting = addr(3);
        let wallet = wallet_with(WalletConfig::simnet(), &[voting]).await;
        let mut chain = ChainBuilder::new();

        let foreign = ticket_purchase(&addr(8), &addr(8), 1_000, 50);
        let vote = vote_for(&foreign, &voting, BlockHash::hash(b"voted"), 2, 1);
        connect(&wallet, &mut chain, std::slice::from_ref(&vote)).await;

        let snapshot = wallet.ledger().snapshot().unwrap();
        assert!(snapshot.tx.is_mined(&vote.tx_hash()));
        assert!(snapshot.stake.vote(&foreign.tx_hash()).is_none());
    }

    #[tokio::test]
    async fn test_multisig_redemption_imports_script() {
        let ours = pubkey(0x11);
        let theirs = pubkey(0x22);
        let our_address = Address::from_pubkey(&ours, NET);
        let wallet = wallet_with(WalletConfig::simnet(), &[our_address]).await;
        let mut chain = ChainBuilder::new();

        let redeem = script::multisig(1, &[&ours[..], &theirs[..]]);
        let p2sh = Address::from_redeem_script(&redeem, NET);

        let mut funding = Transaction::new();
        funding.inputs.push(TxIn::new(OutPoint::new(TxHash::hash(b"f"), 0, TxTree::Regular)));
        funding.outputs.push(TxOut::new(900, p2sh.script_pubkey()));

        let mut spend = Transaction::new();
        let mut input = TxIn::new(OutPoint::new(funding.tx_hash(), 0, TxTree::Regular));
        input.signature_script = script::multisig_sig_script(&[&[0x30; 71][..]], &redeem);
        spend.inputs.push(input);
        spend.outputs.push(TxOut::new(800, addr(9).script_pubkey()));

        connect(&wallet, &mut chain, std::slice::from_ref(&spend)).await;
        let snapshot = wallet.ledger().snapshot().unwrap();
        assert!(snapshot.addr.contains(&p2sh));
        assert_eq!(snapshot.tx.tx_script(p2sh.hash160()), Some(redeem.as_slice()));

        // The funding output is now recognised as a wallet multisig output.
        connect(&wallet, &mut chain, std::slice::from_ref(&funding)).await;
        let snapshot = wallet.ledger().snapshot().unwrap();
        let mso = snapshot
            .tx
            .multisig_output(&OutPoint::new(funding.tx_hash(), 0, TxTree::Regular))
            .unwrap();
        assert_eq!((mso.required, mso.total, mso.amount), (1, 2, 900));
    }

    #[tokio::test]
    async fn test_malformed_script_counts_warning() {
        let wallet = wallet_with(WalletConfig::simnet(), &[addr(1)]).await;
        let mut tx = pay_to(&addr(1), 10);
        // A push running past the end of the script, ahead of the wallet output.
        tx.outputs.insert(0, TxOut::new(1, vec![0x4c, 0x10, 0x01]));
        wallet.accept_relevant_transaction(&tx.to_bytes()).await.unwrap();

        assert_eq!(wallet.classification_warnings(), 1);
        assert!(wallet.ledger().snapshot().unwrap().tx.is_unmined(&tx.tx_hash()));
    }
}
