//! Votes for winning tickets, revocations for missed ones, and instant
//! transaction votes.
//!
//! Only tickets the wallet owns are acted on. Each vote or revocation is
//! signed, handed to the node, and recorded as unmined only once the node
//! has accepted it.

use async_trait::async_trait;

use hc_wire::script::{self, opcodes::*};
use hc_wire::stake;
use hc_wire::{Address, BlockHash, ChainParams, Network, OutPoint, Transaction, TxHash, TxIn, TxOut, TxTree};

use super::{Wallet, txsizes};
use crate::error::{Result, VotingError, VotingResult};
use crate::rpc::InstantTxVote;
use crate::types::TxRecord;

/// Signs transactions and messages with wallet keys.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Fills the signature script of input `index`, which spends `ticket`.
    async fn sign_transaction(&self, tx: &mut Transaction, index: usize, ticket: &Transaction) -> VotingResult<()>;

    async fn sign_message(&self, address: &Address, message: &str) -> VotingResult<Vec<u8>>;

    /// Compressed public key behind a pay-to-pubkey-hash address.
    async fn pubkey_for_address(&self, address: &Address) -> VotingResult<Vec<u8>>;
}

/// Commitment addresses and amounts of a ticket purchase, in output order.
fn ticket_commitments(ticket: &Transaction, network: Network) -> VotingResult<(Vec<Address>, Vec<i64>)> {
    let mut addresses = Vec::new();
    let mut amounts = Vec::new();
    for output in ticket.outputs.iter().skip(1).step_by(2) {
        addresses.push(stake::commitment_address(&output.pk_script, network)?);
        amounts.push(stake::commitment_amount(&output.pk_script)?);
    }
    if addresses.is_empty() {
        return Err(VotingError::Construction("ticket has no commitments".into()));
    }
    Ok((addresses, amounts))
}

fn ticket_value(ticket: &Transaction) -> VotingResult<i64> {
    ticket
        .outputs
        .first()
        .map(|output| output.value)
        .ok_or_else(|| VotingError::Construction("ticket has no outputs".into()))
}

/// Builds an unsigned vote on `block_hash` spending `ticket_hash`.
pub(crate) fn create_unsigned_vote(
    ticket_hash: TxHash,
    ticket: &Transaction,
    height: u32,
    block_hash: &BlockHash,
    vote_bits: u16,
    params: &ChainParams,
    network: Network,
) -> VotingResult<Transaction> {
    let value = ticket_value(ticket)?;
    let subsidy = params.stake_vote_subsidy(height as i64);
    let (addresses, amounts) = ticket_commitments(ticket, network)?;
    let rewards = stake::calculate_rewards(&amounts, value, subsidy)?;

    let mut vote = Transaction::new();
    let mut stakebase = TxIn::new(OutPoint::null());
    stakebase.value_in = subsidy;
    vote.inputs.push(stakebase);
    let mut ticket_in = TxIn::new(OutPoint::new(ticket_hash, 0, TxTree::Stake));
    ticket_in.value_in = value;
    vote.inputs.push(ticket_in);

    vote.outputs.push(TxOut::new(0, stake::vote_block_ref_script(block_hash, height)));
    vote.outputs.push(TxOut::new(0, stake::vote_bits_script(vote_bits)));
    for (address, reward) in addresses.iter().zip(rewards) {
        vote.outputs.push(TxOut::new(reward, script::stake_tagged(OP_SSGEN, address)));
    }
    Ok(vote)
}

/// Builds an unsigned revocation of `ticket_hash`. The relay fee is taken
/// from the first output that stays above the dust limit after paying it.
pub(crate) fn create_unsigned_revocation(
    ticket_hash: TxHash,
    ticket: &Transaction,
    relay_fee: i64,
    network: Network,
) -> VotingResult<Transaction> {
    let value = ticket_value(ticket)?;
    let (addresses, amounts) = ticket_commitments(ticket, network)?;
    let refunds = stake::calculate_rewards(&amounts, value, 0)?;

    let mut revocation = Transaction::new();
    let mut ticket_in = TxIn::new(OutPoint::new(ticket_hash, 0, TxTree::Stake));
    ticket_in.value_in = value;
    revocation.inputs.push(ticket_in);
    for (address, refund) in addresses.iter().zip(refunds) {
        revocation.outputs.push(TxOut::new(refund, script::stake_tagged(OP_SSRTX, address)));
    }

    let size = txsizes::estimate_serialize_size(1, &revocation.outputs, false);
    let fee = txsizes::fee_for_serialize_size(relay_fee, size);
    for output in &mut revocation.outputs {
        if output.value > fee {
            let amount = output.value - fee;
            if !txsizes::is_dust_amount(amount, output.pk_script.len(), relay_fee) {
                output.value = amount;
                return Ok(revocation);
            }
        }
    }
    Err(VotingError::Construction("missing suitable revocation output to pay relay fee".into()))
}

impl Wallet {
    fn signer(&self) -> VotingResult<&dyn TransactionSigner> {
        self.signer.as_deref().ok_or(VotingError::NoSigner)
    }

    /// Owned tickets among `tickets` with their purchase transactions and
    /// voting authority. Unknown tickets are dropped silently.
    fn owned_ticket_purchases(&self, tickets: &[TxHash], purpose: &str) -> Result<Vec<(TxHash, Transaction)>> {
        let network = self.config.network;
        let snapshot = self.store.snapshot()?;
        let mut owned = Vec::new();
        for ticket in tickets {
            if !snapshot.tx.own_ticket(ticket) && !snapshot.stake.own_ticket(ticket) {
                continue;
            }
            let purchase = snapshot
                .tx
                .record(ticket)
                .filter(|rec| rec.tx_type == hc_wire::StakeTxType::Ticket)
                .map(|rec| rec.tx.clone())
                .or_else(|| snapshot.stake.ticket_purchase(ticket).cloned());
            let Some(purchase) = purchase else {
                tracing::error!("Failed to read ticket purchase transaction for {} ticket {}", purpose, ticket);
                continue;
            };
            if !snapshot.addr.has_voting_authority(&purchase, network) {
                tracing::debug!("No voting authority for {} ticket {}", purpose, ticket);
                continue;
            }
            owned.push((*ticket, purchase));
        }
        Ok(owned)
    }

    /// Votes on `block_hash` with every owned winning ticket.
    pub async fn handle_winning_tickets(&self, block_hash: BlockHash, height: u32, tickets: &[TxHash]) -> Result<()> {
        if !self.config.enable_voting || i64::from(height) < self.params.stake_validation_height - 1 {
            return Ok(());
        }
        let owned = self.owned_ticket_purchases(tickets, "winning")?;
        if owned.is_empty() {
            return Ok(());
        }
        let client = self.require_chain_client().await?;
        let signer = self.signer()?;
        let vote_bits = self.config.vote_bits;

        for (ticket, purchase) in owned {
            let mut vote = match create_unsigned_vote(
                ticket,
                &purchase,
                height,
                &block_hash,
                vote_bits,
                self.params,
                self.config.network,
            ) {
                Ok(vote) => vote,
                Err(e) => {
                    tracing::error!("Failed to create vote transaction for ticket hash {}: {}", ticket, e);
                    continue;
                }
            };
            if let Err(e) = signer.sign_transaction(&mut vote, 1, &purchase).await {
                tracing::error!("Failed to sign vote for ticket hash {}: {}", ticket, e);
                continue;
            }
            if !stake::is_ssgen(&vote) {
                tracing::error!("Vote for ticket {} is not a well-formed vote", ticket);
                continue;
            }

            let vote_hash = match client.send_raw_transaction(&vote, true).await {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::error!("Failed to send vote for ticket hash {}: {}", ticket, e);
                    continue;
                }
            };

            let rec = TxRecord::from_tx(vote, chrono::Utc::now().timestamp());
            let recorded = self
                .update(|txn| {
                    self.process_transaction_record(txn, &rec, None)?;
                    txn.state.stake.store_vote_info(ticket, &rec.tx, vote_bits);
                    Ok(())
                })
                .await;
            match recorded {
                Ok(()) => tracing::info!(
                    "Voted on block {} (height {}) using ticket {} (vote hash: {} bits: {})",
                    block_hash,
                    height,
                    ticket,
                    vote_hash,
                    vote_bits
                ),
                Err(e) => tracing::error!("Failed to record vote {} for ticket {}: {}", vote_hash, ticket, e),
            }
        }
        Ok(())
    }

    /// Revokes every owned ticket missed at `block_hash`.
    pub async fn handle_missed_tickets(&self, block_hash: BlockHash, height: u32, tickets: &[TxHash]) -> Result<()> {
        if i64::from(height) < self.params.stake_validation_height - 1 {
            return Ok(());
        }
        let owned = self.owned_ticket_purchases(tickets, "missed or expired")?;
        if owned.is_empty() {
            return Ok(());
        }
        let client = self.require_chain_client().await?;
        let signer = self.signer()?;

        for (ticket, purchase) in owned {
            let mut revocation =
                match create_unsigned_revocation(ticket, &purchase, self.config.relay_fee, self.config.network) {
                    Ok(revocation) => revocation,
                    Err(e) => {
                        tracing::error!("Failed to create revocation transaction for ticket hash {}: {}", ticket, e);
                        continue;
                    }
                };
            if let Err(e) = signer.sign_transaction(&mut revocation, 0, &purchase).await {
                tracing::error!("Failed to sign revocation for ticket hash {}: {}", ticket, e);
                continue;
            }

            let revocation_hash = match client.send_raw_transaction(&revocation, true).await {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::error!("Failed to send revocation for ticket hash {}: {}", ticket, e);
                    continue;
                }
            };

            let rec = TxRecord::from_tx(revocation, chrono::Utc::now().timestamp());
            let recorded = self
                .update(|txn| {
                    self.process_transaction_record(txn, &rec, None)?;
                    txn.state.stake.store_revocation_info(ticket, rec.hash, None, Some(rec.serialized.clone()));
                    Ok(())
                })
                .await;
            match recorded {
                Ok(()) => tracing::info!(
                    "Revoked ticket {} with revocation {} (missed at block {})",
                    ticket,
                    revocation_hash,
                    block_hash
                ),
                Err(e) => tracing::error!("Failed to record revocation {} for ticket {}: {}", revocation_hash, ticket, e),
            }
        }
        Ok(())
    }

    /// Handles an instant transaction locked by `tickets`.
    ///
    /// With `resend` set the transaction is re-broadcast and remembered
    /// until a connected block contains it. Otherwise each owned ticket
    /// casts a signed vote for it.
    pub async fn handle_new_instant_tx(&self, serialized: &[u8], tickets: &[TxHash], resend: bool) -> Result<()> {
        let instant_tx = Transaction::from_bytes(serialized)?;
        let instant_tx_hash = instant_tx.tx_hash();
        let owned = self.owned_ticket_purchases(tickets, "instant")?;
        if owned.is_empty() {
            return Ok(());
        }
        let client = self.require_chain_client().await?;

        if resend {
            client.send_raw_transaction(&instant_tx, self.config.allow_high_fees).await?;
            self.instant_txs.lock().await.insert(instant_tx_hash, instant_tx);
            tracing::debug!("Resent instant transaction {}", instant_tx_hash);
            return Ok(());
        }

        let signer = self.signer()?;
        for (ticket, purchase) in owned {
            let address = purchase
                .outputs
                .first()
                .and_then(|out| script::extract_addresses(&out.pk_script, self.config.network).ok())
                .and_then(|extracted| extracted.addresses.first().copied());
            let Some(address) = address else {
                tracing::error!("Failed to extract addrs for instant ticket {}", ticket);
                continue;
            };

            let message = InstantTxVote::signing_message(&instant_tx_hash, &ticket);
            let signed = async {
                let pubkey = signer.pubkey_for_address(&address).await?;
                let signature = signer.sign_message(&address, &message).await?;
                Ok::<_, VotingError>((pubkey, signature))
            }
            .await;
            let (pubkey, signature) = match signed {
                Ok(signed) => signed,
                Err(e) => {
                    tracing::error!("Failed to sign instant tx vote for ticket {}: {}", ticket, e);
                    continue;
                }
            };

            let vote = InstantTxVote {
                vote: true,
                ticket_hash: ticket,
                instant_tx_hash,
                pubkey,
                signature,
            };
            if let Err(e) = client.send_instant_tx_vote(&vote).await {
                tracing::error!("Failed to send instant tx vote for ticket {}: {}", ticket, e);
            }
        }
        Ok(())
    }

    pub fn handle_instant_tx_vote(&self, vote_hash: &TxHash, instant_tx_hash: &TxHash, ticket_hash: &TxHash) {
        tracing::debug!(
            "Instant tx vote {} for {} by ticket {}",
            vote_hash,
            instant_tx_hash,
            ticket_hash
        );
    }

    /// Instant transactions re-broadcast and not yet seen in a block.
    pub async fn pending_instant_txs(&self) -> usize {
        self.instant_txs.lock().await.len()
    }
}
