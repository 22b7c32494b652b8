//! Stake transaction predicates and ticket commitment parsing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{Address, AddressKind};
use crate::hash::BlockHash;
use crate::network::Network;
use crate::script::{self, ScriptClass, opcodes::*};
use crate::transaction::{OutPoint, Transaction, TxTree};

/// Length of a ticket commitment script: OP_RETURN, OP_DATA_30 and the push.
const COMMITMENT_SCRIPT_LEN: usize = 32;
/// Top bit of the committed amount marks a pay-to-script-hash commitment.
const COMMITMENT_P2SH_FLAG: u64 = 1 << 63;
/// Length of a vote's block reference script: OP_RETURN, OP_DATA_36 and the push.
const VOTE_BLOCK_REF_LEN: usize = 38;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StakeError {
    #[error("output script is not a ticket commitment")]
    NotCommitment,

    #[error("transaction is not a vote")]
    NotVote,

    #[error("malformed vote bits output")]
    MalformedVoteBits,

    #[error("ticket value must be positive, got {0}")]
    NonPositiveTicketValue(i64),
}

/// The stake role a transaction plays.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum StakeTxType {
    Regular,
    Ticket,
    Vote,
    Revocation,
}

fn is_commitment_script(script: &[u8]) -> bool {
    script.len() == COMMITMENT_SCRIPT_LEN && script[0] == OP_RETURN && script[1] == OP_DATA_30
}

/// Ticket purchase: a stake submission followed by commitment/change pairs.
pub fn is_sstx(tx: &Transaction) -> bool {
    if tx.inputs.is_empty() || tx.outputs.len() < 3 || tx.outputs.len() % 2 == 0 {
        return false;
    }
    if tx.inputs.iter().any(|i| i.previous_output.tree != TxTree::Regular) {
        return false;
    }
    if script::classify(&tx.outputs[0].pk_script) != ScriptClass::StakeSubmission {
        return false;
    }
    tx.outputs.iter().enumerate().skip(1).all(|(i, out)| {
        if i % 2 == 1 {
            is_commitment_script(&out.pk_script)
        } else {
            script::classify(&out.pk_script) == ScriptClass::StakeSubChange
        }
    })
}

/// Vote: stakebase plus ticket input, block reference, vote bits, payouts.
pub fn is_ssgen(tx: &Transaction) -> bool {
    if tx.inputs.len() != 2 || tx.outputs.len() < 3 {
        return false;
    }
    if !tx.inputs[0].previous_output.is_null() || tx.inputs[1].previous_output.tree != TxTree::Stake
    {
        return false;
    }
    let block_ref = &tx.outputs[0].pk_script;
    if block_ref.len() != VOTE_BLOCK_REF_LEN || block_ref[0] != OP_RETURN || block_ref[1] != OP_DATA_36
    {
        return false;
    }
    if vote_bits_push(&tx.outputs[1].pk_script).is_none() {
        return false;
    }
    tx.outputs[2..].iter().all(|out| script::classify(&out.pk_script) == ScriptClass::StakeGen)
}

/// Revocation: a single stake-tree input and only revocation outputs.
pub fn is_ssrtx(tx: &Transaction) -> bool {
    tx.inputs.len() == 1
        && tx.inputs[0].previous_output.tree == TxTree::Stake
        && !tx.outputs.is_empty()
        && tx
            .outputs
            .iter()
            .all(|out| script::classify(&out.pk_script) == ScriptClass::StakeRevocation)
}

pub fn stake_tx_type(tx: &Transaction) -> StakeTxType {
    if is_sstx(tx) {
        StakeTxType::Ticket
    } else if is_ssgen(tx) {
        StakeTxType::Vote
    } else if is_ssrtx(tx) {
        StakeTxType::Revocation
    } else {
        StakeTxType::Regular
    }
}

fn vote_bits_push(script: &[u8]) -> Option<&[u8]> {
    if script.first() != Some(&OP_RETURN) {
        return None;
    }
    let pushes = script::push_data(&script[1..]).ok()?;
    match pushes.as_slice() {
        [bits] if bits.len() >= 2 => Some(bits),
        _ => None,
    }
}

/// Vote bits carried by a vote.
pub fn ssgen_vote_bits(tx: &Transaction) -> Result<u16, StakeError> {
    let out = tx.outputs.get(1).ok_or(StakeError::NotVote)?;
    let bits = vote_bits_push(&out.pk_script).ok_or(StakeError::MalformedVoteBits)?;
    Ok(u16::from_le_bytes([bits[0], bits[1]]))
}

/// Block hash and height a vote votes on.
pub fn ssgen_block_voted_on(tx: &Transaction) -> Result<(BlockHash, u32), StakeError> {
    if !is_ssgen(tx) {
        return Err(StakeError::NotVote);
    }
    let script = &tx.outputs[0].pk_script;
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&script[2..34]);
    let height = u32::from_le_bytes([script[34], script[35], script[36], script[37]]);
    Ok((BlockHash::from_byte_array(hash), height))
}

/// The ticket a vote or revocation spends.
pub fn spent_ticket(tx: &Transaction) -> Option<&OutPoint> {
    if is_ssgen(tx) {
        Some(&tx.inputs[1].previous_output)
    } else if is_ssrtx(tx) {
        Some(&tx.inputs[0].previous_output)
    } else {
        None
    }
}

fn commitment_raw_amount(script: &[u8]) -> Result<u64, StakeError> {
    if !is_commitment_script(script) {
        return Err(StakeError::NotCommitment);
    }
    let mut amount = [0u8; 8];
    amount.copy_from_slice(&script[22..30]);
    Ok(u64::from_le_bytes(amount))
}

/// Address a ticket commitment returns funds to.
pub fn commitment_address(script: &[u8], network: Network) -> Result<Address, StakeError> {
    let raw = commitment_raw_amount(script)?;
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script[2..22]);
    if raw & COMMITMENT_P2SH_FLAG != 0 {
        Ok(Address::p2sh(hash, network))
    } else {
        Ok(Address::p2pkh(hash, network))
    }
}

/// Amount committed by a ticket commitment.
pub fn commitment_amount(script: &[u8]) -> Result<i64, StakeError> {
    Ok((commitment_raw_amount(script)? & !COMMITMENT_P2SH_FLAG) as i64)
}

/// Builds a ticket commitment script.
pub fn commitment_script(address: &Address, amount: i64, fee_limits: u16) -> Vec<u8> {
    let mut raw = amount as u64 & !COMMITMENT_P2SH_FLAG;
    if address.kind() == AddressKind::ScriptHash {
        raw |= COMMITMENT_P2SH_FLAG;
    }
    let mut push = Vec::with_capacity(30);
    push.extend_from_slice(address.hash160());
    push.extend_from_slice(&raw.to_le_bytes());
    push.extend_from_slice(&fee_limits.to_le_bytes());
    script::null_data(&push)
}

/// Builds the block reference output script of a vote.
pub fn vote_block_ref_script(block_hash: &BlockHash, height: u32) -> Vec<u8> {
    let mut push = Vec::with_capacity(36);
    push.extend_from_slice(block_hash.as_byte_array());
    push.extend_from_slice(&height.to_le_bytes());
    script::null_data(&push)
}

/// Builds the vote bits output script of a vote.
pub fn vote_bits_script(vote_bits: u16) -> Vec<u8> {
    script::null_data(&vote_bits.to_le_bytes())
}

/// Payouts for each commitment when a ticket returns `ticket_value + subsidy`.
pub fn calculate_rewards(
    commitments: &[i64],
    ticket_value: i64,
    subsidy: i64,
) -> Result<Vec<i64>, StakeError> {
    if ticket_value <= 0 {
        return Err(StakeError::NonPositiveTicketValue(ticket_value));
    }
    let total = ticket_value as i128 + subsidy as i128;
    Ok(commitments
        .iter()
        .map(|amount| (*amount as i128 * total / ticket_value as i128) as i64)
        .collect())
}
