//! Stake namespace: owned tickets, vote and revocation records, and
//! stake-pool user bookkeeping.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use hc_wire::{Address, BlockHash, Transaction, TxHash};

use crate::error::{StorageError, StorageResult};
use crate::types::{PoolTicket, PoolTicketStatus};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub tx: Transaction,
    /// Address paid by the stake submission output.
    pub voting_address: Option<Address>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub vote: TxHash,
    pub block: Option<(BlockHash, u32)>,
    pub vote_bits: u16,
    /// Serialized vote, kept when the wallet authored it.
    pub serialized: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    pub revocation: TxHash,
    pub block: Option<(BlockHash, u32)>,
    pub serialized: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakePoolUser {
    pub tickets: Vec<PoolTicket>,
    pub invalid_tickets: Vec<TxHash>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StakeIndex {
    tickets: HashMap<TxHash, TicketRecord>,
    /// Keyed by the ticket a vote spends.
    votes: HashMap<TxHash, VoteRecord>,
    /// Keyed by the ticket a revocation spends.
    revocations: HashMap<TxHash, RevocationRecord>,
    pool_users: BTreeMap<Address, StakePoolUser>,
}

impl StakeIndex {
    /// Records an owned ticket purchase. Re-inserting is a no-op.
    pub fn insert_sstx(&mut self, tx: &Transaction, voting_address: Option<Address>) {
        self.tickets.entry(tx.tx_hash()).or_insert_with(|| TicketRecord {
            tx: tx.clone(),
            voting_address,
        });
    }

    pub fn own_ticket(&self, ticket: &TxHash) -> bool {
        self.tickets.contains_key(ticket)
    }

    pub fn ticket_purchase(&self, ticket: &TxHash) -> Option<&Transaction> {
        self.tickets.get(ticket).map(|t| &t.tx)
    }

    /// Voting address recorded for a ticket; identifies its pool user.
    pub fn sstx_address(&self, ticket: &TxHash) -> StorageResult<Address> {
        self.tickets
            .get(ticket)
            .and_then(|t| t.voting_address)
            .ok_or_else(|| StorageError::NotFound(format!("voting address of ticket {ticket}")))
    }

    pub fn tickets(&self) -> impl Iterator<Item = &TxHash> {
        self.tickets.keys()
    }

    /// Records a mined vote. Callers check that the ticket is owned.
    pub fn insert_ssgen(
        &mut self,
        block: BlockHash,
        height: u32,
        vote: TxHash,
        vote_bits: u16,
        ticket: TxHash,
    ) {
        let record = self.votes.entry(ticket).or_insert(VoteRecord {
            vote,
            block: None,
            vote_bits,
            serialized: None,
        });
        record.vote = vote;
        record.vote_bits = vote_bits;
        record.block = Some((block, height));
    }

    /// Records a vote the wallet authored for `ticket`.
    pub fn store_vote_info(&mut self, ticket: TxHash, vote: &Transaction, vote_bits: u16) {
        let record = self.votes.entry(ticket).or_insert(VoteRecord {
            vote: vote.tx_hash(),
            block: None,
            vote_bits,
            serialized: None,
        });
        record.serialized = Some(vote.to_bytes());
    }

    pub fn vote(&self, ticket: &TxHash) -> Option<&VoteRecord> {
        self.votes.get(ticket)
    }

    /// Forgets where votes mined in `blocks` were confirmed. Votes the
    /// wallet did not author are dropped along with their blocks.
    pub fn detach_votes(&mut self, blocks: &[BlockHash]) -> usize {
        let mut detached = 0;
        self.votes.retain(|_, record| {
            let Some((block, _)) = record.block else {
                return true;
            };
            if !blocks.contains(&block) {
                return true;
            }
            detached += 1;
            record.block = None;
            record.serialized.is_some()
        });
        detached
    }

    /// Records a revocation of `ticket`. `block` is set once it is mined;
    /// a later unmined store keeps the recorded block.
    pub fn store_revocation_info(
        &mut self,
        ticket: TxHash,
        revocation: TxHash,
        block: Option<(BlockHash, u32)>,
        serialized: Option<Vec<u8>>,
    ) {
        let record = self.revocations.entry(ticket).or_insert(RevocationRecord {
            revocation,
            block: None,
            serialized: None,
        });
        record.revocation = revocation;
        if block.is_some() {
            record.block = block;
        }
        if serialized.is_some() {
            record.serialized = serialized;
        }
    }

    /// Forgets where revocations mined in `blocks` were confirmed.
    /// Revocations the wallet did not author are dropped.
    pub fn detach_revocations(&mut self, blocks: &[BlockHash]) -> usize {
        let mut detached = 0;
        self.revocations.retain(|_, record| {
            let Some((block, _)) = record.block else {
                return true;
            };
            if !blocks.contains(&block) {
                return true;
            }
            detached += 1;
            record.block = None;
            record.serialized.is_some()
        });
        detached
    }

    pub fn revocation(&self, ticket: &TxHash) -> Option<&RevocationRecord> {
        self.revocations.get(ticket)
    }

    /// Inserts or updates a pool user's ticket.
    ///
    /// Status only leaves [`PoolTicketStatus::ImmatureOrLive`]; a regression
    /// is rejected with [`StorageError::InvalidTransition`].
    pub fn update_pool_user_tickets(&mut self, user: Address, ticket: PoolTicket) -> StorageResult<()> {
        let entry = self.pool_users.entry(user).or_default();
        match entry.tickets.iter_mut().find(|t| t.ticket == ticket.ticket) {
            Some(existing) => {
                if !existing.status.can_become(ticket.status) {
                    return Err(StorageError::InvalidTransition(format!(
                        "pool ticket {} cannot move from {} to {}",
                        ticket.ticket, existing.status, ticket.status
                    )));
                }
                if ticket.status == PoolTicketStatus::ImmatureOrLive {
                    existing.height_ticket = ticket.height_ticket;
                } else {
                    *existing = PoolTicket {
                        height_ticket: existing.height_ticket.max(ticket.height_ticket),
                        ..ticket
                    };
                }
            }
            None => entry.tickets.push(ticket),
        }
        Ok(())
    }

    pub fn update_pool_user_invalid_tickets(&mut self, user: Address, ticket: TxHash) {
        let entry = self.pool_users.entry(user).or_default();
        if !entry.invalid_tickets.contains(&ticket) {
            entry.invalid_tickets.push(ticket);
        }
    }

    pub fn pool_user_info(&self, user: &Address) -> StorageResult<&StakePoolUser> {
        self.pool_users
            .get(user)
            .ok_or_else(|| StorageError::NotFound(format!("stake pool user {user}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hc_wire::Network;

    fn user() -> Address {
        Address::p2sh([3; 20], Network::Simnet)
    }

    fn pool_ticket(status: PoolTicketStatus) -> PoolTicket {
        PoolTicket {
            ticket: TxHash::hash(b"ticket"),
            height_ticket: 40,
            status,
            spent_by: None,
            height_spent: 0,
        }
    }

    #[test]
    fn test_pool_ticket_lifecycle() {
        let mut index = StakeIndex::default();
        index.update_pool_user_tickets(user(), pool_ticket(PoolTicketStatus::ImmatureOrLive)).unwrap();
        index.update_pool_user_tickets(user(), pool_ticket(PoolTicketStatus::ImmatureOrLive)).unwrap();

        let voted = PoolTicket {
            spent_by: Some(TxHash::hash(b"vote")),
            height_spent: 90,
            ..pool_ticket(PoolTicketStatus::Voted)
        };
        index.update_pool_user_tickets(user(), voted.clone()).unwrap();
        index.update_pool_user_tickets(user(), voted.clone()).unwrap();

        let err = index
            .update_pool_user_tickets(user(), pool_ticket(PoolTicketStatus::ImmatureOrLive))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition(_)));
        assert!(index.update_pool_user_tickets(user(), pool_ticket(PoolTicketStatus::Missed)).is_err());

        let info = index.pool_user_info(&user()).unwrap();
        assert_eq!(info.tickets, vec![voted]);
    }

    #[test]
    fn test_invalid_tickets_deduplicated() {
        let mut index = StakeIndex::default();
        index.update_pool_user_invalid_tickets(user(), TxHash::hash(b"a"));
        index.update_pool_user_invalid_tickets(user(), TxHash::hash(b"a"));
        assert_eq!(index.pool_user_info(&user()).unwrap().invalid_tickets.len(), 1);
        assert!(index.pool_user_info(&Address::p2sh([4; 20], Network::Simnet)).is_err());
    }

    #[test]
    fn test_authored_vote_then_mined() {
        let mut index = StakeIndex::default();
        let ticket = Transaction::new();
        let hash = ticket.tx_hash();
        index.insert_sstx(&ticket, None);
        assert!(index.own_ticket(&hash));
        assert!(index.sstx_address(&hash).is_err());

        let mut vote = Transaction::new();
        vote.lock_time = 7;
        index.store_vote_info(hash, &vote, 1);
        assert!(index.vote(&hash).unwrap().block.is_none());

        index.insert_ssgen(BlockHash::all_zeros(), 5, vote.tx_hash(), 1, hash);
        let record = index.vote(&hash).unwrap();
        assert_eq!(record.block, Some((BlockHash::all_zeros(), 5)));
        assert_eq!(record.serialized, Some(vote.to_bytes()));
    }

    #[test]
    fn test_detached_votes() {
        let mut index = StakeIndex::default();
        let (orphaned, kept) = (BlockHash::hash(b"orphaned"), BlockHash::hash(b"kept"));
        let (t1, t2, t3) = (TxHash::hash(b"t1"), TxHash::hash(b"t2"), TxHash::hash(b"t3"));

        index.insert_ssgen(orphaned, 10, TxHash::hash(b"v1"), 1, t1);
        index.store_vote_info(t2, &Transaction::new(), 1);
        index.insert_ssgen(orphaned, 10, TxHash::hash(b"v2"), 1, t2);
        index.insert_ssgen(kept, 9, TxHash::hash(b"v3"), 1, t3);

        assert_eq!(index.detach_votes(&[orphaned]), 2);
        assert!(index.vote(&t1).is_none());
        assert_eq!(index.vote(&t2).unwrap().block, None);
        assert_eq!(index.vote(&t3).unwrap().block, Some((kept, 9)));
    }

    #[test]
    fn test_detached_revocations() {
        let mut index = StakeIndex::default();
        let (orphaned, kept) = (BlockHash::hash(b"orphaned"), BlockHash::hash(b"kept"));
        let (t1, t2, t3) = (TxHash::hash(b"t1"), TxHash::hash(b"t2"), TxHash::hash(b"t3"));

        index.store_revocation_info(t1, TxHash::hash(b"r1"), Some((orphaned, 12)), None);
        index.store_revocation_info(t2, TxHash::hash(b"r2"), None, Some(vec![1, 2, 3]));
        index.store_revocation_info(t2, TxHash::hash(b"r2"), Some((orphaned, 12)), None);
        index.store_revocation_info(t3, TxHash::hash(b"r3"), Some((kept, 11)), None);

        assert_eq!(index.detach_revocations(&[orphaned]), 2);
        assert!(index.revocation(&t1).is_none());
        let authored = index.revocation(&t2).unwrap();
        assert_eq!(authored.block, None);
        assert_eq!(authored.serialized, Some(vec![1, 2, 3]));
        assert_eq!(index.revocation(&t3).unwrap().block, Some((kept, 11)));
    }
}
