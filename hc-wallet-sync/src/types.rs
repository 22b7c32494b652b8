//! Common type definitions shared by the store, the engines and subscribers.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use hc_wire::stake::stake_tx_type;
use hc_wire::{BlockHash, BlockHeaderData, StakeTxType, Transaction, TxHash};

/// Head of the locally stored main chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub hash: BlockHash,
    pub height: u32,
}

/// Confirmation data attached to a mined transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub hash: BlockHash,
    pub height: u32,
    /// Block timestamp, unix seconds.
    pub time: i64,
    pub vote_bits: u16,
}

/// A parsed transaction as recorded by the wallet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx: Transaction,
    pub hash: TxHash,
    /// When the wallet first saw the transaction, unix seconds.
    pub received: i64,
    pub tx_type: StakeTxType,
    pub serialized: Vec<u8>,
}

impl TxRecord {
    /// Parses serialized transaction bytes received at `received`.
    pub fn from_bytes(bytes: &[u8], received: i64) -> Result<Self, hc_wire::Error> {
        let tx = Transaction::from_bytes(bytes)?;
        Ok(TxRecord {
            hash: tx.tx_hash(),
            tx_type: stake_tx_type(&tx),
            serialized: bytes.to_vec(),
            tx,
            received,
        })
    }

    pub fn from_tx(tx: Transaction, received: i64) -> Self {
        TxRecord {
            hash: tx.tx_hash(),
            tx_type: stake_tx_type(&tx),
            serialized: tx.to_bytes(),
            tx,
            received,
        }
    }

    /// Parses bytes stamped with the current time.
    pub fn now(bytes: &[u8]) -> Result<Self, hc_wire::Error> {
        Self::from_bytes(bytes, Utc::now().timestamp())
    }
}

/// A block held in memory while a reorganization accumulates.
#[derive(Clone, Debug)]
pub struct SideChainBlock {
    pub header: BlockHeaderData,
    pub transactions: Vec<Vec<u8>>,
}

/// Main chain tip change delivered to subscribers once committed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MainTipChanged {
    /// Ascending height order.
    pub attached_blocks: Vec<BlockHash>,
    /// Ascending height order.
    pub detached_blocks: Vec<BlockHash>,
    pub new_height: u32,
}

/// Transaction detail notification delivered once committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxNotification {
    Unmined {
        hash: TxHash,
        tx_type: StakeTxType,
    },
    Mined {
        hash: TxHash,
        tx_type: StakeTxType,
        block: BlockMeta,
    },
}

impl TxNotification {
    pub fn hash(&self) -> &TxHash {
        match self {
            TxNotification::Unmined {
                hash,
                ..
            }
            | TxNotification::Mined {
                hash,
                ..
            } => hash,
        }
    }
}

/// Rescan progress item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RescanProgress {
    /// Every block up to and including this height has been rescanned.
    ScannedThrough(u32),
    /// The rescan stopped with an error; no further items follow.
    Failed(String),
}

/// Status of a ticket managed for a stake-pool user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolTicketStatus {
    ImmatureOrLive,
    Voted,
    Missed,
}

impl PoolTicketStatus {
    /// Statuses only move out of `ImmatureOrLive`; rewriting the same
    /// status is allowed so a redelivered vote or revocation is harmless.
    pub fn can_become(self, next: PoolTicketStatus) -> bool {
        self == next || self == PoolTicketStatus::ImmatureOrLive
    }
}

impl fmt::Display for PoolTicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolTicketStatus::ImmatureOrLive => "live",
            PoolTicketStatus::Voted => "voted",
            PoolTicketStatus::Missed => "missed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTicket {
    pub ticket: TxHash,
    pub height_ticket: u32,
    pub status: PoolTicketStatus,
    pub spent_by: Option<TxHash>,
    pub height_spent: u32,
}

impl PoolTicket {
    /// Display status; a missed ticket older than `ticket_expiry` reads as expired.
    pub fn display_status(&self, tip_height: u32, ticket_expiry: u32) -> &'static str {
        match self.status {
            PoolTicketStatus::Missed
                if tip_height.saturating_sub(self.height_ticket) >= ticket_expiry =>
            {
                "expired"
            }
            PoolTicketStatus::Missed => "missed",
            PoolTicketStatus::Voted => "voted",
            PoolTicketStatus::ImmatureOrLive => "live",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hc_wire::{OutPoint, TxIn, TxOut, TxTree};

    #[test]
    fn test_tx_record_from_bytes() {
        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::new(OutPoint::new(TxHash::hash(b"p"), 0, TxTree::Regular)));
        tx.outputs.push(TxOut::new(10, vec![0x51]));

        let rec = TxRecord::from_bytes(&tx.to_bytes(), 1_700_000_000).unwrap();
        assert_eq!(rec.hash, tx.tx_hash());
        assert_eq!(rec.tx_type, StakeTxType::Regular);
        assert_eq!(rec, TxRecord::from_tx(tx, 1_700_000_000));
        assert!(TxRecord::from_bytes(&[0x01, 0x00], 0).is_err());
    }

    #[test]
    fn test_pool_status_transitions() {
        use PoolTicketStatus::*;
        assert!(ImmatureOrLive.can_become(Voted));
        assert!(ImmatureOrLive.can_become(Missed));
        assert!(Voted.can_become(Voted));
        assert!(!Voted.can_become(ImmatureOrLive));
        assert!(!Missed.can_become(Voted));
    }

    #[test]
    fn test_expired_is_derived() {
        let ticket = PoolTicket {
            ticket: TxHash::hash(b"t"),
            height_ticket: 100,
            status: PoolTicketStatus::Missed,
            spent_by: None,
            height_spent: 0,
        };
        assert_eq!(ticket.display_status(150, 384), "missed");
        assert_eq!(ticket.display_status(484, 384), "expired");
    }
}
