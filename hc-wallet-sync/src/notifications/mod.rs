//! Node notifications consumed by the wallet and the fan-out of committed
//! wallet changes to subscribers.

pub mod dispatcher;
pub mod server;

use hc_wire::{BlockHash, BlockHeaderData, TxHash};

pub use dispatcher::Dispatcher;
pub use server::{EventBus, EventReceiver, NotificationError, NotificationServer};

/// Consensus notifications, drained by one task per associated client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainNotification {
    ClientConnected,
    BlockConnected {
        header: BlockHeaderData,
        transactions: Vec<Vec<u8>>,
    },
    Reorganization {
        old_hash: BlockHash,
        old_height: u32,
        new_hash: BlockHash,
        new_height: u32,
    },
    RelevantTxAccepted {
        transaction: Vec<u8>,
    },
    MissedTickets {
        block_hash: BlockHash,
        height: u32,
        tickets: Vec<TxHash>,
    },
    NewInstantTx {
        transaction: Vec<u8>,
        tickets: Vec<TxHash>,
        resend: bool,
    },
    InstantTxVote {
        vote_hash: TxHash,
        instant_tx_hash: TxHash,
        ticket_hash: TxHash,
        vote: bool,
        signature: Vec<u8>,
    },
}

impl ChainNotification {
    /// Node method name, used when logging handler failures.
    pub fn name(&self) -> &'static str {
        match self {
            ChainNotification::ClientConnected => "clientconnected",
            ChainNotification::BlockConnected {
                ..
            } => "blockconnected",
            ChainNotification::Reorganization {
                ..
            } => "reorganizing",
            ChainNotification::RelevantTxAccepted {
                ..
            } => "relevanttxaccepted",
            ChainNotification::MissedTickets {
                ..
            } => "spentandmissedtickets",
            ChainNotification::NewInstantTx {
                ..
            } => "newinstanttx",
            ChainNotification::InstantTxVote {
                ..
            } => "instanttxvote",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VotingNotification {
    WinningTickets {
        block_hash: BlockHash,
        height: u32,
        tickets: Vec<TxHash>,
    },
}

impl VotingNotification {
    pub fn name(&self) -> &'static str {
        match self {
            VotingNotification::WinningTickets {
                ..
            } => "winningtickets",
        }
    }
}
