//! Wire-level primitives for the Hc wallet synchronization engine.
//!
//! This crate holds the data types exchanged with a full node: block headers,
//! transactions, output scripts and the stake transactions built on them, plus
//! addresses and per-network chain parameters.

pub mod address;
pub mod block;
pub mod encode;
pub mod hash;
pub mod network;
pub mod script;
pub mod stake;
pub mod transaction;

pub use address::{Address, AddressError, AddressKind};
pub use block::{BlockHeader, BlockHeaderData, HEADER_SIZE, RawBlockHeader};
pub use encode::Error;
pub use hash::{BlockHash, HashParseError, TxHash, blake256, hash160};
pub use network::{ChainParams, Network};
pub use script::{ScriptClass, ScriptError};
pub use stake::{StakeError, StakeTxType};
pub use transaction::{OutPoint, Transaction, TxIn, TxOut, TxTree};
