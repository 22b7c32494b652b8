//! Error types for the wallet synchronization engine.

use std::io;

use hc_wire::{AddressError, BlockHash, HashParseError, ScriptError, StakeError, TxHash};
use thiserror::Error;

/// Main error type for the wallet synchronization engine.
#[derive(Debug, Error)]
pub enum WalletSyncError {
    #[error("Channel failure for: {0} - Failure: {1}")]
    ChannelFailure(String, String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Voting error: {0}")]
    Voting(#[from] VotingError),

    #[error("Decode error: {0}")]
    Wire(#[from] hc_wire::Error),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Hash error: {0}")]
    Hash(#[from] HashParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),
}

impl WalletSyncError {
    /// Short category used as a structured logging field.
    pub fn category(&self) -> &'static str {
        match self {
            WalletSyncError::ChannelFailure(..) => "channel",
            WalletSyncError::Storage(_) => "storage",
            WalletSyncError::Sync(e) => e.category(),
            WalletSyncError::Rpc(_) => "rpc",
            WalletSyncError::Bridge(_) => "bridge",
            WalletSyncError::Voting(_) => "voting",
            WalletSyncError::Wire(_)
            | WalletSyncError::Script(_)
            | WalletSyncError::Address(_)
            | WalletSyncError::Hash(_) => "decode",
            WalletSyncError::Config(_) | WalletSyncError::Parse(_) => "config",
            WalletSyncError::Io(_) => "io",
            WalletSyncError::Logging(_) => "logging",
        }
    }

    /// True for the duplicate class, which callers swallow.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, WalletSyncError::Storage(StorageError::Duplicate(_)))
    }
}

/// Parse-related errors.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid network name: {0}")]
    InvalidNetwork(String),

    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    #[error("Invalid argument value for {0}: {1}")]
    InvalidArgument(String, String),
}

/// Logging-related errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Subscriber initialization failed: {0}")]
    SubscriberInit(String),

    #[error("Log rotation failed: {0}")]
    RotationFailed(String),
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Block {block} does not extend the main chain tip {tip}")]
    MissingParent { block: BlockHash, tip: BlockHash },

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Data directory locked: {0}")]
    DirectoryLocked(String),
}

impl StorageError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StorageError::Duplicate(_))
    }
}

/// Chain synchronization and reorganization errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Reorganization to {requested} notified, but reorg to {in_flight} already in progress")]
    ReorgInProgress { requested: BlockHash, in_flight: BlockHash },

    #[error("No side chain to switch to")]
    EmptySideChain,

    #[error("Side chain forks at height {fork_height} above main chain tip height {tip_height}")]
    ForkAboveTip { fork_height: u32, tip_height: u32 },

    #[error("Side chain block at height {got} does not follow height {expected}")]
    SideChainGap { expected: u32, got: u32 },

    #[error("Reorganization depth {depth} exceeds maximum {max}")]
    ReorgTooDeep { depth: usize, max: usize },

    #[error("Invalid sync state: {0}")]
    InvalidState(String),

    #[error("Missing dependency: {0}")]
    MissingDependency(String),
}

impl SyncError {
    /// Returns a static string representing the error category based on the variant
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::ReorgInProgress { .. } | SyncError::InvalidState(_) => "state",
            SyncError::EmptySideChain
            | SyncError::ForkAboveTip { .. }
            | SyncError::SideChainGap { .. }
            | SyncError::ReorgTooDeep { .. } => "reorg",
            SyncError::MissingDependency(_) => "dependency",
        }
    }
}

/// Remote node RPC errors.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("Invalid notification {method}: {reason}")]
    InvalidNotification { method: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] hc_wire::Error),
}

/// Token-protocol bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Bridge process I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Bridge closed its output")]
    Closed,

    #[error("Bridge error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Malformed bridge response: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Vote and revocation construction errors.
#[derive(Debug, Error)]
pub enum VotingError {
    #[error("No chain client associated")]
    NoChainClient,

    #[error("No transaction signer configured")]
    NoSigner,

    #[error("Ticket purchase {0} not found")]
    TicketNotFound(TxHash),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Cannot construct transaction: {0}")]
    Construction(String),

    #[error("Stake error: {0}")]
    Stake(#[from] StakeError),
}

/// Type alias for Result with WalletSyncError.
pub type Result<T> = std::result::Result<T, WalletSyncError>;

/// Type alias for storage operation results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Type alias for sync operation results.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Type alias for remote node call results.
pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Type alias for bridge call results.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Type alias for voting results.
pub type VotingResult<T> = std::result::Result<T, VotingError>;

/// Type alias for logging operation results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::MissingDependency(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_category() {
        let hash = BlockHash::all_zeros();
        assert_eq!(
            SyncError::ReorgInProgress {
                requested: hash,
                in_flight: hash
            }
            .category(),
            "state"
        );
        assert_eq!(SyncError::EmptySideChain.category(), "reorg");
        assert_eq!(
            SyncError::ReorgTooDeep {
                depth: 10,
                max: 5
            }
            .category(),
            "reorg"
        );
        assert_eq!(SyncError::MissingDependency("x".into()).category(), "dependency");
    }

    #[test]
    fn test_duplicate_detection() {
        let err: WalletSyncError = StorageError::Duplicate("block".into()).into();
        assert!(err.is_duplicate());
        assert_eq!(err.category(), "storage");

        let err: WalletSyncError = StorageError::NotFound("block".into()).into();
        assert!(!err.is_duplicate());
    }
}
