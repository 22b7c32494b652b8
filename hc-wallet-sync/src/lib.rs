//! Chain synchronization engine for the Hc wallet daemon.
//!
//! The wallet keeps a local ledger of its transactions, addresses and tickets
//! in step with a full node:
//!
//! - Connects blocks announced by the node and records relevant transactions
//! - Follows reorganizations, switching the main chain atomically
//! - Rescans history in batches, resuming after interruptions
//! - Votes with winning tickets and revokes missed ones
//! - Evaluates stake-pool tickets and their fees
//! - Keeps an optional token-protocol engine at the same height
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hc_wallet_sync::notifications::Dispatcher;
//! use hc_wallet_sync::rpc::WsChainClient;
//! use hc_wallet_sync::storage::LedgerStore;
//! use hc_wallet_sync::{Wallet, WalletConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WalletConfig::simnet().with_data_dir("./.tmp/hc-wallet");
//!     let ledger = LedgerStore::open(&config.data_dir).await?;
//!     let wallet = Arc::new(Wallet::new(config.clone(), ledger)?);
//!
//!     let (client, streams) = WsChainClient::connect(&config).await?;
//!     wallet.associate_chain_client(Arc::new(client)).await?;
//!
//!     Dispatcher::new(wallet, streams, CancellationToken::new()).run().await;
//!     Ok(())
//! }
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod notifications;
pub mod rpc;
pub mod storage;
pub mod types;
pub mod wallet;

pub use config::{BridgeConfig, WalletConfig};
pub use error::{
    BridgeError, BridgeResult, LoggingError, LoggingResult, Result, RpcError, RpcResult, StorageError,
    StorageResult, SyncError, SyncResult, VotingError, VotingResult, WalletSyncError,
};
pub use logging::{LogFileConfig, LoggingConfig, LoggingGuard, init_console_logging, init_logging};
pub use tracing::level_filters::LevelFilter;
pub use types::{ChainTip, MainTipChanged, RescanProgress, TxNotification};
pub use wallet::{TransactionSigner, Wallet};

pub use hc_wire::{Address, BlockHash, Network, OutPoint, Transaction, TxHash};

/// Current version of the hc-wallet-sync library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
