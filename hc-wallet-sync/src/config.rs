//! Configuration management for the wallet daemon.

use std::path::PathBuf;

use hc_wire::{Address, Network};

use crate::logging::LoggingConfig;

/// Default blocks per rescan batch.
pub const DEFAULT_RESCAN_BATCH_SIZE: usize = 2000;
/// Default bound on side-chain blocks accumulated during one reorganization.
pub const DEFAULT_MAX_REORG_DEPTH: usize = 1024;
/// Default relay fee in atoms per kilobyte.
pub const DEFAULT_RELAY_FEE: i64 = 1_000_000;

/// External token-protocol engine launched as a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Configuration for the wallet daemon.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Network the wallet operates on.
    pub network: Network,

    /// Directory holding the ledger, the lock file and logs.
    pub data_dir: PathBuf,

    /// Websocket endpoint of the full node, `host:port`.
    pub node_endpoint: String,
    pub node_user: String,
    pub node_password: String,

    /// Build and broadcast votes for winning tickets.
    pub enable_voting: bool,
    pub vote_bits: u16,

    /// Operate as a stake-pool backend.
    pub stake_pool_enabled: bool,
    /// Pool fee in percent of the ticket's share of the stake subsidy.
    pub pool_fees: f64,
    /// Cold-wallet fee addresses accepted in pool ticket commitments.
    pub pool_addresses: Vec<Address>,

    /// Relay fee in atoms per kilobyte.
    pub relay_fee: i64,
    pub allow_high_fees: bool,

    pub bridge: Option<BridgeConfig>,

    /// Longest side chain accepted before a reorganization is abandoned.
    pub max_reorg_depth: usize,
    pub rescan_batch_size: usize,

    // Subscriber buffering
    /// Capacity of the tip-change broadcast channel.
    pub tip_notification_buffer: usize,
    /// Capacity of the transaction broadcast channel.
    pub tx_notification_buffer: usize,
    /// Capacity of each rescan progress channel.
    pub rescan_progress_buffer: usize,

    pub logging: LoggingConfig,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self::new(Network::Mainnet)
    }
}

impl WalletConfig {
    /// Create a configuration for `network` with its default node port.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            data_dir: PathBuf::from("./hc-walletd-data"),
            node_endpoint: format!("127.0.0.1:{}", network.params().node_rpc_port),
            node_user: String::new(),
            node_password: String::new(),
            enable_voting: false,
            vote_bits: 0x0001,
            stake_pool_enabled: false,
            pool_fees: 0.0,
            pool_addresses: Vec::new(),
            relay_fee: DEFAULT_RELAY_FEE,
            allow_high_fees: false,
            bridge: None,
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            rescan_batch_size: DEFAULT_RESCAN_BATCH_SIZE,
            tip_notification_buffer: 64,
            tx_notification_buffer: 256,
            rescan_progress_buffer: 16,
            logging: LoggingConfig::default(),
        }
    }

    pub fn mainnet() -> Self {
        Self::new(Network::Mainnet)
    }

    pub fn testnet() -> Self {
        Self::new(Network::Testnet)
    }

    pub fn simnet() -> Self {
        Self::new(Network::Simnet)
    }

    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    pub fn with_node(
        mut self,
        endpoint: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.node_endpoint = endpoint.into();
        self.node_user = user.into();
        self.node_password = password.into();
        self
    }

    /// Enable voting with the given vote bits.
    pub fn with_voting(mut self, vote_bits: u16) -> Self {
        self.enable_voting = true;
        self.vote_bits = vote_bits;
        self
    }

    /// Enable stake-pool mode.
    pub fn with_stake_pool(mut self, pool_fees: f64, cold_addresses: Vec<Address>) -> Self {
        self.stake_pool_enabled = true;
        self.pool_fees = pool_fees;
        self.pool_addresses = cold_addresses;
        self
    }

    pub fn with_relay_fee(mut self, relay_fee: i64) -> Self {
        self.relay_fee = relay_fee;
        self
    }

    pub fn with_allow_high_fees(mut self, allow: bool) -> Self {
        self.allow_high_fees = allow;
        self
    }

    pub fn with_bridge(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.bridge = Some(BridgeConfig {
            program: program.into(),
            args,
        });
        self
    }

    pub fn with_max_reorg_depth(mut self, depth: usize) -> Self {
        self.max_reorg_depth = depth;
        self
    }

    pub fn with_rescan_batch_size(mut self, size: usize) -> Self {
        self.rescan_batch_size = size;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.stake_pool_enabled {
            if self.pool_addresses.is_empty() {
                return Err("stake pool mode requires at least one cold wallet fee address"
                    .to_string());
            }
            if !(0.01..=100.0).contains(&self.pool_fees) {
                return Err(format!(
                    "pool fees must be between 0.01 and 100.0 percent, got {}",
                    self.pool_fees
                ));
            }
        }

        if let Some(addr) = self.pool_addresses.iter().find(|a| a.network() != self.network) {
            return Err(format!("pool address {addr} is not a {} address", self.network));
        }

        if self.rescan_batch_size == 0 {
            return Err("rescan_batch_size must be > 0".to_string());
        }

        if self.max_reorg_depth == 0 {
            return Err("max_reorg_depth must be > 0".to_string());
        }

        if self.tip_notification_buffer == 0
            || self.tx_notification_buffer == 0
            || self.rescan_progress_buffer == 0
        {
            return Err("notification buffers must be > 0".to_string());
        }

        if self.relay_fee < 0 {
            return Err(format!("relay fee must not be negative, got {}", self.relay_fee));
        }

        if self.node_endpoint.is_empty() {
            return Err("node endpoint must be set".to_string());
        }

        Ok(())
    }
}
