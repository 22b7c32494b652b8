//! Network selection and per-network chain parameters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The networks a wallet can operate on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Simnet,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown network: {0}")]
pub struct UnknownNetwork(pub String);

impl Network {
    pub fn params(self) -> &'static ChainParams {
        match self {
            Network::Mainnet => &MAINNET_PARAMS,
            Network::Testnet => &TESTNET_PARAMS,
            Network::Simnet => &SIMNET_PARAMS,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.params().name
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "simnet" => Ok(Network::Simnet),
            other => Err(UnknownNetwork(other.to_string())),
        }
    }
}

/// Consensus and interface constants for one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    pub network: Network,
    pub name: &'static str,

    /// Port of the node's websocket JSON-RPC server.
    pub node_rpc_port: u16,
    /// Default port of the wallet's own JSON-RPC server.
    pub wallet_rpc_port: u16,
    /// Default port of the wallet's gRPC server.
    pub wallet_grpc_port: u16,

    pub pubkey_hash_addr_id: [u8; 2],
    pub script_hash_addr_id: [u8; 2],

    pub base_subsidy: i64,
    pub mul_subsidy: i64,
    pub div_subsidy: i64,
    pub subsidy_reduction_interval: i64,
    pub work_reward_proportion: u16,
    pub stake_reward_proportion: u16,
    pub block_tax_proportion: u16,

    pub tickets_per_block: u16,
    pub ticket_pool_size: u16,
    pub ticket_maturity: u16,
    pub ticket_expiry: u32,
    pub coinbase_maturity: u16,
    pub stake_validation_height: i64,
}

pub static MAINNET_PARAMS: ChainParams = ChainParams {
    network: Network::Mainnet,
    name: "mainnet",
    node_rpc_port: 14009,
    wallet_rpc_port: 14010,
    wallet_grpc_port: 14011,
    pubkey_hash_addr_id: [0x09, 0x7f],
    script_hash_addr_id: [0x09, 0x5a],
    base_subsidy: 3_119_582_664,
    mul_subsidy: 100,
    div_subsidy: 101,
    subsidy_reduction_interval: 6144,
    work_reward_proportion: 6,
    stake_reward_proportion: 3,
    block_tax_proportion: 1,
    tickets_per_block: 5,
    ticket_pool_size: 8192,
    ticket_maturity: 256,
    ticket_expiry: 40960,
    coinbase_maturity: 256,
    stake_validation_height: 4096,
};

pub static TESTNET_PARAMS: ChainParams = ChainParams {
    network: Network::Testnet,
    name: "testnet",
    node_rpc_port: 12009,
    wallet_rpc_port: 12010,
    wallet_grpc_port: 12011,
    pubkey_hash_addr_id: [0x0f, 0x21],
    script_hash_addr_id: [0x0e, 0xfc],
    base_subsidy: 2_500_000_000,
    mul_subsidy: 100,
    div_subsidy: 101,
    subsidy_reduction_interval: 2048,
    work_reward_proportion: 6,
    stake_reward_proportion: 3,
    block_tax_proportion: 1,
    tickets_per_block: 5,
    ticket_pool_size: 1024,
    ticket_maturity: 16,
    ticket_expiry: 6144,
    coinbase_maturity: 16,
    stake_validation_height: 768,
};

pub static SIMNET_PARAMS: ChainParams = ChainParams {
    network: Network::Simnet,
    name: "simnet",
    node_rpc_port: 13009,
    wallet_rpc_port: 13010,
    wallet_grpc_port: 13011,
    pubkey_hash_addr_id: [0x0e, 0x91],
    script_hash_addr_id: [0x0e, 0x6c],
    base_subsidy: 50_000_000_000,
    mul_subsidy: 100,
    div_subsidy: 101,
    subsidy_reduction_interval: 128,
    work_reward_proportion: 6,
    stake_reward_proportion: 3,
    block_tax_proportion: 1,
    tickets_per_block: 5,
    ticket_pool_size: 64,
    ticket_maturity: 16,
    ticket_expiry: 384,
    coinbase_maturity: 16,
    stake_validation_height: 144,
};

impl ChainParams {
    pub fn total_subsidy_proportions(&self) -> i64 {
        (self.work_reward_proportion + self.stake_reward_proportion + self.block_tax_proportion)
            as i64
    }

    /// Full block subsidy at `height`, reduced by `mul/div` once per
    /// reduction interval.
    pub fn block_subsidy(&self, height: i64) -> i64 {
        if height <= 0 {
            return 0;
        }
        let reductions = height / self.subsidy_reduction_interval;
        let mut subsidy = self.base_subsidy;
        for _ in 0..reductions {
            subsidy = subsidy * self.mul_subsidy / self.div_subsidy;
            if subsidy == 0 {
                break;
            }
        }
        subsidy
    }

    /// Subsidy paid to a single vote included in the block at `height`.
    pub fn stake_vote_subsidy(&self, height: i64) -> i64 {
        let stake = self.block_subsidy(height) * self.stake_reward_proportion as i64;
        stake / (self.total_subsidy_proportions() * self.tickets_per_block as i64)
    }
}
