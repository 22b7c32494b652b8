//! Pay-to-pubkey-hash and pay-to-script-hash addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::{blake256, hash160};
use crate::network::Network;
use crate::script;

const CHECKSUM_LEN: usize = 4;
const ENCODED_PAYLOAD_LEN: usize = 2 + 20 + CHECKSUM_LEN;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("base58 decode error: {0}")]
    Base58(#[from] bs58::decode::Error),

    #[error("invalid decoded length {0}")]
    InvalidLength(usize),

    #[error("checksum mismatch")]
    InvalidChecksum,

    #[error("unknown address prefix {0:02x?}")]
    UnknownPrefix([u8; 2]),
}

/// Which script template an address pays to.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum AddressKind {
    PubKeyHash,
    ScriptHash,
}

/// A network-bound address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Address {
    network: Network,
    kind: AddressKind,
    hash: [u8; 20],
}

impl Address {
    pub fn p2pkh(hash: [u8; 20], network: Network) -> Self {
        Address {
            network,
            kind: AddressKind::PubKeyHash,
            hash,
        }
    }

    pub fn p2sh(hash: [u8; 20], network: Network) -> Self {
        Address {
            network,
            kind: AddressKind::ScriptHash,
            hash,
        }
    }

    /// Address paying to the hash of a serialized public key.
    pub fn from_pubkey(pubkey: &[u8], network: Network) -> Self {
        Self::p2pkh(hash160(pubkey), network)
    }

    /// Address paying to the hash of a redeem script.
    pub fn from_redeem_script(script: &[u8], network: Network) -> Self {
        Self::p2sh(hash160(script), network)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn hash160(&self) -> &[u8; 20] {
        &self.hash
    }

    /// Output script paying to this address.
    pub fn script_pubkey(&self) -> Vec<u8> {
        match self.kind {
            AddressKind::PubKeyHash => script::pay_to_pubkey_hash(&self.hash),
            AddressKind::ScriptHash => script::pay_to_script_hash(&self.hash),
        }
    }

    fn prefix(&self) -> [u8; 2] {
        let params = self.network.params();
        match self.kind {
            AddressKind::PubKeyHash => params.pubkey_hash_addr_id,
            AddressKind::ScriptHash => params.script_hash_addr_id,
        }
    }
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let second = blake256(&blake256(payload));
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&second[..CHECKSUM_LEN]);
    out
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut payload = Vec::with_capacity(ENCODED_PAYLOAD_LEN);
        payload.extend_from_slice(&self.prefix());
        payload.extend_from_slice(&self.hash);
        let check = checksum(&payload);
        payload.extend_from_slice(&check);
        f.write_str(&bs58::encode(payload).into_string())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = bs58::decode(s).into_vec()?;
        if data.len() != ENCODED_PAYLOAD_LEN {
            return Err(AddressError::InvalidLength(data.len()));
        }
        let (payload, check) = data.split_at(ENCODED_PAYLOAD_LEN - CHECKSUM_LEN);
        if checksum(payload).as_slice() != check {
            return Err(AddressError::InvalidChecksum);
        }
        let prefix = [payload[0], payload[1]];
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[2..]);

        for network in [Network::Mainnet, Network::Testnet, Network::Simnet] {
            let params = network.params();
            if prefix == params.pubkey_hash_addr_id {
                return Ok(Address::p2pkh(hash, network));
            }
            if prefix == params.script_hash_addr_id {
                return Ok(Address::p2sh(hash, network));
            }
        }
        Err(AddressError::UnknownPrefix(prefix))
    }
}
