//! Transactions.
//!
//! A transaction serializes as a prefix (inputs' outpoints and sequences,
//! outputs, lock time, expiry) followed by a witness (per-input values and
//! signature scripts). The transaction hash commits to the prefix only.

use std::fmt;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::encode::{
    self, Decodable, Encodable, VarInt, deserialize, read_len, read_var_bytes, serialize,
    write_var_bytes,
};
use crate::hash::TxHash;

/// Sequence number of a final input.
pub const MAX_TX_IN_SEQUENCE: u32 = u32::MAX;
/// Block height recorded in a witness when the input's origin is unknown.
pub const NULL_BLOCK_HEIGHT: u32 = 0;
/// Block index recorded in a witness when the input's origin is unknown.
pub const NULL_BLOCK_INDEX: u32 = u32::MAX;
/// Value recorded in a witness when the input's amount is unknown.
pub const NULL_VALUE_IN: i64 = -1;

const SER_TYPE_FULL: u16 = 0;
const SER_TYPE_NO_WITNESS: u16 = 1;

/// The transaction tree an output lives in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
pub enum TxTree {
    #[default]
    Regular,
    Stake,
}

impl TxTree {
    fn as_u8(self) -> u8 {
        match self {
            TxTree::Regular => 0,
            TxTree::Stake => 1,
        }
    }
}

/// Reference to an output of a previous transaction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: TxHash,
    pub index: u32,
    pub tree: TxTree,
}

impl OutPoint {
    pub fn new(hash: TxHash, index: u32, tree: TxTree) -> Self {
        OutPoint {
            hash,
            index,
            tree,
        }
    }

    /// The outpoint referenced by coinbase and stakebase inputs.
    pub fn null() -> Self {
        OutPoint {
            hash: TxHash::all_zeros(),
            index: u32::MAX,
            tree: TxTree::Regular,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.index)
    }
}

impl Encodable for OutPoint {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.hash.consensus_encode(w)?;
        len += self.index.consensus_encode(w)?;
        len += self.tree.as_u8().consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for OutPoint {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let hash = TxHash::consensus_decode(r)?;
        let index = u32::consensus_decode(r)?;
        let tree = match u8::consensus_decode(r)? {
            0 => TxTree::Regular,
            1 => TxTree::Stake,
            other => return Err(encode::Error::InvalidTxTree(other)),
        };
        Ok(OutPoint {
            hash,
            index,
            tree,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub sequence: u32,
    pub value_in: i64,
    pub block_height: u32,
    pub block_index: u32,
    pub signature_script: Vec<u8>,
}

impl TxIn {
    /// Input spending `previous_output` with unknown origin and no signature.
    pub fn new(previous_output: OutPoint) -> Self {
        TxIn {
            previous_output,
            sequence: MAX_TX_IN_SEQUENCE,
            value_in: NULL_VALUE_IN,
            block_height: NULL_BLOCK_HEIGHT,
            block_index: NULL_BLOCK_INDEX,
            signature_script: Vec::new(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxOut {
    pub value: i64,
    pub version: u16,
    pub pk_script: Vec<u8>,
}

impl TxOut {
    pub fn new(value: i64, pk_script: Vec<u8>) -> Self {
        TxOut {
            value,
            version: 0,
            pk_script,
        }
    }

    pub fn serialize_size(&self) -> usize {
        8 + 2 + VarInt(self.pk_script.len() as u64).size() + self.pk_script.len()
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u16,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
    /// Height at which an unmined transaction expires; zero means never.
    pub expiry: u32,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            version: 1,
            ..Default::default()
        }
    }

    pub fn tx_hash(&self) -> TxHash {
        let mut prefix = Vec::new();
        self.encode_prefix(&mut prefix, SER_TYPE_NO_WITNESS)
            .expect("in-memory writers don't error");
        TxHash::hash(&prefix)
    }

    /// Coinbase transactions have one input spending the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, encode::Error> {
        deserialize(bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serialize(self)
    }

    pub fn serialize_size(&self) -> usize {
        self.to_bytes().len()
    }

    fn encode_prefix<W: Write + ?Sized>(&self, w: &mut W, ser_type: u16) -> Result<usize, io::Error> {
        let version_word = (self.version as u32) | ((ser_type as u32) << 16);
        let mut len = version_word.consensus_encode(w)?;
        len += VarInt(self.inputs.len() as u64).consensus_encode(w)?;
        for input in &self.inputs {
            len += input.previous_output.consensus_encode(w)?;
            len += input.sequence.consensus_encode(w)?;
        }
        len += VarInt(self.outputs.len() as u64).consensus_encode(w)?;
        for output in &self.outputs {
            len += output.value.consensus_encode(w)?;
            len += output.version.consensus_encode(w)?;
            len += write_var_bytes(w, &output.pk_script)?;
        }
        len += self.lock_time.consensus_encode(w)?;
        len += self.expiry.consensus_encode(w)?;
        Ok(len)
    }

    fn encode_witness<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = VarInt(self.inputs.len() as u64).consensus_encode(w)?;
        for input in &self.inputs {
            len += input.value_in.consensus_encode(w)?;
            len += input.block_height.consensus_encode(w)?;
            len += input.block_index.consensus_encode(w)?;
            len += write_var_bytes(w, &input.signature_script)?;
        }
        Ok(len)
    }
}

impl Encodable for Transaction {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.encode_prefix(w, SER_TYPE_FULL)?;
        len += self.encode_witness(w)?;
        Ok(len)
    }
}

impl Decodable for Transaction {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let version_word = u32::consensus_decode(r)?;
        let version = (version_word & 0xffff) as u16;
        let ser_type = (version_word >> 16) as u16;
        if ser_type != SER_TYPE_FULL && ser_type != SER_TYPE_NO_WITNESS {
            return Err(encode::Error::UnsupportedSerType(ser_type));
        }

        let input_count = read_len(r)?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            let previous_output = OutPoint::consensus_decode(r)?;
            let mut input = TxIn::new(previous_output);
            input.sequence = u32::consensus_decode(r)?;
            inputs.push(input);
        }

        let output_count = read_len(r)?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            let value = i64::consensus_decode(r)?;
            let version = u16::consensus_decode(r)?;
            let pk_script = read_var_bytes(r)?;
            outputs.push(TxOut {
                value,
                version,
                pk_script,
            });
        }

        let lock_time = u32::consensus_decode(r)?;
        let expiry = u32::consensus_decode(r)?;

        if ser_type == SER_TYPE_FULL {
            let witness_count = read_len(r)?;
            if witness_count != inputs.len() {
                return Err(encode::Error::WitnessCountMismatch {
                    prefix: inputs.len(),
                    witness: witness_count,
                });
            }
            for input in inputs.iter_mut() {
                input.value_in = i64::consensus_decode(r)?;
                input.block_height = u32::consensus_decode(r)?;
                input.block_index = u32::consensus_decode(r)?;
                input.signature_script = read_var_bytes(r)?;
            }
        }

        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
            expiry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        let mut tx = Transaction::new();
        let mut input = TxIn::new(OutPoint::new(TxHash::hash(b"prev"), 1, TxTree::Regular));
        input.value_in = 5_000;
        input.signature_script = vec![0x01, 0x02];
        tx.inputs.push(input);
        tx.outputs.push(TxOut::new(4_000, vec![0x6a]));
        tx.expiry = 900;
        tx
    }

    #[test]
    fn decode_restores_prefix_and_witness() {
        let tx = sample_tx();
        let decoded = Transaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn hash_ignores_signature_script() {
        let tx = sample_tx();
        let mut signed = tx.clone();
        signed.inputs[0].signature_script = vec![0xff; 72];
        assert_eq!(tx.tx_hash(), signed.tx_hash());

        let mut altered = tx.clone();
        altered.outputs[0].value = 3_999;
        assert_ne!(tx.tx_hash(), altered.tx_hash());
    }

    #[test]
    fn unknown_tree_rejected() {
        let mut bytes = sample_tx().to_bytes();
        // version word (4) + input count (1) + hash (32) + index (4)
        bytes[4 + 1 + 32 + 4] = 7;
        assert!(matches!(Transaction::from_bytes(&bytes), Err(encode::Error::InvalidTxTree(7))));
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::new(OutPoint::null()));
        assert!(tx.is_coinbase());
        assert!(!sample_tx().is_coinbase());
    }
}
