//! Block headers.

use std::fmt;
use std::io::{self, Read, Write};

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::encode::{self, Decodable, Encodable, deserialize, serialize};
use crate::hash::BlockHash;

/// Size in bytes of a serialized block header.
pub const HEADER_SIZE: usize = 180;

/// Byte offset of the little-endian height inside a serialized header.
const HEIGHT_OFFSET: usize = 128;

/// A decoded block header.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: BlockHash,
    pub merkle_root: [u8; 32],
    pub stake_root: [u8; 32],
    pub vote_bits: u16,
    pub final_state: [u8; 6],
    pub voters: u16,
    pub fresh_stake: u8,
    pub revocations: u8,
    pub pool_size: u32,
    pub bits: u32,
    /// Stake difficulty: the price of a ticket in this block.
    pub sbits: i64,
    pub height: u32,
    pub size: u32,
    pub timestamp: u32,
    pub nonce: u32,
    pub extra_data: [u8; 32],
    pub stake_version: u32,
}

impl BlockHeader {
    pub fn block_hash(&self) -> BlockHash {
        BlockHash::hash(&serialize(self))
    }

    pub fn to_raw(&self) -> RawBlockHeader {
        let bytes = serialize(self);
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&bytes);
        RawBlockHeader(raw)
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.version.consensus_encode(w)?;
        len += self.prev_block.consensus_encode(w)?;
        len += self.merkle_root.consensus_encode(w)?;
        len += self.stake_root.consensus_encode(w)?;
        len += self.vote_bits.consensus_encode(w)?;
        len += self.final_state.consensus_encode(w)?;
        len += self.voters.consensus_encode(w)?;
        len += self.fresh_stake.consensus_encode(w)?;
        len += self.revocations.consensus_encode(w)?;
        len += self.pool_size.consensus_encode(w)?;
        len += self.bits.consensus_encode(w)?;
        len += self.sbits.consensus_encode(w)?;
        len += self.height.consensus_encode(w)?;
        len += self.size.consensus_encode(w)?;
        len += self.timestamp.consensus_encode(w)?;
        len += self.nonce.consensus_encode(w)?;
        len += self.extra_data.consensus_encode(w)?;
        len += self.stake_version.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(BlockHeader {
            version: Decodable::consensus_decode(r)?,
            prev_block: Decodable::consensus_decode(r)?,
            merkle_root: Decodable::consensus_decode(r)?,
            stake_root: Decodable::consensus_decode(r)?,
            vote_bits: Decodable::consensus_decode(r)?,
            final_state: Decodable::consensus_decode(r)?,
            voters: Decodable::consensus_decode(r)?,
            fresh_stake: Decodable::consensus_decode(r)?,
            revocations: Decodable::consensus_decode(r)?,
            pool_size: Decodable::consensus_decode(r)?,
            bits: Decodable::consensus_decode(r)?,
            sbits: Decodable::consensus_decode(r)?,
            height: Decodable::consensus_decode(r)?,
            size: Decodable::consensus_decode(r)?,
            timestamp: Decodable::consensus_decode(r)?,
            nonce: Decodable::consensus_decode(r)?,
            extra_data: Decodable::consensus_decode(r)?,
            stake_version: Decodable::consensus_decode(r)?,
        })
    }
}

/// A serialized block header kept in its fixed-size wire form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawBlockHeader(pub [u8; HEADER_SIZE]);

impl RawBlockHeader {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, encode::Error> {
        if bytes.len() != HEADER_SIZE {
            return Err(encode::Error::InvalidLength {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(bytes);
        Ok(RawBlockHeader(raw))
    }

    /// Height read straight from the serialized bytes.
    pub fn height(&self) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.0[HEIGHT_OFFSET..HEIGHT_OFFSET + 4]);
        u32::from_le_bytes(buf)
    }

    pub fn block_hash(&self) -> BlockHash {
        BlockHash::hash(&self.0)
    }

    pub fn decode(&self) -> Result<BlockHeader, encode::Error> {
        deserialize(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.0
    }
}

impl fmt::Debug for RawBlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawBlockHeader({})", hex::encode(self.0))
    }
}

impl Serialize for RawBlockHeader {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for RawBlockHeader {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RawHeaderVisitor;

        impl<'de> Visitor<'de> for RawHeaderVisitor {
            type Value = RawBlockHeader;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{HEADER_SIZE} header bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                RawBlockHeader::from_slice(v).map_err(E::custom)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut raw = [0u8; HEADER_SIZE];
                for (i, byte) in raw.iter_mut().enumerate() {
                    *byte = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(RawBlockHeader(raw))
            }
        }

        deserializer.deserialize_bytes(RawHeaderVisitor)
    }
}

/// Identity of a block as delivered by the node: its hash and raw header.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockHeaderData {
    pub block_hash: BlockHash,
    pub raw_header: RawBlockHeader,
}

impl BlockHeaderData {
    pub fn from_raw(bytes: &[u8]) -> Result<Self, encode::Error> {
        let raw_header = RawBlockHeader::from_slice(bytes)?;
        Ok(BlockHeaderData {
            block_hash: raw_header.block_hash(),
            raw_header,
        })
    }

    pub fn height(&self) -> u32 {
        self.raw_header.height()
    }
}

impl From<&BlockHeader> for BlockHeaderData {
    fn from(header: &BlockHeader) -> Self {
        let raw_header = header.to_raw();
        BlockHeaderData {
            block_hash: raw_header.block_hash(),
            raw_header,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 5,
            prev_block: BlockHash::hash(b"parent"),
            sbits: 2_000_000_000,
            height: 4242,
            timestamp: 1_600_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn genesis_header_hashes_to_known_id() {
        // Mainnet genesis of the Decred chain Hc inherits its header format from.
        let merkle_root: BlockHash =
            "66aa7491b9adce110585ccab7e3fb5fe280de174530cca10eba2c6c3df01c10d".parse().unwrap();
        let genesis = BlockHeader {
            version: 1,
            merkle_root: merkle_root.to_byte_array(),
            bits: 0x1b01ffff,
            sbits: 200_000_000,
            timestamp: 1_454_954_400,
            ..Default::default()
        };
        assert_eq!(
            genesis.block_hash().to_string(),
            "298e5cc3d985bfe7f81dc135f360abe089edd4396b86d2de66b0cef42b21d980"
        );
        let data = BlockHeaderData::from_raw(genesis.to_raw().as_bytes()).unwrap();
        assert_eq!(data.block_hash, genesis.block_hash());
    }

    #[test]
    fn header_serializes_to_fixed_size() {
        assert_eq!(serialize(&sample_header()).len(), HEADER_SIZE);
    }

    #[test]
    fn raw_height_matches_decoded_height() {
        let header = sample_header();
        let raw = header.to_raw();
        assert_eq!(raw.height(), 4242);
        assert_eq!(raw.decode().unwrap(), header);
        assert_eq!(raw.block_hash(), header.block_hash());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let err = BlockHeaderData::from_raw(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, encode::Error::InvalidLength { expected: HEADER_SIZE, actual: 10 }));
    }

    #[test]
    fn raw_header_survives_bincode() {
        let data = BlockHeaderData::from(&sample_header());
        let bytes = bincode::serde::encode_to_vec(data, bincode::config::standard()).unwrap();
        let (back, _): (BlockHeaderData, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(back, data);
    }
}
