//! Hash types.
//!
//! Block and transaction identifiers are 32-byte BLAKE-256 digests. They are
//! displayed byte-reversed, matching how node RPC interfaces print them.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use blake_hash::Digest as _;
use blake_hash::Blake256;
use ripemd::Digest as _;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encode::{self, Decodable, Encodable};

/// Error parsing a hash from its hex representation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HashParseError {
    #[error("invalid hash length {0}, expected 64 hex characters")]
    InvalidLength(usize),

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

macro_rules! hash_newtype {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// The all-zero hash.
            pub const fn all_zeros() -> Self {
                Self([0u8; 32])
            }

            pub const fn from_byte_array(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub const fn as_byte_array(&self) -> &[u8; 32] {
                &self.0
            }

            pub const fn to_byte_array(self) -> [u8; 32] {
                self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 32]
            }

            /// Hashes `data` with BLAKE-256.
            pub fn hash(data: &[u8]) -> Self {
                Self(blake256(data))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut reversed = self.0;
                reversed.reverse();
                f.write_str(&hex::encode(reversed))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = HashParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != 64 {
                    return Err(HashParseError::InvalidLength(s.len()));
                }
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(s, &mut bytes)?;
                bytes.reverse();
                Ok(Self(bytes))
            }
        }

        impl Encodable for $name {
            fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
                self.0.consensus_encode(w)
            }
        }

        impl Decodable for $name {
            fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
                Ok(Self(<[u8; 32]>::consensus_decode(r)?))
            }
        }
    };
}

hash_newtype!(BlockHash, "Hash of a serialized block header.");
hash_newtype!(TxHash, "Hash of a transaction prefix. Witness data never changes it.");

/// BLAKE-256 (14 rounds) of `data`.
pub fn blake256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Blake256::digest(data));
    out
}

/// RIPEMD-160 of BLAKE-256, the digest used by pay-to-pubkey-hash and
/// pay-to-script-hash scripts.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(blake256(data)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_byte_reversed() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        let hash = BlockHash::from_byte_array(bytes);
        let shown = hash.to_string();
        assert!(shown.ends_with("ab"));
        assert_eq!(shown.parse::<BlockHash>().unwrap(), hash);
    }

    #[test]
    fn parse_rejects_bad_length() {
        assert_eq!("abcd".parse::<TxHash>(), Err(HashParseError::InvalidLength(4)));
    }

    #[test]
    fn blake256_matches_reference_vectors() {
        assert_eq!(
            hex::encode(blake256(b"")),
            "716f6e863f744b9ac22c97ec7b76ea5f5908bc5b2f67c61510bfc4751384ea7a"
        );
        assert_eq!(
            hex::encode(blake256(&[0u8])),
            "0ce8d4ef4dd7cd8d62dfded9d4edb0a774ae6a41929a74da23109e8f11139c87"
        );
        assert_eq!(
            hex::encode(blake256(&[0u8; 72])),
            "d419bad32d504fb7d44d460c42c5593fe544fa4c135dec31e21bd9abdcc22d41"
        );
    }

    #[test]
    fn hash160_is_ripemd160_of_blake256() {
        assert_eq!(hex::encode(hash160(b"")), "413320bee32a3bdb92b145d337316739d54a9287");
    }
}
