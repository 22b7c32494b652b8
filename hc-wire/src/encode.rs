//! Consensus encoding and decoding.
//!
//! All wire structures implement [`Encodable`] and [`Decodable`]. Integers are
//! little-endian and variable length fields are prefixed with a compact size.

use std::io::{self, Cursor, Read, Write};

use thiserror::Error;

/// Maximum size, in bytes, of a vector we are allowed to decode.
pub const MAX_VEC_SIZE: usize = 4_000_000;

/// Encoding error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("non-minimal compact size encoding")]
    NonMinimalVarInt,

    #[error("allocation of oversized vector: requested {requested}, maximum {max}")]
    OversizedVectorAllocation { requested: usize, max: usize },

    #[error("unsupported transaction serialization type {0}")]
    UnsupportedSerType(u16),

    #[error("invalid transaction tree {0}")]
    InvalidTxTree(u8),

    #[error("witness has {witness} inputs but prefix has {prefix}")]
    WitnessCountMismatch { prefix: usize, witness: usize },

    #[error("unexpected length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("{0} trailing bytes after decoding")]
    TrailingBytes(usize),

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Data which can be encoded in a consensus-consistent way.
pub trait Encodable {
    /// Encodes an object with a well-defined format and returns the number of
    /// bytes written.
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error>;
}

/// Data which can be decoded in a consensus-consistent way.
pub trait Decodable: Sized {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error>;
}

/// Encodes an object into a vector.
pub fn serialize<T: Encodable + ?Sized>(data: &T) -> Vec<u8> {
    let mut encoder = Vec::new();
    let len = data.consensus_encode(&mut encoder).expect("in-memory writers don't error");
    debug_assert_eq!(len, encoder.len());
    encoder
}

/// Encodes an object into a hex-encoded string.
pub fn serialize_hex<T: Encodable + ?Sized>(data: &T) -> String {
    hex::encode(serialize(data))
}

/// Deserializes an object from a vector, erroring if the whole slice is not
/// consumed.
pub fn deserialize<T: Decodable>(data: &[u8]) -> Result<T, Error> {
    let mut cursor = Cursor::new(data);
    let value = T::consensus_decode(&mut cursor)?;
    let consumed = cursor.position() as usize;
    if consumed != data.len() {
        return Err(Error::TrailingBytes(data.len() - consumed));
    }
    Ok(value)
}

/// Deserializes an object from a hex string.
pub fn deserialize_hex<T: Decodable>(s: &str) -> Result<T, Error> {
    deserialize(&hex::decode(s)?)
}

macro_rules! impl_int_encodable {
    ($ty:ty, $len:expr) => {
        impl Encodable for $ty {
            #[inline]
            fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
                w.write_all(&self.to_le_bytes())?;
                Ok($len)
            }
        }

        impl Decodable for $ty {
            #[inline]
            fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
                let mut buf = [0u8; $len];
                r.read_exact(&mut buf)?;
                Ok(<$ty>::from_le_bytes(buf))
            }
        }
    };
}

impl_int_encodable!(u8, 1);
impl_int_encodable!(u16, 2);
impl_int_encodable!(u32, 4);
impl_int_encodable!(u64, 8);
impl_int_encodable!(i32, 4);
impl_int_encodable!(i64, 8);

impl<const N: usize> Encodable for [u8; N] {
    #[inline]
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        w.write_all(self)?;
        Ok(N)
    }
}

impl<const N: usize> Decodable for [u8; N] {
    #[inline]
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let mut buf = [0u8; N];
        r.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// A compact size integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VarInt(pub u64);

impl VarInt {
    /// Number of bytes this value occupies when encoded.
    pub const fn size(&self) -> usize {
        match self.0 {
            0..=0xFC => 1,
            0xFD..=0xFFFF => 3,
            0x10000..=0xFFFF_FFFF => 5,
            _ => 9,
        }
    }
}

impl Encodable for VarInt {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        match self.0 {
            0..=0xFC => {
                (self.0 as u8).consensus_encode(w)?;
                Ok(1)
            }
            0xFD..=0xFFFF => {
                w.write_all(&[0xFD])?;
                (self.0 as u16).consensus_encode(w)?;
                Ok(3)
            }
            0x10000..=0xFFFF_FFFF => {
                w.write_all(&[0xFE])?;
                (self.0 as u32).consensus_encode(w)?;
                Ok(5)
            }
            _ => {
                w.write_all(&[0xFF])?;
                self.0.consensus_encode(w)?;
                Ok(9)
            }
        }
    }
}

impl Decodable for VarInt {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let n = u8::consensus_decode(r)?;
        match n {
            0xFF => {
                let x = u64::consensus_decode(r)?;
                if x < 0x1_0000_0000 {
                    return Err(Error::NonMinimalVarInt);
                }
                Ok(VarInt(x))
            }
            0xFE => {
                let x = u32::consensus_decode(r)?;
                if x < 0x10000 {
                    return Err(Error::NonMinimalVarInt);
                }
                Ok(VarInt(x as u64))
            }
            0xFD => {
                let x = u16::consensus_decode(r)?;
                if x < 0xFD {
                    return Err(Error::NonMinimalVarInt);
                }
                Ok(VarInt(x as u64))
            }
            n => Ok(VarInt(n as u64)),
        }
    }
}

/// Writes a compact-size prefixed byte string.
pub fn write_var_bytes<W: Write + ?Sized>(w: &mut W, bytes: &[u8]) -> Result<usize, io::Error> {
    let len = VarInt(bytes.len() as u64).consensus_encode(w)?;
    w.write_all(bytes)?;
    Ok(len + bytes.len())
}

/// Reads a compact-size prefixed byte string.
pub fn read_var_bytes<R: Read + ?Sized>(r: &mut R) -> Result<Vec<u8>, Error> {
    let len = read_len(r)?;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reads a compact-size length and checks it against [`MAX_VEC_SIZE`].
pub fn read_len<R: Read + ?Sized>(r: &mut R) -> Result<usize, Error> {
    let VarInt(len) = VarInt::consensus_decode(r)?;
    let len = len as usize;
    if len > MAX_VEC_SIZE {
        return Err(Error::OversizedVectorAllocation {
            requested: len,
            max: MAX_VEC_SIZE,
        });
    }
    Ok(len)
}
