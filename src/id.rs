//! 160-bit node identifiers and the XOR distance metric
//!
//! Every node and every key lives in the same 160-bit space. Distance between
//! two identifiers is their bitwise XOR interpreted as a big-endian integer,
//! which gives a total order with no ties between distinct ids.

use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor};

/// Width of the identifier space in bits
pub const ID_BITS: u32 = 160;
/// Width of the identifier space in bytes
pub const ID_BYTES: usize = 20;

/// A 160-bit identifier, stored big-endian
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// The zero identifier, the low end of the space
    pub fn zero() -> Self {
        NodeId([0u8; ID_BYTES])
    }

    /// The all-ones identifier, the high end of the space
    pub fn max() -> Self {
        NodeId([0xFF; ID_BYTES])
    }

    /// The midpoint of the space, 2^159
    pub fn mid() -> Self {
        Self::from_bit(ID_BITS - 1)
    }

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// The identifier 2^bit. `bit` 0 is the least significant bit.
    pub fn from_bit(bit: u32) -> Self {
        debug_assert!(bit < ID_BITS);
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 1 - (bit / 8) as usize] = 1 << (bit % 8);
        NodeId(bytes)
    }

    /// Small-integer identifiers, handy for tests and well-known keys
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 8..].copy_from_slice(&value.to_be_bytes());
        NodeId(bytes)
    }

    /// Digest arbitrary bytes into the id space (SHA-256 truncated to 160 bits)
    pub fn from_key_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest[..ID_BYTES]);
        NodeId(bytes)
    }

    /// Uniformly random identifier over the whole space
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rng.fill(&mut bytes[..]);
        NodeId(bytes)
    }

    /// Uniformly random identifier in the inclusive range `[low, high]`.
    ///
    /// The range must be a power-of-two aligned block, which is what bucket
    /// splitting produces; the low bound then fixes the shared prefix and the
    /// span bits can be randomized independently.
    pub fn random_within<R: Rng + ?Sized>(low: NodeId, high: NodeId, rng: &mut R) -> Self {
        let span = low ^ high;
        debug_assert!(span.is_low_mask(), "bucket range is not aligned");
        debug_assert!(low & span == NodeId::zero(), "bucket low overlaps span");
        low | (Self::random(rng) & span)
    }

    /// XOR distance to another identifier
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut result = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            result[i] = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }

    /// Count leading zero bits
    pub fn leading_zeros(&self) -> u32 {
        for (i, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return i as u32 * 8 + byte.leading_zeros();
            }
        }
        ID_BITS
    }

    /// Identifier with the lowest `bits` bits set
    pub fn low_mask(bits: u32) -> Self {
        debug_assert!(bits <= ID_BITS);
        let mut bytes = [0u8; ID_BYTES];
        let full_bytes = (bits / 8) as usize;
        for b in bytes.iter_mut().rev().take(full_bytes) {
            *b = 0xFF;
        }
        if bits % 8 != 0 {
            bytes[ID_BYTES - 1 - full_bytes] = (1 << (bits % 8)) - 1;
        }
        NodeId(bytes)
    }

    /// True when this id is of the form 2^n − 1 (an all-ones suffix)
    pub fn is_low_mask(&self) -> bool {
        *self == Self::low_mask(ID_BITS - self.leading_zeros())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let raw = hex::decode(text).map_err(|e| Error::Malformed(format!("bad id hex: {e}")))?;
        let bytes: [u8; ID_BYTES] = raw
            .try_into()
            .map_err(|_| Error::Malformed("id must be 160 bits".into()))?;
        Ok(NodeId(bytes))
    }
}

impl BitXor for NodeId {
    type Output = NodeId;
    fn bitxor(self, rhs: NodeId) -> NodeId {
        let mut out = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            out[i] = self.0[i] ^ rhs.0[i];
        }
        NodeId(out)
    }
}

impl BitAnd for NodeId {
    type Output = NodeId;
    fn bitand(self, rhs: NodeId) -> NodeId {
        let mut out = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            out[i] = self.0[i] & rhs.0[i];
        }
        NodeId(out)
    }
}

impl BitOr for NodeId {
    type Output = NodeId;
    fn bitor(self, rhs: NodeId) -> NodeId {
        let mut out = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            out[i] = self.0[i] | rhs.0[i];
        }
        NodeId(out)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}…)", &self.to_hex()[..12])
    }
}

/// XOR distance metric; ordered big-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; ID_BYTES]);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl BitOr for Distance {
    type Output = Distance;
    fn bitor(self, rhs: Distance) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            out[i] = self.0[i] | rhs.0[i];
        }
        Distance(out)
    }
}
