//! 160-bit node identifiers and the XOR distance metric.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Width in bytes of a node identifier (SHA-1 output size).
pub const ID_LEN: usize = 20;

/// A 160-bit identifier, either a node's own id or a lookup target.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// Wraps a raw 20-byte id.
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The SHA-1 digest of `data`, used both for node ids and key digests.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let out = hasher.finalize();
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&out);
        Self(bytes)
    }

    /// A fresh random id, used for node ids and rpc nonces alike.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// XOR distance to another id, interpreted as an unsigned integer.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Index of the highest set bit of `self XOR zero`, i.e. which bucket
    /// range an id this far from another id would fall into. Bit 0 is the
    /// most significant bit of the first byte.
    pub fn shared_prefix_len(&self, other: &NodeId) -> u32 {
        self.distance(other).leading_zero_bits()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The XOR distance between two [`NodeId`]s, ordered as an unsigned
/// 160-bit integer: lower is closer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_LEN]);

    /// Number of leading zero bits, i.e. `160 - bit_length`.
    pub fn leading_zero_bits(&self) -> u32 {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return (i as u32) * 8 + byte.leading_zeros();
            }
        }
        (ID_LEN as u32) * 8
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}
