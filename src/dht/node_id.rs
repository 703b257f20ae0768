//! 160-bit node identifiers and the XOR distance metric.
//!
//! Feynman: think of every node's id as a point in a 160-bit address space.
//! XOR distance doesn't care about "left" or "right" the way subtraction
//! does — it only counts differing bits — which is what makes it a metric
//! that every node can compute about every other node without a shared
//! frame of reference.

use std::fmt;

use sha1::{Digest, Sha1};

pub const ID_BYTES: usize = 20;
pub const ID_BITS: u32 = (ID_BYTES * 8) as u32;
pub const NUM_BUCKETS: usize = ID_BITS as usize;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; ID_BYTES]);

impl NodeId {
    pub fn zero() -> Self {
        NodeId([0u8; ID_BYTES])
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        for b in bytes.iter_mut() {
            *b = rand::random();
        }
        NodeId(bytes)
    }

    /// Derives a NodeID from an arbitrary string by hashing to 20 bytes.
    ///
    /// SHA-1 is used for interop with existing peers per the compatibility
    /// note in the overlay's design notes — not a security claim.
    pub fn from_string(s: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(s.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest[..ID_BYTES]);
        NodeId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != ID_BYTES {
            return None;
        }
        let mut arr = [0u8; ID_BYTES];
        arr.copy_from_slice(&bytes);
        Some(NodeId(arr))
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance(pub [u8; ID_BYTES]);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Position of the highest set bit, 1-indexed (python's `int.bit_length`).
    /// Zero for an all-zero distance.
    pub fn bit_length(&self) -> u32 {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let byte_bit_len = 8 - byte.leading_zeros();
                let bytes_after = (ID_BYTES - i - 1) as u32;
                return byte_bit_len + bytes_after * 8;
            }
        }
        0
    }

    /// `bits - distance.bit_length()`, with the `distance == 0` special case
    /// routed to bucket 0 — see the open-question resolution in DESIGN.md.
    pub fn bucket_index(&self) -> usize {
        if self.is_zero() {
            return 0;
        }
        (ID_BITS - self.bit_length()) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric_and_self_distance_is_zero() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(a.distance(&a).is_zero());
    }

    #[test]
    fn zero_distance_implies_equal_ids() {
        let a = NodeId::random();
        let b = a;
        assert!(a.distance(&b).is_zero());
        assert_eq!(a, b);
    }

    #[test]
    fn bucket_index_for_self_is_zero() {
        let a = NodeId::random();
        assert_eq!(a.distance(&a).bucket_index(), 0);
    }

    #[test]
    fn bucket_index_for_lowest_bit_distance_is_highest_bucket() {
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 1] = 1;
        let d = Distance(bytes);
        assert_eq!(d.bit_length(), 1);
        assert_eq!(d.bucket_index(), NUM_BUCKETS - 1);
    }

    #[test]
    fn from_string_is_deterministic() {
        assert_eq!(NodeId::from_string("agent:a1"), NodeId::from_string("agent:a1"));
    }
}
