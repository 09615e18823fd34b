//! Merkle summary of change timestamps.
//!
//! A sparse ternary trie keyed by the base-3 digits of a timestamp's minute
//! (`floor(millis / 60_000)`). Every node holds the XOR of the 32-bit hashes
//! of all timestamps in its subtree, so two replicas can find the earliest
//! minute where their change sets diverge in O(log n) node comparisons and
//! then exchange only messages from that minute onward.
//!
//! Inserting the same timestamp twice cancels its hash; callers insert a
//! timestamp only when it is new to their store (the history table's primary
//! key is that guard).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

/// Base-3 digits per key. 3^17 minutes ≈ 245 years from the epoch, which
/// covers the whole 48-bit millisecond range in practice.
pub const KEY_LENGTH: usize = 17;

/// Milliseconds per tree bucket.
pub const MINUTE_MILLIS: u64 = 60_000;

/// A minute index: `floor(millis / 60_000)`.
pub type Minute = u64;

/// One node of the trie; the root value represents the whole tree.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MerkleTree {
    hash: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    children: BTreeMap<u8, MerkleTree>,
}

impl MerkleTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any timestamp has been inserted.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.hash == 0
    }

    /// The root hash.
    pub fn root_hash(&self) -> u32 {
        self.hash
    }

    /// Record a timestamp: XOR its hash into every node along the key path.
    pub fn insert(&mut self, timestamp: &Timestamp) {
        let hash = timestamp_hash(timestamp);
        let digits = minute_digits(timestamp.millis / MINUTE_MILLIS);

        let mut node = self;
        node.hash ^= hash;
        for digit in digits {
            node = node.children.entry(digit).or_default();
            node.hash ^= hash;
        }
    }

    /// Find the earliest minute where two trees diverge.
    ///
    /// Returns `None` when the trees are equal. The result is a lower bound:
    /// sending every message with `timestamp.millis >= minute * 60_000` is
    /// sufficient for the peer to converge.
    pub fn diff(&self, other: &MerkleTree) -> Option<Minute> {
        if self.hash == other.hash && self.children == other.children {
            return None;
        }

        const EMPTY: &MerkleTree = &MerkleTree {
            hash: 0,
            children: BTreeMap::new(),
        };

        let mut path = Vec::with_capacity(KEY_LENGTH);
        let (mut a, mut b) = (self, other);

        while path.len() < KEY_LENGTH {
            let divergent = (0u8..3).find(|digit| {
                let ha = a.children.get(digit).map(|c| c.hash);
                let hb = b.children.get(digit).map(|c| c.hash);
                ha != hb
            });

            match divergent {
                Some(digit) => {
                    path.push(digit);
                    a = a.children.get(&digit).unwrap_or(EMPTY);
                    b = b.children.get(&digit).unwrap_or(EMPTY);
                }
                None => break,
            }
        }

        Some(digits_to_minute(&path))
    }
}

/// 32-bit hash of a timestamp's canonical byte form (murmur3 finalizer mix).
fn timestamp_hash(timestamp: &Timestamp) -> u32 {
    let bytes = timestamp.encode();
    let mut h: u32 = 0x9747b28c;
    for chunk in bytes.chunks_exact(4) {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(0xcc9e2d51);
        k = k.rotate_left(15);
        k = k.wrapping_mul(0x1b873593);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe6546b64);
    }
    h ^= bytes.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^ (h >> 16)
}

/// Fixed-width big-endian base-3 digits of a minute index.
fn minute_digits(minute: Minute) -> [u8; KEY_LENGTH] {
    let mut digits = [0u8; KEY_LENGTH];
    let mut rest = minute;
    for slot in digits.iter_mut().rev() {
        *slot = (rest % 3) as u8;
        rest /= 3;
    }
    digits
}

/// Interpret a (possibly partial) digit path as a minute, padding with zeros.
fn digits_to_minute(path: &[u8]) -> Minute {
    let mut minute: u64 = 0;
    for i in 0..KEY_LENGTH {
        let digit = path.get(i).copied().unwrap_or(0);
        minute = minute * 3 + digit as u64;
    }
    minute
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::NodeId;

    fn ts(millis: u64, counter: u16) -> Timestamp {
        Timestamp {
            millis,
            counter,
            node_id: NodeId([1; 8]),
        }
    }

    #[test]
    fn digit_roundtrip() {
        for minute in [0u64, 1, 2, 3, 80, 28_000_000, 3u64.pow(17) - 1] {
            assert_eq!(digits_to_minute(&minute_digits(minute)), minute);
        }
    }

    #[test]
    fn equal_trees_diff_to_none() {
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        assert_eq!(a.diff(&b), None);

        for t in [ts(60_000, 0), ts(120_000, 3), ts(120_000, 4)] {
            a.insert(&t);
            b.insert(&t);
        }
        assert_eq!(a.diff(&b), None);
    }

    #[test]
    fn diff_finds_the_missing_minute() {
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();

        let shared = ts(5 * 60_000, 0);
        a.insert(&shared);
        b.insert(&shared);

        let only_a = ts(9 * 60_000, 0);
        a.insert(&only_a);

        let diff = a.diff(&b).expect("trees differ");
        assert!(diff <= 9);
        assert!(diff > 5, "shared prefix must not be re-sent");
    }

    #[test]
    fn diff_is_a_lower_bound_for_disjoint_trees() {
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        a.insert(&ts(100 * 60_000, 0));
        b.insert(&ts(700 * 60_000, 0));

        let diff = a.diff(&b).expect("trees differ");
        assert!(diff <= 100);
    }

    #[test]
    fn disjoint_from_minute_zero_diffs_to_zero() {
        let mut a = MerkleTree::new();
        a.insert(&ts(0, 0));
        let b = MerkleTree::new();
        assert_eq!(a.diff(&b), Some(0));
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let stamps = [
            ts(60_000, 0),
            ts(60_000, 1),
            ts(3_600_000, 0),
            ts(86_400_000, 9),
        ];

        let mut forward = MerkleTree::new();
        for t in &stamps {
            forward.insert(t);
        }
        let mut backward = MerkleTree::new();
        for t in stamps.iter().rev() {
            backward.insert(t);
        }

        assert_eq!(forward, backward);
    }

    #[test]
    fn same_minute_different_counter_still_detected() {
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        a.insert(&ts(60_000, 0));
        b.insert(&ts(60_000, 0));
        b.insert(&ts(60_000, 1));

        assert_eq!(a.diff(&b), Some(1));
    }

    #[test]
    fn serde_roundtrip() {
        let mut tree = MerkleTree::new();
        tree.insert(&ts(1_706_745_600_000, 7));
        tree.insert(&ts(1_706_745_660_000, 0));

        let json = serde_json::to_string(&tree).unwrap();
        let parsed: MerkleTree = serde_json::from_str(&json).unwrap();
        assert_eq!(tree, parsed);
    }
}
