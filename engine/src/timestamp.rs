//! Hybrid Logical Clock timestamps.
//!
//! Every change in the system is stamped with a `(millis, counter, nodeId)`
//! triple. The triple orders totally across all devices, and its canonical
//! 16-byte encoding compares bytewise in exactly that order, so timestamps
//! can be compared, indexed, and range-scanned as plain blobs.

use std::cmp::Ordering;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TimestampError;
use crate::random::RandomSource;
use crate::time::Millis;

/// Upper bound of the 48-bit millisecond range. The top value is reserved.
pub const MAX_MILLIS: Millis = (1 << 48) - 2;

/// Default tolerated clock skew: five minutes.
pub const DEFAULT_MAX_DRIFT_MILLIS: Millis = 300_000;

/// Size of the canonical timestamp encoding.
pub const TIMESTAMP_LENGTH: usize = 16;

/// A 64-bit device identifier, displayed as 16 lowercase hex chars.
///
/// Generated once per device from cryptographic randomness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 8]);

impl NodeId {
    /// Allocate a fresh node id from 8 random bytes.
    pub fn generate(random: &dyn RandomSource) -> Self {
        let mut bytes = [0u8; 8];
        random.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a node id from its 16-hex-char text form.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::parse(&s).ok_or_else(|| D::Error::custom("expected 16 hex chars"))
    }
}

/// A Hybrid Logical Clock timestamp.
///
/// Total order: `(millis, counter, nodeId)` lexicographically. The counter
/// resets to 0 whenever the local-max millis advances, and a wrap past
/// 65535 within one millisecond is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    /// Physical time in milliseconds, at most [`MAX_MILLIS`].
    pub millis: Millis,
    /// Logical counter within one millisecond.
    pub counter: u16,
    /// Device identifier, the final tie-breaker.
    pub node_id: NodeId,
}

impl Timestamp {
    /// The zero timestamp for a node: the state before any local write.
    pub fn initial(node_id: NodeId) -> Self {
        Self {
            millis: 0,
            counter: 0,
            node_id,
        }
    }

    /// Allocate an initial timestamp with a fresh random node id.
    pub fn generate(random: &dyn RandomSource) -> Self {
        Self::initial(NodeId::generate(random))
    }

    /// Canonical 16-byte encoding: 6 bytes millis, 2 bytes counter, 8 bytes
    /// node id, all big-endian. Bytewise order equals semantic order.
    pub fn encode(&self) -> [u8; TIMESTAMP_LENGTH] {
        let mut out = [0u8; TIMESTAMP_LENGTH];
        out[0..6].copy_from_slice(&self.millis.to_be_bytes()[2..8]);
        out[6..8].copy_from_slice(&self.counter.to_be_bytes());
        out[8..16].copy_from_slice(&self.node_id.0);
        out
    }

    /// Decode a canonical 16-byte timestamp.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TIMESTAMP_LENGTH {
            return None;
        }
        let mut millis_bytes = [0u8; 8];
        millis_bytes[2..8].copy_from_slice(&bytes[0..6]);
        let mut node_id = [0u8; 8];
        node_id.copy_from_slice(&bytes[8..16]);
        Some(Self {
            millis: u64::from_be_bytes(millis_bytes),
            counter: u16::from_be_bytes([bytes[6], bytes[7]]),
            node_id: NodeId(node_id),
        })
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then(self.counter.cmp(&other.counter))
            .then(self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:013}:{:05}:{}", self.millis, self.counter, self.node_id)
    }
}

fn check_millis(millis: Millis) -> Result<Millis, TimestampError> {
    if millis > MAX_MILLIS {
        Err(TimestampError::TimeOutOfRange { millis })
    } else {
        Ok(millis)
    }
}

fn check_drift(
    next_millis: Millis,
    now: Millis,
    max_drift: Millis,
) -> Result<(), TimestampError> {
    let drift = next_millis.saturating_sub(now);
    if drift > max_drift {
        Err(TimestampError::Drift {
            next_millis,
            now,
            drift,
            max_drift,
        })
    } else {
        Ok(())
    }
}

fn increment_counter(counter: u16) -> Result<u16, TimestampError> {
    counter
        .checked_add(1)
        .ok_or(TimestampError::CounterOverflow)
}

/// Produce the timestamp for a local write.
///
/// `next_millis = max(now, local.millis)`; the counter increments when the
/// millisecond did not advance and resets otherwise.
pub fn send(
    local: &Timestamp,
    now: Millis,
    max_drift: Millis,
) -> Result<Timestamp, TimestampError> {
    let next_millis = check_millis(now.max(local.millis))?;
    check_drift(next_millis, now, max_drift)?;

    let counter = if next_millis == local.millis {
        increment_counter(local.counter)?
    } else {
        0
    };

    Ok(Timestamp {
        millis: next_millis,
        counter,
        node_id: local.node_id,
    })
}

/// Merge a remote timestamp into the local clock on receive.
///
/// A remote millis beyond `now + max_drift` is refused outright. Otherwise
/// `next_millis = max(now, local.millis, remote.millis)` and the counter is
/// continued from whichever side (or both) is at `next_millis`.
pub fn receive(
    local: &Timestamp,
    remote: &Timestamp,
    now: Millis,
    max_drift: Millis,
) -> Result<Timestamp, TimestampError> {
    check_millis(remote.millis)?;
    check_drift(remote.millis, now, max_drift)?;

    let next_millis = check_millis(now.max(local.millis).max(remote.millis))?;
    check_drift(next_millis, now, max_drift)?;

    let counter = if next_millis == local.millis && next_millis == remote.millis {
        increment_counter(local.counter.max(remote.counter))?
    } else if next_millis == local.millis {
        increment_counter(local.counter)?
    } else if next_millis == remote.millis {
        increment_counter(remote.counter)?
    } else {
        0
    };

    Ok(Timestamp {
        millis: next_millis,
        counter,
        node_id: local.node_id,
    })
}
