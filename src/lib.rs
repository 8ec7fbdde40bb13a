//! # Arbor
//!
//! A DAG-based distributed ledger node with:
//! - **BFT-finalized main chain** — a fixed committee of coordinators runs a
//!   Tendermint-style propose/prevote/precommit protocol to finalize TrustME
//!   marker units that anchor main-chain stability
//! - **Atomic unit commits** — every unit lands with its authors, messages,
//!   payment bookkeeping, and graph-position fields in one storage batch
//! - **Round-scoped committees** — coordinator witness lists are resolved per
//!   round from the ledger itself
//! - **Single-owner consensus state** — all protocol transitions funnel
//!   through one actor task; no locks around consensus state

pub mod config;
pub mod consensus;
pub mod events;
pub mod gossip;
pub mod identity;
pub mod ledger;
pub mod node;
pub mod round;

/// Protocol constants
pub mod constants {
    /// Number of coordinators in the BFT committee (N)
    pub const TOTAL_COORDINATORS: usize = 10;
    /// Maximum tolerated Byzantine coordinators: f = (N-1)/3
    pub const TOTAL_BYZANTINE: usize = (TOTAL_COORDINATORS - 1) / 3;
    /// Supermajority quorum: 2f+1
    pub const BFT_QUORUM: usize = TOTAL_BYZANTINE * 2 + 1;
    /// Weak quorum f+1, enough evidence to skip ahead to a higher phase
    pub const WEAK_QUORUM: usize = TOTAL_BYZANTINE + 1;
    /// Base timeout before reacting to a silent proposer (ms)
    pub const BYZANTINE_GST_MS: u64 = 10_000;
    /// Per-phase timeout increment (ms); timeout(p) = GST + DELTA * p
    pub const BYZANTINE_DELTA_MS: u64 = 1_000;
    /// Fixed additive constant in the proposer rotation
    /// `|h + offset - p| mod N`. Shared by every node; changing it is a
    /// consensus-breaking change.
    pub const PROPOSER_ROTATION_OFFSET: u64 = 999;
    /// Heights of consensus records retained behind the current height
    pub const MAX_HEIGHTS_IN_CACHE: u64 = 10;
    /// Rounds of witness lists retained in the oracle cache
    pub const MAX_ROUNDS_IN_CACHE: u64 = 10;
    /// Maximum parent references per unit
    pub const MAX_PARENTS: usize = 16;
    /// Commits between storage statistics refreshes
    pub const STATS_REFRESH_EVERY: u64 = 100;
    /// Unit-count ceiling above which statistics refreshes are skipped
    pub const STATS_REFRESH_MAX_UNITS: u64 = 500_000;
    /// Period of the consensus/round cache eviction timer (ms)
    pub const CACHE_SHRINK_INTERVAL_MS: u64 = 60_000;
    /// Maximum encoded gossip message size (16 MiB)
    pub const MAX_GOSSIP_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Buffered pending-gossip messages kept per future height
    pub const MAX_PENDING_GOSSIP_PER_HEIGHT: usize = 64;
    /// Capacity of the in-process event bus and gossip topics
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
    /// Capacity of the consensus engine inbox
    pub const ENGINE_INBOX_CAPACITY: usize = 1024;

    /// Compute the BFT timeout for a phase.
    pub fn phase_timeout_ms(phase: u32) -> u64 {
        BYZANTINE_GST_MS + BYZANTINE_DELTA_MS * phase as u64
    }
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
pub fn hash_domain(domain: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_GOSSIP_MESSAGE_BYTES` to prevent OOM from
/// malicious oversized payloads.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_GOSSIP_MESSAGE_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_domain_deterministic() {
        let a = hash_domain("arbor.test", b"hello");
        let b = hash_domain("arbor.test", b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_domain_different_domains() {
        let a = hash_domain("arbor.domain_a", b"data");
        let b = hash_domain("arbor.domain_b", b"data");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_concat_length_prefix_prevents_ambiguity() {
        let ab_c = hash_concat(&[b"ab", b"c"]);
        let a_bc = hash_concat(&[b"a", b"bc"]);
        assert_ne!(ab_c, a_bc);
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let original: Vec<u8> = vec![1, 2, 3, 4, 5];
        let bytes = serialize(&original).unwrap();
        let restored: Vec<u8> = deserialize(&bytes).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn deserialize_rejects_oversized_input() {
        let oversized = vec![0u8; constants::MAX_GOSSIP_MESSAGE_BYTES + 1];
        let result = deserialize::<Vec<u8>>(&oversized);
        assert!(result.is_err(), "oversized input should be rejected");
    }

    #[test]
    fn quorum_constants_consistent() {
        // N = 10 gives f = 3, Q = 7, W = 4.
        assert_eq!(constants::TOTAL_BYZANTINE, 3);
        assert_eq!(constants::BFT_QUORUM, 7);
        assert_eq!(constants::WEAK_QUORUM, 4);
        assert!(constants::BFT_QUORUM <= constants::TOTAL_COORDINATORS);
    }

    #[test]
    fn phase_timeout_grows_linearly() {
        let t0 = constants::phase_timeout_ms(0);
        let t3 = constants::phase_timeout_ms(3);
        assert_eq!(t0, constants::BYZANTINE_GST_MS);
        assert_eq!(
            t3,
            constants::BYZANTINE_GST_MS + 3 * constants::BYZANTINE_DELTA_MS
        );
    }
}
