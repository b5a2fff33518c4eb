//! Map/reduce value types and key derivation helpers
//!
//! The composite hash and the reduce group id are computed by the
//! caller of the storage contract; the helpers here are the reference
//! implementations and are stable across process restarts (the same
//! view and reduce key always hash identically).

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Number of buckets reduce keys are partitioned into.
pub const REDUCE_GROUP_BUCKETS: u32 = 1024;

/// Case-insensitive string equality, consistent with the store's text
/// collation.
pub(crate) fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// A reduce key paired with its group id.
///
/// Equality and hashing are case-insensitive on the key and exact on
/// the group id; the type is used as a map/set key by the reduce
/// scheduler, so this contract must stay stable.
#[derive(Debug, Clone)]
pub struct ReduceKeyAndGroupId {
    pub reduce_key: String,
    pub reduce_group_id: i32,
}

impl ReduceKeyAndGroupId {
    pub fn new(reduce_key: impl Into<String>, reduce_group_id: i32) -> ReduceKeyAndGroupId {
        ReduceKeyAndGroupId {
            reduce_key: reduce_key.into(),
            reduce_group_id,
        }
    }
}

impl PartialEq for ReduceKeyAndGroupId {
    fn eq(&self, other: &ReduceKeyAndGroupId) -> bool {
        self.reduce_group_id == other.reduce_group_id
            && eq_ignore_case(&self.reduce_key, &other.reduce_key)
    }
}

impl Eq for ReduceKeyAndGroupId {}

impl Hash for ReduceKeyAndGroupId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.reduce_key.to_lowercase().hash(state);
        self.reduce_group_id.hash(state);
    }
}

impl fmt::Display for ReduceKeyAndGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[reduce_key: {}, reduce_group_id: {}]",
            self.reduce_key, self.reduce_group_id
        )
    }
}

/// One lookup request against the mapped or reduce result tables.
#[derive(Debug, Clone)]
pub struct GetMapReduceResults {
    pub view: String,
    pub reduce_key: ReduceKeyAndGroupId,
    pub view_and_reduce_key_hashed: [u8; 16],
}

impl GetMapReduceResults {
    pub fn new(
        view: impl Into<String>,
        reduce_key: ReduceKeyAndGroupId,
        view_and_reduce_key_hashed: [u8; 16],
    ) -> GetMapReduceResults {
        GetMapReduceResults {
            view: view.into(),
            reduce_key,
            view_and_reduce_key_hashed,
        }
    }
}

/// One row yielded by the reduce-key cursor.
#[derive(Debug, Clone)]
pub struct MappedResultInfo {
    pub reduce_key: String,
    pub reduce_group_id: i32,
    pub etag: u64,
    pub timestamp: DateTime<Utc>,
    /// Present only when the cursor was asked to load payloads.
    pub data: Option<serde_json::Value>,
}

/// The composite seek key for (view, reduce key): a fixed-width hash,
/// collision-prone by construction, so read paths must re-verify the
/// true fields after seeking with it.
pub fn view_and_reduce_key_hash(view: &str, reduce_key: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(view.to_lowercase().as_bytes());
    hasher.update([0u8]);
    hasher.update(reduce_key.to_lowercase().as_bytes());
    let digest = hasher.finalize();
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&digest[..16]);
    hash
}

/// Deterministic bucket for a reduce key, used to bound composite
/// index entries and partition reduce work.
pub fn compute_reduce_group_id(reduce_key: &str) -> i32 {
    let checksum = crate::engine::compute_checksum(reduce_key.to_lowercase().as_bytes());
    (checksum % REDUCE_GROUP_BUCKETS) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn reduce_key_equality_is_case_insensitive() {
        let a = ReduceKeyAndGroupId::new("Category/Books", 7);
        let b = ReduceKeyAndGroupId::new("category/books", 7);
        let c = ReduceKeyAndGroupId::new("category/books", 8);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn composite_hash_is_stable_and_key_sensitive() {
        let h1 = view_and_reduce_key_hash("idx1", "A");
        let h2 = view_and_reduce_key_hash("idx1", "A");
        let h3 = view_and_reduce_key_hash("idx1", "B");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        // case variants of the same logical key hash identically
        assert_eq!(h1, view_and_reduce_key_hash("IDX1", "a"));
    }

    #[test]
    fn group_ids_are_deterministic_and_bucketed() {
        let g = compute_reduce_group_id("some reduce key");
        assert_eq!(g, compute_reduce_group_id("SOME REDUCE KEY"));
        assert!(g >= 0);
        assert!((g as u32) < REDUCE_GROUP_BUCKETS);
    }
}
