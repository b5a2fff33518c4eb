//! Map/reduce result storage
//!
//! Durable storage of intermediate map and reduce outputs, addressed
//! by a caller-computed hash of (view, reduce key) for fast seeking,
//! with correctness preserved under hash collisions by re-verifying
//! the true fields on every read path. The operations live on
//! [`crate::store::StorageAccessor`], so they share the batch's
//! atomicity and isolation.

mod actions;
mod types;

pub use types::{
    compute_reduce_group_id, view_and_reduce_key_hash, GetMapReduceResults, MappedResultInfo,
    ReduceKeyAndGroupId, REDUCE_GROUP_BUCKETS,
};
