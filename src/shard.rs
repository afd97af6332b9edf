//! Predicate-based shard routing.
//!
//! Every key is owned by exactly one instance: the one whose index equals
//! `fingerprint64(predicate) % num_instances`. Grouping by predicate keeps
//! all postings of one predicate co-resident, so per-predicate scans and
//! indexes never cross instances.

use xxhash_rust::xxh64::xxh64;

/// The stable 64-bit fingerprint used for uid derivation and routing.
pub fn fingerprint64(data: &[u8]) -> u64 {
    xxh64(data, 0)
}

#[derive(Debug, Clone, Copy)]
pub struct ShardRouter {
    shard: u64,
    num_shards: u64,
}

impl ShardRouter {
    pub fn new(shard: u64, num_shards: u64) -> Self {
        assert!(num_shards > 0, "at least one shard");
        assert!(shard < num_shards, "shard index within range");
        ShardRouter { shard, num_shards }
    }

    pub fn shard(&self) -> u64 {
        self.shard
    }

    pub fn num_shards(&self) -> u64 {
        self.num_shards
    }

    /// The shard owning `attribute`.
    pub fn owner_of(&self, attribute: &str) -> u64 {
        fingerprint64(attribute.as_bytes()) % self.num_shards
    }

    pub fn is_local_attr(&self, attribute: &str) -> bool {
        self.owner_of(attribute) == self.shard
    }

    /// The shard responsible for assigning `xid`.
    pub fn xid_owner(&self, xid: &str) -> u64 {
        fingerprint64(xid.as_bytes()) % self.num_shards
    }

    pub fn is_local_xid(&self, xid: &str) -> bool {
        self.xid_owner(xid) == self.shard
    }
}
