//! Deterministic xid -> uid assignment.
//!
//! A uid is the 64-bit fingerprint of its xid; the scalar sentinel and
//! fingerprint collisions are resolved by appending spaces to the hashed
//! text until a vacant slot is found. The mapping is stored both ways:
//! the forward edge under the xid namespace and the reverse edge under
//! the reserved `_xid_` attribute.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, TernError};
use crate::keys;
use crate::model::{now_nanos, DirectedEdge, Op, TypedValue, ASSIGNER_SOURCE, MAX_UID, XID_ATTR};
use crate::posting::{PostingList, Postings};
use crate::shard::fingerprint64;

/// The capability the assigner needs from the posting engine: probe and
/// mutate lists by key. Keeps the engine from depending on the assigner
/// that is layered on top of it.
pub trait ListStore: Send + Sync {
    fn list(&self, key: &[u8]) -> Arc<PostingList>;
}

impl ListStore for Postings {
    fn list(&self, key: &[u8]) -> Arc<PostingList> {
        self.get_or_create(key)
    }
}

pub struct UidAssigner {
    lists: Arc<dyn ListStore>,
}

impl UidAssigner {
    pub fn new(lists: Arc<dyn ListStore>) -> Self {
        UidAssigner { lists }
    }

    /// Finds or claims the uid slot for `xid`, writing the reverse
    /// `_xid_` edge. The stored value is always the original xid, never
    /// the padded probe text, so the mapping round-trips verbatim.
    fn allocate_new(&self, xid: &str) -> Result<u64> {
        let mut probe = xid.to_string();
        loop {
            let uid = fingerprint64(probe.as_bytes());
            if uid == MAX_UID {
                // Reserved for scalar postings.
                probe.push(' ');
                continue;
            }
            let list = self.lists.list(&keys::data_key(uid, XID_ATTR));
            if list.length()? > 0 {
                let existing = list
                    .get(0)?
                    .ok_or_else(|| TernError::Corruption("xid slot vanished mid-read".into()))?;
                if existing.value == xid.as_bytes() {
                    // A previous allocation got this far; reuse it.
                    return Ok(uid);
                }
                debug!(uid, xid, "fingerprint collision, padding and retrying");
                probe.push(' ');
                continue;
            }
            let edge = DirectedEdge::to_value(
                uid,
                XID_ATTR,
                TypedValue::Str(xid.to_string()),
                ASSIGNER_SOURCE,
                now_nanos(),
            );
            list.add_mutation(&edge, Op::Set)?;
            return Ok(uid);
        }
    }

    /// Stable xid -> uid lookup, assigning on first sight. Fails with
    /// `WrongShard` when `xid` fingerprints to another instance; a
    /// forward list with more than one posting is corruption.
    pub fn get_or_assign(&self, xid: &str, shard: u64, num_shards: u64) -> Result<u64> {
        if xid.is_empty() {
            return Err(TernError::InvalidOp("empty xid not allowed".into()));
        }
        let owner = fingerprint64(xid.as_bytes()) % num_shards;
        if owner != shard {
            return Err(TernError::WrongShard(format!(
                "xid {xid:?} belongs to shard {owner}, not {shard}"
            )));
        }

        let list = self.lists.list(&keys::xid_key(xid));
        match list.length()? {
            0 => {
                let uid = self.allocate_new(xid)?;
                let edge =
                    DirectedEdge::to_uid(0, "_uid_", uid, ASSIGNER_SOURCE, now_nanos());
                list.add_mutation(&edge, Op::Set)?;
                Ok(uid)
            }
            1 => {
                let posting = list
                    .get(0)?
                    .ok_or_else(|| TernError::Corruption("forward list vanished mid-read".into()))?;
                Ok(posting.uid)
            }
            n => Err(TernError::Corruption(format!(
                "xid {xid:?} has {n} uid postings"
            ))),
        }
    }

    /// Reverse lookup: the xid stored for `uid`.
    pub fn external_id(&self, uid: u64) -> Result<String> {
        let list = self.lists.list(&keys::data_key(uid, XID_ATTR));
        match list.length()? {
            0 => Err(TernError::NotFound("external id")),
            1 => {
                let posting = list
                    .get(0)?
                    .ok_or_else(|| TernError::Corruption("xid list vanished mid-read".into()))?;
                if posting.uid != MAX_UID {
                    return Err(TernError::Corruption(format!(
                        "xid posting for uid {uid} is not a scalar"
                    )));
                }
                String::from_utf8(posting.value)
                    .map_err(|_| TernError::Corruption("non-utf8 xid".into()))
            }
            n => Err(TernError::Corruption(format!(
                "uid {uid} has {n} external ids"
            ))),
        }
    }
}
