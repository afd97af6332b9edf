//! Batched uid assignment across shards.

use std::collections::HashMap;

use crate::cancel::CancelToken;
use crate::error::{Result, TernError};
use crate::worker::proto::{decode_uid_list, encode_xid_list};
use crate::worker::Worker;

impl Worker {
    /// Resolves every xid in `xid_to_uid` to its uid, routing each to
    /// the shard its fingerprint selects: the local shard directly, the
    /// rest over `Worker.GetOrAssign`. The reply is a uid list parallel
    /// to the request; a length mismatch means the peers disagree about
    /// the batch and is fatal.
    pub fn get_or_assign_over_network(
        &self,
        xid_to_uid: &mut HashMap<String, u64>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut by_shard: HashMap<u64, Vec<String>> = HashMap::new();
        for xid in xid_to_uid.keys() {
            by_shard
                .entry(self.router().xid_owner(xid))
                .or_default()
                .push(xid.clone());
        }

        for (shard, xids) in by_shard {
            let uids = if shard == self.router().shard() {
                self.assign_batch(&xids)?
            } else {
                let reply = self.pool_for(shard)?.call(
                    "Worker.GetOrAssign",
                    &encode_xid_list(&xids),
                    cancel,
                )?;
                decode_uid_list(&reply)?
            };
            if uids.len() != xids.len() {
                return Err(TernError::Corruption(format!(
                    "asked shard {shard} for {} uids, got {}",
                    xids.len(),
                    uids.len()
                )));
            }
            for (xid, uid) in xids.into_iter().zip(uids) {
                xid_to_uid.insert(xid, uid);
            }
        }
        Ok(())
    }
}
